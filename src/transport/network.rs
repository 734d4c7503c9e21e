/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

use core::fmt::{self, Debug, Display};

pub use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::Error;

/// Maximum UDP RX packet size
pub const MAX_RX_PACKET_SIZE: usize = 1583;

/// Maximum UDP TX packet size
pub const MAX_TX_PACKET_SIZE: usize = 1280 - 40/*IPV6 header size*/ - 8/*UDP header size*/;

/// Maximum TCP frame size
pub const MAX_RX_LARGE_PACKET_SIZE: usize = 1024 * 1024;

/// The Matter port
pub const MATTER_PORT: u16 = 5540;

/// A Bluetooth LE device address.
#[derive(Eq, PartialEq, Copy, Clone, Hash, Default)]
pub struct BtAddr(pub [u8; 6]);

impl Display for BtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl Debug for BtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// The address of a peer, tagged with the transport it is reachable over.
#[derive(Eq, PartialEq, Copy, Clone, Hash)]
pub enum Address {
    Udp(SocketAddr),
    Tcp(SocketAddr),
    Ble(BtAddr),
}

impl Address {
    pub const fn new() -> Self {
        Self::Udp(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0))
    }

    /// Whether the transport itself guarantees delivery. MRP is not used on
    /// reliable transports.
    pub fn is_reliable(&self) -> bool {
        matches!(self, Self::Tcp(_) | Self::Ble(_))
    }

    pub fn is_multicast(&self) -> bool {
        match self {
            Self::Udp(addr) | Self::Tcp(addr) => addr.ip().is_multicast(),
            Self::Ble(_) => false,
        }
    }

    pub fn udp(&self) -> Option<SocketAddr> {
        match self {
            Self::Udp(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn tcp(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn ble(&self) -> Option<BtAddr> {
        match self {
            Self::Ble(addr) => Some(*addr),
            _ => None,
        }
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Udp(addr) => write!(f, "UDP {}", addr),
            Address::Tcp(addr) => write!(f, "TCP {}", addr),
            Address::Ble(addr) => write!(f, "BLE {}", addr),
        }
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// How a failed send should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// The transport is unusable; the error is propagated.
    Critical,
    /// The datagram is lost but the transport is fine; the error is logged.
    Ignorable,
}

/// Classifies an OS send error. Multicast sends routinely fail on
/// interfaces without a route; those are not fatal.
pub fn classify_send_error(err: &std::io::Error, multicast: bool) -> SendErrorKind {
    use std::io::ErrorKind;

    if !multicast {
        return SendErrorKind::Critical;
    }

    // ENETUNREACH, EHOSTUNREACH and EADDRNOTAVAIL do not have stable
    // ErrorKind variants on every toolchain
    const ENETUNREACH: i32 = 101;
    const EHOSTUNREACH: i32 = 113;
    const EADDRNOTAVAIL: i32 = 99;

    match err.kind() {
        ErrorKind::AddrNotAvailable => SendErrorKind::Ignorable,
        _ if matches!(
            err.raw_os_error(),
            Some(ENETUNREACH | EHOSTUNREACH | EADDRNOTAVAIL)
        ) =>
        {
            SendErrorKind::Ignorable
        }
        _ => SendErrorKind::Critical,
    }
}

pub trait NetworkSend {
    async fn send_to(&mut self, data: &[u8], addr: Address) -> Result<(), Error>;
}

impl<T> NetworkSend for &mut T
where
    T: NetworkSend,
{
    async fn send_to(&mut self, data: &[u8], addr: Address) -> Result<(), Error> {
        (*self).send_to(data, addr).await
    }
}

pub trait NetworkReceive {
    async fn recv_from(&mut self, buffer: &mut [u8]) -> Result<(usize, Address), Error>;
}

impl<T> NetworkReceive for &mut T
where
    T: NetworkReceive,
{
    async fn recv_from(&mut self, buffer: &mut [u8]) -> Result<(usize, Address), Error> {
        (*self).recv_from(buffer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliability() {
        let udp = Address::Udp("[::1]:5540".parse().unwrap());
        let tcp = Address::Tcp("[::1]:5540".parse().unwrap());
        let ble = Address::Ble(BtAddr([1, 2, 3, 4, 5, 6]));

        assert!(!udp.is_reliable());
        assert!(tcp.is_reliable());
        assert!(ble.is_reliable());
        assert_eq!(format!("{}", ble), "BLE 01:02:03:04:05:06");
    }

    #[test]
    fn test_send_error_classification() {
        let err = std::io::Error::from_raw_os_error(101);
        assert_eq!(classify_send_error(&err, true), SendErrorKind::Ignorable);
        assert_eq!(classify_send_error(&err, false), SendErrorKind::Critical);

        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(classify_send_error(&err, true), SendErrorKind::Critical);
    }
}
