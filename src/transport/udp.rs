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

//! UDP transport over `async-io`.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use async_io::Async;
use log::{info, warn};

use crate::error::*;

use super::network::{
    classify_send_error, Address, IpAddr, NetworkReceive, NetworkSend, SendErrorKind,
};

/// Binds a dual-stack UDP socket on all interfaces.
pub fn bind(port: u16) -> Result<Async<UdpSocket>, Error> {
    let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
    let socket = Async::<UdpSocket>::bind(addr)?;

    info!("UDP transport bound to {}", socket.get_ref().local_addr()?);

    Ok(socket)
}

pub fn join_multicast_v6(socket: &Async<UdpSocket>, addr: Ipv6Addr, interface: u32) -> Result<(), Error> {
    socket.get_ref().join_multicast_v6(&addr, interface)?;
    info!("Joined IPv6 multicast group {}", addr);

    Ok(())
}

pub fn leave_multicast_v6(socket: &Async<UdpSocket>, addr: Ipv6Addr, interface: u32) -> Result<(), Error> {
    socket.get_ref().leave_multicast_v6(&addr, interface)?;
    info!("Left IPv6 multicast group {}", addr);

    Ok(())
}

pub fn join_multicast_v4(
    socket: &Async<UdpSocket>,
    addr: Ipv4Addr,
    interface: Ipv4Addr,
) -> Result<(), Error> {
    socket.get_ref().join_multicast_v4(&addr, &interface)?;
    info!("Joined IPv4 multicast group {}", addr);

    Ok(())
}

pub fn leave_multicast_v4(
    socket: &Async<UdpSocket>,
    addr: Ipv4Addr,
    interface: Ipv4Addr,
) -> Result<(), Error> {
    socket.get_ref().leave_multicast_v4(&addr, &interface)?;
    info!("Left IPv4 multicast group {}", addr);

    Ok(())
}

impl NetworkSend for &Async<UdpSocket> {
    async fn send_to(&mut self, data: &[u8], addr: Address) -> Result<(), Error> {
        let peer = addr.udp().ok_or(ErrorCode::InvalidPeerAddr)?;

        match Async::<UdpSocket>::send_to(self, data, peer).await {
            Ok(_) => Ok(()),
            Err(e) => match classify_send_error(&e, addr.is_multicast()) {
                SendErrorKind::Ignorable => {
                    warn!("Multicast send to {} failed, ignoring: {}", addr, e);
                    Ok(())
                }
                SendErrorKind::Critical => Err(e.into()),
            },
        }
    }
}

impl NetworkReceive for &Async<UdpSocket> {
    async fn recv_from(&mut self, buffer: &mut [u8]) -> Result<(usize, Address), Error> {
        let (len, addr) = Async::<UdpSocket>::recv_from(self, buffer).await?;

        Ok((len, Address::Udp(addr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback() {
        futures_lite::future::block_on(async {
            let a = Async::<UdpSocket>::bind(([127, 0, 0, 1], 0)).unwrap();
            let b = Async::<UdpSocket>::bind(([127, 0, 0, 1], 0)).unwrap();
            let b_addr = Address::Udp(b.get_ref().local_addr().unwrap());

            NetworkSend::send_to(&mut &a, &[1, 2, 3], b_addr)
                .await
                .unwrap();

            let mut buf = [0; 16];
            let (len, from) = NetworkReceive::recv_from(&mut &b, &mut buf).await.unwrap();
            assert_eq!(&buf[..len], [1, 2, 3]);
            assert_eq!(from, Address::Udp(a.get_ref().local_addr().unwrap()));
        });
    }

    #[test]
    fn test_wrong_address_kind() {
        futures_lite::future::block_on(async {
            let a = Async::<UdpSocket>::bind(([127, 0, 0, 1], 0)).unwrap();
            let tcp = Address::Tcp("127.0.0.1:5540".parse().unwrap());

            assert_eq!(
                NetworkSend::send_to(&mut &a, &[1], tcp)
                    .await
                    .map_err(|e| e.code()),
                Err(ErrorCode::InvalidPeerAddr)
            );
        });
    }
}
