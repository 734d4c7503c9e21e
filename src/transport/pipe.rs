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

//! An in-memory transport connecting two stacks in the same process.

use async_channel::{Receiver, Sender};

use crate::error::*;

use super::network::{Address, NetworkReceive, NetworkSend};

pub const PIPE_CAPACITY: usize = 16;

/// One end of a bidirectional in-memory datagram link.
pub struct Pipe {
    local: Address,
    peer: Address,
    tx: Sender<(Address, Vec<u8>)>,
    rx: Receiver<(Address, Vec<u8>)>,
}

impl Pipe {
    /// Creates two connected ends. Datagrams sent by one end are received by
    /// the other as coming from the sender's address.
    pub fn pair(a: Address, b: Address) -> (Self, Self) {
        let (a_tx, b_rx) = async_channel::bounded(PIPE_CAPACITY);
        let (b_tx, a_rx) = async_channel::bounded(PIPE_CAPACITY);

        (
            Self {
                local: a,
                peer: b,
                tx: a_tx,
                rx: a_rx,
            },
            Self {
                local: b,
                peer: a,
                tx: b_tx,
                rx: b_rx,
            },
        )
    }

    pub fn local_addr(&self) -> Address {
        self.local
    }

    pub fn peer_addr(&self) -> Address {
        self.peer
    }

    pub fn close(&self) {
        self.tx.close();
    }
}

impl NetworkSend for &Pipe {
    async fn send_to(&mut self, data: &[u8], addr: Address) -> Result<(), Error> {
        if addr != self.peer {
            Err(ErrorCode::InvalidPeerAddr)?;
        }

        self.tx
            .send((self.local, data.to_vec()))
            .await
            .map_err(|_| ErrorCode::ChannelClosed)?;

        Ok(())
    }
}

impl NetworkReceive for &Pipe {
    async fn recv_from(&mut self, buffer: &mut [u8]) -> Result<(usize, Address), Error> {
        let (addr, data) = self.rx.recv().await.map_err(|_| ErrorCode::ChannelClosed)?;

        if data.len() > buffer.len() {
            Err(ErrorCode::BufferTooSmall)?;
        }

        buffer[..data.len()].copy_from_slice(&data);

        Ok((data.len(), addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair() {
        let a = Address::Udp("[fd00::1]:5540".parse().unwrap());
        let b = Address::Udp("[fd00::2]:5540".parse().unwrap());
        let (pa, pb) = Pipe::pair(a, b);

        futures_lite::future::block_on(async {
            NetworkSend::send_to(&mut &pa, &[9, 8, 7], b).await.unwrap();

            let mut buf = [0; 8];
            let (len, from) = NetworkReceive::recv_from(&mut &pb, &mut buf).await.unwrap();
            assert_eq!(&buf[..len], [9, 8, 7]);
            assert_eq!(from, a);

            assert!(NetworkSend::send_to(&mut &pa, &[1], a).await.is_err());

            pb.close();
            assert_eq!(
                NetworkReceive::recv_from(&mut &pa, &mut buf)
                    .await
                    .map_err(|e| e.code()),
                Err(ErrorCode::ChannelClosed)
            );
        });
    }
}
