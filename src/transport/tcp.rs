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

//! TCP transport over `async-io`.
//!
//! Each message travels as one frame: a 4-byte little endian length followed
//! by the message. Connections are opened on first send and accepted on the
//! listener; both kinds land in the same per-peer table.

use core::cell::RefCell;
use core::task::Poll;

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::rc::Rc;

use async_io::Async;
use futures_lite::io::{AsyncReadExt, AsyncWriteExt};
use log::{debug, info, warn};

use crate::error::*;

use super::network::{Address, NetworkReceive, NetworkSend, MAX_RX_LARGE_PACKET_SIZE};

const FRAME_LEN_SIZE: usize = 4;

type Conn = Rc<Async<TcpStream>>;

enum Readiness {
    Accept,
    Conn(SocketAddr, Conn),
}

pub struct TcpNetwork {
    listener: Option<Async<TcpListener>>,
    conns: RefCell<Vec<(SocketAddr, Conn)>>,
}

impl TcpNetwork {
    /// A client-only transport: it connects out but accepts nothing.
    pub fn new() -> Self {
        Self {
            listener: None,
            conns: RefCell::new(Vec::new()),
        }
    }

    pub fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let listener = Async::<TcpListener>::bind(addr)?;
        info!("TCP transport listening on {}", listener.get_ref().local_addr()?);

        Ok(Self {
            listener: Some(listener),
            conns: RefCell::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|l| l.get_ref().local_addr().ok())
    }

    pub fn connections(&self) -> usize {
        self.conns.borrow().len()
    }

    fn find(&self, addr: &SocketAddr) -> Option<Conn> {
        self.conns
            .borrow()
            .iter()
            .find(|(a, _)| a == addr)
            .map(|(_, conn)| conn.clone())
    }

    fn insert(&self, addr: SocketAddr, conn: Conn) {
        let mut conns = self.conns.borrow_mut();
        conns.retain(|(a, _)| *a != addr);
        conns.push((addr, conn));
    }

    fn remove(&self, addr: &SocketAddr) {
        debug!("Dropping TCP connection to {}", addr);
        self.conns.borrow_mut().retain(|(a, _)| a != addr);
    }

    async fn connection(&self, addr: SocketAddr) -> Result<Conn, Error> {
        if let Some(conn) = self.find(&addr) {
            return Ok(conn);
        }

        let stream = Async::<TcpStream>::connect(addr).await?;
        info!("TCP connection to {} established", addr);

        let conn = Rc::new(stream);
        self.insert(addr, conn.clone());

        Ok(conn)
    }

    async fn wait_readable(&self) -> Readiness {
        futures_lite::future::poll_fn(|cx| {
            if let Some(listener) = self.listener.as_ref() {
                if listener.poll_readable(cx).is_ready() {
                    return Poll::Ready(Readiness::Accept);
                }
            }

            for (addr, conn) in self.conns.borrow().iter() {
                if conn.poll_readable(cx).is_ready() {
                    return Poll::Ready(Readiness::Conn(*addr, conn.clone()));
                }
            }

            Poll::Pending
        })
        .await
    }

    async fn read_frame(conn: &Conn, buffer: &mut [u8]) -> Result<usize, Error> {
        let mut stream: &Async<TcpStream> = conn;

        let mut len = [0; FRAME_LEN_SIZE];
        stream.read_exact(&mut len).await?;
        let len = u32::from_le_bytes(len) as usize;

        if len > buffer.len() || len > MAX_RX_LARGE_PACKET_SIZE {
            Err(ErrorCode::BufferTooSmall)?;
        }

        stream.read_exact(&mut buffer[..len]).await?;

        Ok(len)
    }
}

impl Default for TcpNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkSend for &TcpNetwork {
    async fn send_to(&mut self, data: &[u8], addr: Address) -> Result<(), Error> {
        let peer = addr.tcp().ok_or(ErrorCode::InvalidPeerAddr)?;
        let conn = self.connection(peer).await?;

        let mut stream: &Async<TcpStream> = &conn;
        let len = (data.len() as u32).to_le_bytes();

        let result = async {
            stream.write_all(&len).await?;
            stream.write_all(data).await?;
            stream.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!("TCP send to {} failed: {}", peer, e);
            self.remove(&peer);
            Err(e)?;
        }

        Ok(())
    }
}

impl NetworkReceive for &TcpNetwork {
    async fn recv_from(&mut self, buffer: &mut [u8]) -> Result<(usize, Address), Error> {
        loop {
            match self.wait_readable().await {
                Readiness::Accept => {
                    if let Some(listener) = self.listener.as_ref() {
                        let (stream, addr) = listener.accept().await?;
                        info!("TCP connection from {} accepted", addr);
                        self.insert(addr, Rc::new(stream));
                    }
                }
                Readiness::Conn(addr, conn) => match TcpNetwork::read_frame(&conn, buffer).await {
                    Ok(len) => return Ok((len, Address::Tcp(addr))),
                    Err(e) => {
                        // EOF, a reset or a frame we cannot hold: the
                        // connection is unusable either way
                        debug!("TCP connection to {} closed: {}", addr, e);
                        self.remove(&addr);
                    }
                },
            }
        }
    }
}
