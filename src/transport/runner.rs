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

use core::pin::pin;

use async_channel::{Receiver, Sender, TrySendError};
use async_io::Timer;
use embassy_futures::select::{select3, Either3};
use log::{debug, error, info};

use crate::core::Matter;
use crate::error::*;

use super::mgr::{AppDelegate, TransportMgr};
use super::network::{NetworkReceive, NetworkSend};
use super::packet::MAX_RX_BUF_SIZE;

/// Capacity of the command queue between [`StackHandle`]s and the runner.
pub const COMMAND_QUEUE_SIZE: usize = 16;

/// A closure executed on the runner's loop with exclusive access to the
/// transport.
pub type Call = Box<dyn FnOnce(&mut TransportMgr<'_>) + Send>;

pub enum Command {
    Call(Call),
    Shutdown,
}

/// A cloneable, thread-safe way to drive a [`Runner`] from outside its loop.
/// Commands are executed in the order they are posted.
#[derive(Clone)]
pub struct StackHandle {
    sender: Sender<Command>,
}

impl StackHandle {
    /// Queues `f`, waiting for room in the queue.
    pub async fn post<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut TransportMgr<'_>) + Send + 'static,
    {
        self.sender
            .send(Command::Call(Box::new(f)))
            .await
            .map_err(|_| ErrorCode::ChannelClosed.into())
    }

    /// Queues `f` without waiting. Fails with `Busy` when the queue is full.
    pub fn try_post<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut TransportMgr<'_>) + Send + 'static,
    {
        self.sender
            .try_send(Command::Call(Box::new(f)))
            .map_err(|e| match e {
                TrySendError::Full(_) => ErrorCode::Busy.into(),
                TrySendError::Closed(_) => ErrorCode::ChannelClosed.into(),
            })
    }

    /// Runs `f` on the loop and waits for its result.
    pub async fn exec<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut TransportMgr<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (sender, receiver) = async_channel::bounded(1);

        self.post(move |mgr| {
            let _ = sender.try_send(f(mgr));
        })
        .await?;

        receiver
            .recv()
            .await
            .map_err(|_| ErrorCode::ChannelClosed.into())
    }

    /// Asks the runner to shut the transport down and return.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.sender
            .send(Command::Shutdown)
            .await
            .map_err(|_| ErrorCode::ChannelClosed.into())
    }
}

/// The single consumer loop of a node: receives datagrams, executes
/// commands, fires timers and hands events to the application.
pub struct Runner<'a> {
    mgr: TransportMgr<'a>,
    sender: Sender<Command>,
    receiver: Receiver<Command>,
}

impl<'a> Runner<'a> {
    pub fn new(matter: &'a Matter<'a>) -> Result<Self, Error> {
        let (sender, receiver) = async_channel::bounded(COMMAND_QUEUE_SIZE);

        Ok(Self {
            mgr: TransportMgr::new(matter)?,
            sender,
            receiver,
        })
    }

    pub fn handle(&self) -> StackHandle {
        StackHandle {
            sender: self.sender.clone(),
        }
    }

    pub fn mgr(&mut self) -> &mut TransportMgr<'a> {
        &mut self.mgr
    }

    /// Runs until a shutdown command arrives or receiving fails. Failed sends
    /// only lose the datagram. Once shut down, commands posted through any
    /// handle fail with `ChannelClosed`.
    pub async fn run<S, R, D>(
        &mut self,
        mut send: S,
        mut recv: R,
        delegate: &mut D,
    ) -> Result<(), Error>
    where
        S: NetworkSend,
        R: NetworkReceive,
        D: AppDelegate + ?Sized,
    {
        info!("Running Matter transport");

        let mut buf = vec![0; MAX_RX_BUF_SIZE];

        loop {
            self.mgr.process_events(delegate);
            self.mgr.flush(&mut send).await;

            let wait = self
                .mgr
                .next_deadline()
                .map(|deadline| deadline.saturating_sub(self.mgr.now()));

            let next = {
                let mut rx = pin!(recv.recv_from(&mut buf));
                let mut cmd = pin!(self.receiver.recv());
                let mut timer = pin!(async move {
                    match wait {
                        Some(wait) => {
                            Timer::after(wait).await;
                        }
                        None => futures_lite::future::pending::<()>().await,
                    }
                });

                select3(&mut rx, &mut cmd, &mut timer).await
            };

            match next {
                Either3::First(received) => {
                    let (len, addr) = received.map_err(|e| {
                        error!("Receive failed: {}", e);
                        e
                    })?;

                    self.mgr.handle_message_received(addr, &buf[..len])?;
                }
                Either3::Second(Ok(Command::Call(f))) => f(&mut self.mgr),
                Either3::Second(Ok(Command::Shutdown)) | Either3::Second(Err(_)) => {
                    debug!("Runner shutting down");

                    self.receiver.close();
                    self.mgr.shutdown();
                    self.mgr.process_events(delegate);
                    self.mgr.flush(&mut send).await;

                    return Ok(());
                }
                Either3::Third(()) => self.mgr.poll_timers()?,
            }
        }
    }
}
