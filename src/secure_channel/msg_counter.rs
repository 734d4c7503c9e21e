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

//! Message counter synchronization.
//!
//! When a secure session does not trust the first counter it sees from the
//! peer, received messages are parked here while a MsgCounterSyncReq is in
//! flight. The response carries the peer's current counter and echoes our
//! challenge; once it checks out the parked datagrams are replayed through
//! the receive path.

use core::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::crypto;
use crate::error::*;
use crate::transport::exchange::ExchangeId;
use crate::transport::network::Address;
use crate::transport::session::SessionHandle;

pub const MAX_PENDING_SYNC_MSGS: usize = 4;

pub const CHALLENGE_LEN: usize = 8;

const SYNC_RESP_LEN: usize = 4 + CHALLENGE_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterSyncPolicy {
    /// The first counter received on a new session initializes the window.
    TrustFirst,
    /// A new session starts with an unknown peer counter; the first message
    /// triggers a synchronization.
    SyncOnFirstMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSyncConfig {
    pub policy: CounterSyncPolicy,
    /// How long to wait for a MsgCounterSyncResp.
    pub timeout: Duration,
}

impl CounterSyncConfig {
    pub const fn new() -> Self {
        Self {
            policy: CounterSyncPolicy::TrustFirst,
            timeout: Duration::from_secs(2),
        }
    }
}

impl Default for CounterSyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingSync {
    session: SessionHandle,
    exchange: ExchangeId,
    challenge: [u8; CHALLENGE_LEN],
    deadline: Duration,
    queued: heapless::Vec<(Address, Vec<u8>), MAX_PENDING_SYNC_MSGS>,
}

/// A synchronization that ran out of time.
#[derive(Debug)]
pub struct ExpiredSync {
    pub session: SessionHandle,
    pub exchange: ExchangeId,
    pub dropped: usize,
}

/// Tracks the counter synchronizations in flight, at most one per session.
#[derive(Default)]
pub struct MessageCounterMgr {
    pending: Vec<PendingSync>,
}

impl MessageCounterMgr {
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    pub fn is_in_flight(&self, session: SessionHandle) -> bool {
        self.pending.iter().any(|p| p.session == session)
    }

    /// The exchange carrying the synchronization of `session`.
    pub fn exchange(&self, session: SessionHandle) -> Option<ExchangeId> {
        self.pending
            .iter()
            .find(|p| p.session == session)
            .map(|p| p.exchange)
    }

    /// Records a synchronization that was just requested.
    pub fn begin(
        &mut self,
        session: SessionHandle,
        exchange: ExchangeId,
        challenge: [u8; CHALLENGE_LEN],
        deadline: Duration,
    ) -> Result<(), Error> {
        if self.is_in_flight(session) {
            Err(ErrorCode::InvalidState)?;
        }

        debug!("Counter sync for {} started on {}", session, exchange);

        self.pending.push(PendingSync {
            session,
            exchange,
            challenge,
            deadline,
            queued: heapless::Vec::new(),
        });

        Ok(())
    }

    /// Parks a datagram until the synchronization of `session` completes.
    /// When the queue is full the datagram is dropped and `false` returned;
    /// the messages already queued are kept.
    pub fn queue_message(&mut self, session: SessionHandle, peer: Address, data: &[u8]) -> bool {
        let Some(pending) = self.pending.iter_mut().find(|p| p.session == session) else {
            return false;
        };

        if pending.queued.push((peer, data.to_vec())).is_err() {
            warn!(
                "Counter sync queue for {} full, dropping message from {}",
                session, peer
            );
            return false;
        }

        true
    }

    pub fn queued(&self, session: SessionHandle) -> usize {
        self.pending
            .iter()
            .find(|p| p.session == session)
            .map_or(0, |p| p.queued.len())
    }

    /// Finishes the synchronization of `session` if `challenge` is the one we
    /// sent. Returns the parked datagrams in arrival order.
    pub fn complete(
        &mut self,
        session: SessionHandle,
        challenge: &[u8],
    ) -> Result<Vec<(Address, Vec<u8>)>, Error> {
        let index = self
            .pending
            .iter()
            .position(|p| p.session == session)
            .ok_or(ErrorCode::NotFound)?;

        if !crypto::ct_equal(&self.pending[index].challenge, challenge) {
            warn!("Counter sync response for {} with a wrong challenge", session);
            Err(ErrorCode::InvalidData)?;
        }

        let pending = self.pending.swap_remove(index);
        debug!(
            "Counter sync for {} complete, {} queued",
            session,
            pending.queued.len()
        );

        Ok(pending.queued.into_iter().collect())
    }

    /// Removes the synchronizations whose deadline passed. Their queued
    /// messages are discarded.
    pub fn expire(&mut self, now: Duration) -> Vec<ExpiredSync> {
        let mut expired = Vec::new();

        self.pending.retain(|p| {
            if p.deadline <= now {
                expired.push(ExpiredSync {
                    session: p.session,
                    exchange: p.exchange,
                    dropped: p.queued.len(),
                });
                false
            } else {
                true
            }
        });

        expired
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.pending.iter().map(|p| p.deadline).min()
    }

    /// Drops any state for a session that went away.
    pub fn forget_session(&mut self, session: SessionHandle) {
        self.pending.retain(|p| p.session != session);
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

pub fn encode_sync_req(challenge: &[u8; CHALLENGE_LEN]) -> Vec<u8> {
    challenge.to_vec()
}

pub fn decode_sync_req(payload: &[u8]) -> Result<[u8; CHALLENGE_LEN], Error> {
    if payload.len() < CHALLENGE_LEN {
        Err(ErrorCode::TruncatedPacket)?;
    }

    Ok(payload[..CHALLENGE_LEN].try_into()?)
}

pub fn encode_sync_resp(counter: u32, challenge: &[u8; CHALLENGE_LEN]) -> Vec<u8> {
    let mut resp = vec![0; SYNC_RESP_LEN];
    LittleEndian::write_u32(&mut resp, counter);
    resp[4..].copy_from_slice(challenge);

    resp
}

pub fn decode_sync_resp(payload: &[u8]) -> Result<(u32, [u8; CHALLENGE_LEN]), Error> {
    if payload.len() < SYNC_RESP_LEN {
        Err(ErrorCode::TruncatedPacket)?;
    }

    Ok((
        LittleEndian::read_u32(payload),
        payload[4..SYNC_RESP_LEN].try_into()?,
    ))
}
