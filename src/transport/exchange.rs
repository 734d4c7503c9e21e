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

use core::fmt;
use core::time::Duration;

use log::debug;

use crate::error::*;

use super::dispatch::ExchangeDispatch;
use super::mrp::ReliableMessage;
use super::proto_hdr::ProtoHdr;
use super::session::SessionHandle;

pub const MAX_EXCHANGES: usize = 16;

/// A handle to an exchange slot. Stale handles (the exchange was closed and
/// the slot possibly reused) resolve to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeId {
    index: u16,
    generation: u32,
}

impl ExchangeId {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ExchangeState {
    Idle,
    WaitingForResponse,
    /// The awaited response arrived.
    Complete,
    TimedOut,
    Canceled,
}

/// Protocol id, opcode and reliability of a message.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct MessageMeta {
    pub proto_id: u16,
    pub proto_opcode: u8,
    pub reliable: bool,
}

impl MessageMeta {
    pub const fn new(proto_id: u16, proto_opcode: u8, reliable: bool) -> Self {
        Self {
            proto_id,
            proto_opcode,
            reliable,
        }
    }

    pub fn from(proto: &ProtoHdr) -> Self {
        Self {
            proto_id: proto.proto_id,
            proto_opcode: proto.proto_opcode,
            reliable: proto.is_reliable(),
        }
    }

    pub fn set_into(&self, proto: &mut ProtoHdr) {
        proto.proto_id = self.proto_id;
        proto.proto_opcode = self.proto_opcode;
        proto.set_vendor(None);

        if self.reliable {
            proto.set_reliable();
        } else {
            proto.unset_reliable();
        }
    }
}

/// How long to wait for a response and how often to re-send the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponsePolicy {
    pub timeout: Duration,
    pub retries: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub reliable: bool,
    pub response: Option<ResponsePolicy>,
}

impl SendOptions {
    pub const fn reliable() -> Self {
        Self {
            reliable: true,
            response: None,
        }
    }

    pub const fn unreliable() -> Self {
        Self {
            reliable: false,
            response: None,
        }
    }

    pub const fn with_response(mut self, timeout: Duration, retries: u8) -> Self {
        self.response = Some(ResponsePolicy { timeout, retries });
        self
    }
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::reliable()
    }
}

/// An outstanding request awaiting its response.
#[derive(Debug)]
pub struct PendingResponse {
    pub policy: ResponsePolicy,
    pub retries_left: u8,
    pub deadline: Duration,
    pub meta: MessageMeta,
    pub payload: Vec<u8>,
}

/// The timers an exchange can have armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Retransmit,
    StandaloneAck,
    Response,
}

#[derive(Debug)]
pub struct Exchange {
    generation: u32,
    exch_id: u16,
    role: Role,
    session: SessionHandle,
    dispatch: ExchangeDispatch,
    state: ExchangeState,
    closing: bool,
    pub(crate) mrp: ReliableMessage,
    pub(crate) response: Option<PendingResponse>,
}

impl Exchange {
    pub fn exch_id(&self) -> u16 {
        self.exch_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session(&self) -> SessionHandle {
        self.session
    }

    pub fn dispatch(&self) -> ExchangeDispatch {
        self.dispatch
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn set_state(&mut self, state: ExchangeState) {
        if self.state != state {
            debug!("Exchange {:x}: {:?} -> {:?}", self.exch_id, self.state, state);
            self.state = state;
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub(crate) fn set_closing(&mut self) {
        self.closing = true;
        self.response = None;
    }

    /// Whether an inbound message belongs to this exchange: same exchange id,
    /// sent by the other role.
    pub fn is_for_rx(&self, session: SessionHandle, rx_proto: &ProtoHdr) -> bool {
        self.session == session
            && self.exch_id == rx_proto.exch_id
            && rx_proto.is_initiator() == (self.role == Role::Responder)
    }

    /// Stamps the exchange id and initiator flag on an outgoing header.
    pub fn pre_send(&self, tx_proto: &mut ProtoHdr) {
        tx_proto.exch_id = self.exch_id;
        tx_proto.set_initiator(self.role == Role::Initiator);
    }

    /// A closed exchange can be released once no acks or retransmissions
    /// are outstanding.
    pub fn is_purgeable(&self) -> bool {
        self.closing && !self.mrp.is_retrans_pending() && !self.mrp.is_ack_pending()
    }

    pub fn is_timer_due(&self, kind: TimerKind, now: Duration) -> bool {
        match kind {
            TimerKind::Retransmit => self.mrp.is_retrans_due(now),
            TimerKind::StandaloneAck => self.mrp.is_ack_due(now),
            TimerKind::Response => self
                .response
                .as_ref()
                .map_or(false, |pending| pending.deadline <= now),
        }
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        let response = self.response.as_ref().map(|pending| pending.deadline);

        match (self.mrp.next_deadline(), response) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// The exchange arena.
pub struct ExchangeMgr {
    slots: [Option<Exchange>; MAX_EXCHANGES],
    generation: u32,
    next_exch_id: u16,
}

impl ExchangeMgr {
    pub fn new(initial_exch_id: u16) -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            generation: 0,
            next_exch_id: initial_exch_id,
        }
    }

    pub fn get_next_exch_id(&mut self) -> u16 {
        let id = self.next_exch_id;
        self.next_exch_id = self.next_exch_id.wrapping_add(1);

        id
    }

    pub fn alloc(
        &mut self,
        session: SessionHandle,
        role: Role,
        exch_id: u16,
        dispatch: ExchangeDispatch,
    ) -> Result<ExchangeId, Error> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ErrorCode::NoSpaceExchanges)?;

        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;

        self.slots[index] = Some(Exchange {
            generation,
            exch_id,
            role,
            session,
            dispatch,
            state: ExchangeState::Idle,
            closing: false,
            mrp: ReliableMessage::new(),
            response: None,
        });

        let id = ExchangeId {
            index: index as u16,
            generation,
        };
        debug!(
            "New {:?} exchange {} ({:x}) on {} for {:?}",
            role, id, exch_id, session, dispatch
        );

        Ok(id)
    }

    pub fn get(&self, id: ExchangeId) -> Option<&Exchange> {
        self.slots
            .get(id.index())?
            .as_ref()
            .filter(|e| e.generation == id.generation)
    }

    pub fn get_mut(&mut self, id: ExchangeId) -> Option<&mut Exchange> {
        self.slots
            .get_mut(id.index())?
            .as_mut()
            .filter(|e| e.generation == id.generation)
    }

    pub fn release(&mut self, id: ExchangeId) -> Option<Exchange> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.as_ref().map(|e| e.generation) == Some(id.generation) {
            debug!("Released exchange {}", id);
            slot.take()
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ExchangeId, &Exchange)> {
        self.slots.iter().enumerate().filter_map(|(index, e)| {
            e.as_ref().map(|e| {
                (
                    ExchangeId {
                        index: index as u16,
                        generation: e.generation,
                    },
                    e,
                )
            })
        })
    }

    pub fn ids(&self) -> Vec<ExchangeId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds the exchange an inbound message belongs to.
    pub fn find(&self, session: SessionHandle, rx_proto: &ProtoHdr) -> Option<ExchangeId> {
        self.iter()
            .find(|(_, e)| e.is_for_rx(session, rx_proto))
            .map(|(id, _)| id)
    }

    pub fn for_session(&self, session: SessionHandle) -> Vec<ExchangeId> {
        self.iter()
            .filter(|(_, e)| e.session == session)
            .map(|(id, _)| id)
            .collect()
    }

    /// Releases closed exchanges whose MRP state has settled.
    pub fn purge(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map_or(false, Exchange::is_purgeable) {
                *slot = None;
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.iter().filter_map(|(_, e)| e.next_deadline()).min()
    }

    /// The armed timers that are due, across all exchanges.
    pub fn due_timers(&self, now: Duration) -> Vec<(ExchangeId, TimerKind)> {
        let mut due = Vec::new();

        for (id, exchange) in self.iter() {
            for kind in [
                TimerKind::StandaloneAck,
                TimerKind::Retransmit,
                TimerKind::Response,
            ] {
                if exchange.is_timer_due(kind, now) {
                    due.push((id, kind));
                }
            }
        }

        due
    }
}
