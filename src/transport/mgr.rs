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

use core::time::Duration;
use std::collections::VecDeque;

use log::{debug, error, info, trace, warn};

use crate::core::Matter;
use crate::error::*;
use crate::group_id::{FabricIndex, GroupId, NodeId};
use crate::secure_channel::case::{CaseInitiator, CaseResponder};
use crate::secure_channel::common::{
    sc_status_report_payload, OpCode, SCStatusCodes, PROTO_ID_SECURE_CHANNEL,
};
use crate::secure_channel::msg_counter::{
    encode_sync_req, CounterSyncPolicy, MessageCounterMgr, CHALLENGE_LEN,
};
use crate::secure_channel::pake::{PaseInitiator, PaseResponder};

use super::dedup::CtrCheck;
use super::dispatch::ExchangeDispatch;
use super::exchange::{
    Exchange, ExchangeId, ExchangeMgr, ExchangeState, MessageMeta, PendingResponse,
    ResponsePolicy, Role, SendOptions, TimerKind,
};
use super::network::{Address, NetworkSend};
use super::packet::{self, Packet};
use super::plain_hdr::SessionType;
use super::proto_hdr::ProtoHdr;
use super::session::{GroupPacket, Session, SessionHandle, SessionMgr, SessionMode};

/// An application message delivered on an exchange.
#[derive(Debug, Clone)]
pub struct RxMessage {
    pub exchange: ExchangeId,
    pub session: SessionHandle,
    pub peer: Address,
    pub proto_id: u16,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// What the transport reports to the application.
#[derive(Debug, Clone)]
pub enum Event {
    Message(RxMessage),
    GroupMessage(GroupPacket),
    /// A request sent with a response policy got no answer, retries
    /// included.
    ResponseTimeout {
        exchange: ExchangeId,
        session: SessionHandle,
    },
    /// A reliable message was never acknowledged.
    DeliveryFailed {
        exchange: ExchangeId,
        session: SessionHandle,
    },
    SessionEstablished {
        session: SessionHandle,
        /// The operational node id of the peer; PASE peers have none.
        peer_node_id: Option<NodeId>,
        mode: SessionMode,
    },
    SessionEstablishmentFailed {
        exchange: ExchangeId,
        error: ErrorCode,
    },
    SessionClosed {
        session: SessionHandle,
    },
}

/// The callbacks through which the application consumes [`Event`]s. Every
/// callback gets the transport back so it can reply right away.
#[allow(unused_variables)]
pub trait AppDelegate {
    fn on_message(&mut self, mgr: &mut TransportMgr<'_>, msg: RxMessage) {}

    fn on_group_message(&mut self, mgr: &mut TransportMgr<'_>, msg: GroupPacket) {}

    fn on_response_timeout(
        &mut self,
        mgr: &mut TransportMgr<'_>,
        exchange: ExchangeId,
        session: SessionHandle,
    ) {
    }

    fn on_delivery_failed(
        &mut self,
        mgr: &mut TransportMgr<'_>,
        exchange: ExchangeId,
        session: SessionHandle,
    ) {
    }

    fn on_session_established(
        &mut self,
        mgr: &mut TransportMgr<'_>,
        session: SessionHandle,
        peer_node_id: Option<NodeId>,
        mode: SessionMode,
    ) {
    }

    fn on_session_establishment_failed(
        &mut self,
        mgr: &mut TransportMgr<'_>,
        exchange: ExchangeId,
        error: ErrorCode,
    ) {
    }

    fn on_session_closed(&mut self, mgr: &mut TransportMgr<'_>, session: SessionHandle) {}
}

/// A handshake in progress, keyed by the exchange carrying it.
pub(crate) enum Handshake {
    PaseResponder(PaseResponder),
    PaseInitiator(PaseInitiator),
    CaseResponder(CaseResponder),
    CaseInitiator(CaseInitiator),
}

/// The transport core of one node.
///
/// Sans-IO: datagrams go in through [`TransportMgr::handle_message_received`],
/// come out of the outbox (drained with [`TransportMgr::flush`] or
/// [`TransportMgr::pop_outgoing`]), and time only moves when
/// [`TransportMgr::poll_timers`] is called.
pub struct TransportMgr<'a> {
    pub(crate) matter: &'a Matter<'a>,
    pub(crate) session_mgr: SessionMgr<'a>,
    pub(crate) exch_mgr: ExchangeMgr,
    pub(crate) ctr_sync: MessageCounterMgr,
    pub(crate) handshakes: Vec<(ExchangeId, Handshake)>,
    outbox: VecDeque<(Address, Vec<u8>)>,
    pub(crate) events: VecDeque<Event>,
}

impl<'a> TransportMgr<'a> {
    pub fn new(matter: &'a Matter<'a>) -> Result<Self, Error> {
        let mut exch_id = [0; 2];
        (matter.rand)(&mut exch_id);

        Ok(Self {
            matter,
            session_mgr: SessionMgr::new(matter.epoch, matter.rand, matter.psm)?,
            exch_mgr: ExchangeMgr::new(u16::from_le_bytes(exch_id)),
            ctr_sync: MessageCounterMgr::new(),
            handshakes: Vec::new(),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    pub fn matter(&self) -> &'a Matter<'a> {
        self.matter
    }

    pub fn session_mgr(&self) -> &SessionMgr<'a> {
        &self.session_mgr
    }

    pub fn exchange_mgr(&self) -> &ExchangeMgr {
        &self.exch_mgr
    }

    pub fn session(&self, session: SessionHandle) -> Option<&Session> {
        self.session_mgr.get(session)
    }

    pub fn exchange(&self, exchange: ExchangeId) -> Option<&Exchange> {
        self.exch_mgr.get(exchange)
    }

    pub fn is_sync_in_flight(&self, session: SessionHandle) -> bool {
        self.ctr_sync.is_in_flight(session)
    }

    pub fn queued_for_sync(&self, session: SessionHandle) -> usize {
        self.ctr_sync.queued(session)
    }

    pub(crate) fn now(&self) -> Duration {
        (self.matter.epoch)()
    }

    /// Processes one received datagram. Anything wrong with it is logged and
    /// the datagram dropped; errors are never returned for bad input.
    pub fn handle_message_received(&mut self, peer: Address, data: &[u8]) -> Result<(), Error> {
        if let Err(e) = self.process_rx(peer, data) {
            warn!("Dropped message from {}: {}", peer, e);
        }

        self.exch_mgr.purge();

        Ok(())
    }

    fn process_rx(&mut self, peer: Address, data: &[u8]) -> Result<(), Error> {
        let plain = packet::peek_plain_hdr(data)?;

        if plain.session_type() == SessionType::Group {
            let group = {
                let fabric_mgr = self.matter.fabric_mgr.borrow();
                self.session_mgr.decode_group(&fabric_mgr, peer, data)?
            };
            debug!(
                "Group message for {:?} from node {:x}",
                group.group_id, group.src_nodeid
            );
            self.events.push_back(Event::GroupMessage(group));
            return Ok(());
        }

        let session = match self.session_mgr.lookup(&plain, &peer) {
            Some(session) => session,
            None if plain.is_encrypted() => {
                warn!("No secure session with id {:x}", plain.sess_id);
                Err(ErrorCode::NoSession)?
            }
            None => {
                self.ensure_session_slot(false)?;
                self.session_mgr.add(peer, None, plain.get_src_nodeid())?
            }
        };

        let mut buf = data.to_vec();
        let mut rx = match self.session_mgr.decode(session, peer, &mut buf) {
            Ok(rx) => rx,
            Err(e) => {
                if e.code() == ErrorCode::Crypto {
                    self.check_decrypt_failures(session);
                }
                return Err(e);
            }
        };
        rx.proto.adjust_reliability(true, &peer);

        trace!("Received on {}: {}", session, rx);

        let counter_sync_msg = matches!(
            rx.sc_opcode(),
            Some(OpCode::MsgCounterSyncReq | OpCode::MsgCounterSyncResp)
        );

        let trust_first = self.matter.config().counter_sync.policy == CounterSyncPolicy::TrustFirst;
        let check = self
            .session_mgr
            .get_mut(session)
            .ok_or(ErrorCode::NoSession)?
            .post_recv(rx.plain.ctr, trust_first);

        match check {
            // Only an unknown peer counter lets counter sync messages through unchecked
            None if counter_sync_msg => {
                trace!("Counter sync message on unsynchronized {}", session);
            }
            None => {
                debug!("Peer counter of {} unknown, synchronizing", session);
                return self.queue_received_message_and_start_sync(session, peer, data);
            }
            Some(CtrCheck::Rejected) => {
                warn!("Counter {} on {} behind the window", rx.plain.ctr, session);
                Err(ErrorCode::Duplicate)?;
            }
            Some(CtrCheck::Duplicate) => rx.duplicate = true,
            Some(CtrCheck::New) => (),
        }

        let exchange = match self.exch_mgr.find(session, &rx.proto) {
            Some(exchange) => exchange,
            None => match self.responder_dispatch(session, &rx) {
                Some(dispatch) => {
                    Self::check_permitted(dispatch, &rx, self.is_secure(session))?;

                    match self.exch_mgr.alloc(
                        session,
                        Role::Responder,
                        rx.proto.exch_id,
                        dispatch,
                    ) {
                        Ok(exchange) => exchange,
                        Err(e) => {
                            warn!("Cannot open an exchange for {}: {}", rx, e);
                            self.send_ephemeral_ack(session, &rx)?;
                            return Err(e);
                        }
                    }
                }
                None => {
                    // Unsolicited and unmatched: acknowledge if asked to, never deliver
                    debug!("No exchange for {}", rx);
                    return self.send_ephemeral_ack(session, &rx);
                }
            },
        };

        let dispatch = self
            .exch_mgr
            .get(exchange)
            .ok_or(ErrorCode::NoExchange)?
            .dispatch();
        Self::check_permitted(dispatch, &rx, self.is_secure(session))?;

        let now = self.now();
        let mrp_config = self.matter.config().mrp;

        let exch = self
            .exch_mgr
            .get_mut(exchange)
            .ok_or(ErrorCode::NoExchange)?;

        if let Some(ack) = rx.proto.get_ack() {
            exch.mrp.on_ack(ack);
        }

        let previous_ack = if rx.proto.is_reliable() {
            exch.mrp.schedule_ack(rx.plain.ctr, now, &mrp_config)
        } else {
            None
        };

        if rx.duplicate || rx.is_standalone_ack() || exch.is_closing() {
            if let Some(ctr) = previous_ack {
                self.send_ack(exchange, ctr)?;
            }
            return Ok(());
        }

        if exch.state() == ExchangeState::WaitingForResponse {
            exch.set_state(ExchangeState::Complete);
            exch.response = None;
        }

        if let Some(ctr) = previous_ack {
            self.send_ack(exchange, ctr)?;
        }

        if rx.is_sc() {
            self.handle_sc(exchange, session, dispatch, rx)
        } else {
            self.events.push_back(Event::Message(RxMessage {
                exchange,
                session,
                peer,
                proto_id: rx.proto.proto_id,
                opcode: rx.proto.proto_opcode,
                payload: rx.payload,
            }));

            Ok(())
        }
    }

    /// Whether `session` is a PASE or CASE session.
    fn is_secure(&self, session: SessionHandle) -> bool {
        self.session_mgr
            .get(session)
            .map_or(false, |s| matches!(s.mode(), SessionMode::Pase | SessionMode::Case(_)))
    }

    /// The dispatch of the responder exchange an unmatched message opens, if
    /// it opens one at all.
    fn responder_dispatch(&self, session: SessionHandle, rx: &Packet) -> Option<ExchangeDispatch> {
        if rx.duplicate || !rx.proto.is_initiator() || rx.is_standalone_ack() {
            return None;
        }

        if self.is_secure(session) {
            Some(ExchangeDispatch::Application)
        } else {
            matches!(
                rx.sc_opcode(),
                Some(OpCode::PBKDFParamRequest | OpCode::CASESigma1)
            )
            .then_some(ExchangeDispatch::SessionEstablishment)
        }
    }

    fn check_permitted(dispatch: ExchangeDispatch, rx: &Packet, secure: bool) -> Result<(), Error> {
        if !dispatch.message_permitted(rx.proto.proto_id, rx.proto.proto_opcode) {
            warn!("{:?} exchange does not accept {}", dispatch, rx);
            Err(ErrorCode::InvalidOpcode)?;
        }

        if dispatch.is_encryption_required() && !secure {
            warn!("{:?} exchange requires encryption: {}", dispatch, rx);
            Err(ErrorCode::Invalid)?;
        }

        Ok(())
    }

    fn check_decrypt_failures(&mut self, session: SessionHandle) {
        let failures = self
            .session_mgr
            .get(session)
            .map_or(0, Session::decrypt_failures);

        if failures >= self.matter.config().max_decrypt_failures {
            error!(
                "Closing {} after {} consecutive decryption failures",
                session, failures
            );
            self.remove_session(session, false);
        }
    }

    /// Opens an exchange as initiator on `session`.
    pub fn new_exchange(&mut self, session: SessionHandle) -> Result<ExchangeId, Error> {
        let dispatch = match self
            .session_mgr
            .get(session)
            .ok_or(ErrorCode::NoSession)?
            .mode()
        {
            SessionMode::Pase | SessionMode::Case(_) => ExchangeDispatch::Application,
            SessionMode::PlainText => ExchangeDispatch::SessionEstablishment,
            SessionMode::Group(_) => Err(ErrorCode::InvalidArgument)?,
        };

        let exch_id = self.exch_mgr.get_next_exch_id();
        self.exch_mgr
            .alloc(session, Role::Initiator, exch_id, dispatch)
    }

    /// Sends a message on an exchange.
    ///
    /// A reliable message is retransmitted until acknowledged. With a
    /// response policy the exchange waits for the response and re-sends the
    /// request when it does not come in time.
    pub fn send(
        &mut self,
        exchange: ExchangeId,
        proto_id: u16,
        opcode: u8,
        payload: &[u8],
        options: SendOptions,
    ) -> Result<(), Error> {
        self.send_message(
            exchange,
            MessageMeta::new(proto_id, opcode, options.reliable),
            payload,
            options.response,
        )
    }

    pub(crate) fn send_message(
        &mut self,
        exchange: ExchangeId,
        meta: MessageMeta,
        payload: &[u8],
        response: Option<ResponsePolicy>,
    ) -> Result<(), Error> {
        let now = self.now();
        let mrp_config = self.matter.config().mrp;

        let exch = self
            .exch_mgr
            .get_mut(exchange)
            .ok_or(ErrorCode::NoExchange)?;

        if exch.is_closing() || exch.state() == ExchangeState::Canceled {
            Err(ErrorCode::InvalidState)?;
        }

        let session = exch.session();
        let peer = self
            .session_mgr
            .get(session)
            .ok_or(ErrorCode::NoSession)?
            .peer_addr();

        let mut proto = ProtoHdr::new();
        meta.set_into(&mut proto);
        exch.pre_send(&mut proto);
        proto.adjust_reliability(false, &peer);

        if proto.is_reliable() && exch.mrp.is_retrans_pending() {
            error!("Exchange {} still has an unacknowledged message", exchange);
            Err(ErrorCode::InvalidState)?;
        }

        let ack = exch.mrp.take_ack();
        proto.set_ack(ack);

        let (datagram, ctr) = match self.session_mgr.encode(session, &proto, payload) {
            Ok(encoded) => encoded,
            Err(e) => {
                if let Some(ack) = ack {
                    exch.mrp.schedule_ack(ack, now, &mrp_config);
                }
                return Err(e);
            }
        };

        if proto.is_reliable() {
            exch.mrp.post_send(ctr, &datagram, peer, now, &mrp_config);
        }

        if let Some(policy) = response {
            exch.response = Some(PendingResponse {
                policy,
                retries_left: policy.retries,
                deadline: now + policy.timeout,
                meta,
                payload: payload.to_vec(),
            });
            exch.set_state(ExchangeState::WaitingForResponse);
        }

        trace!("Queued {} bytes to {} on {}", datagram.len(), peer, exchange);
        self.outbox.push_back((peer, datagram));

        Ok(())
    }

    fn send_ack(&mut self, exchange: ExchangeId, ack_ctr: u32) -> Result<(), Error> {
        let exch = self.exch_mgr.get(exchange).ok_or(ErrorCode::NoExchange)?;
        let session = exch.session();

        let mut proto = ProtoHdr::new();
        MessageMeta::new(
            PROTO_ID_SECURE_CHANNEL,
            OpCode::MRPStandAloneAck as u8,
            false,
        )
        .set_into(&mut proto);
        exch.pre_send(&mut proto);
        proto.set_ack(Some(ack_ctr));

        self.send_raw(session, &proto, &[])
    }

    /// Sends the pending ack of an exchange, if any, as a standalone ack.
    fn flush_ack(&mut self, exchange: ExchangeId) -> Result<(), Error> {
        let ack = self
            .exch_mgr
            .get_mut(exchange)
            .and_then(|exch| exch.mrp.take_ack());

        if let Some(ack) = ack {
            self.send_ack(exchange, ack)?;
        }

        Ok(())
    }

    /// Acknowledges a reliable message that has no exchange of its own.
    fn send_ephemeral_ack(&mut self, session: SessionHandle, rx: &Packet) -> Result<(), Error> {
        if !rx.proto.is_reliable() {
            return Ok(());
        }

        debug_assert!(ExchangeDispatch::Ephemeral
            .message_permitted(PROTO_ID_SECURE_CHANNEL, OpCode::MRPStandAloneAck as u8));

        let mut proto = ProtoHdr::new();
        MessageMeta::new(
            PROTO_ID_SECURE_CHANNEL,
            OpCode::MRPStandAloneAck as u8,
            false,
        )
        .set_into(&mut proto);
        proto.exch_id = rx.proto.exch_id;
        proto.set_initiator(!rx.proto.is_initiator());
        proto.set_ack(Some(rx.plain.ctr));

        self.send_raw(session, &proto, &[])
    }

    /// Encodes and queues a message outside of any exchange slot.
    fn send_raw(
        &mut self,
        session: SessionHandle,
        proto: &ProtoHdr,
        payload: &[u8],
    ) -> Result<(), Error> {
        let peer = self
            .session_mgr
            .get(session)
            .ok_or(ErrorCode::NoSession)?
            .peer_addr();

        let (datagram, _) = self.session_mgr.encode(session, proto, payload)?;
        self.outbox.push_back((peer, datagram));

        Ok(())
    }

    /// Closes an exchange gracefully. The slot lingers until the pending ack
    /// is out and the last reliable message is acknowledged.
    pub fn close_exchange(&mut self, exchange: ExchangeId) -> Result<(), Error> {
        if self
            .exch_mgr
            .get(exchange)
            .ok_or(ErrorCode::NoExchange)?
            .is_closing()
        {
            return Ok(());
        }

        self.flush_ack(exchange)?;
        self.forget_exchange(exchange);

        if let Some(exch) = self.exch_mgr.get_mut(exchange) {
            exch.set_closing();
            debug!("Closing exchange {}", exchange);
        }

        self.exch_mgr.purge();

        Ok(())
    }

    /// Cancels an exchange immediately: pending retransmissions and acks
    /// are dropped and the slot is released. Timers still referring to the
    /// exchange become no-ops.
    pub fn cancel_exchange(&mut self, exchange: ExchangeId) -> Result<(), Error> {
        let exch = self
            .exch_mgr
            .get_mut(exchange)
            .ok_or(ErrorCode::NoExchange)?;
        exch.set_state(ExchangeState::Canceled);

        self.forget_exchange(exchange);
        self.exch_mgr.release(exchange);

        Ok(())
    }

    fn forget_exchange(&mut self, exchange: ExchangeId) {
        self.handshakes.retain(|(id, _)| *id != exchange);
        self.matter.pase_mgr.borrow_mut().release(exchange);
    }

    /// Runs the timers that are due.
    pub fn poll_timers(&mut self) -> Result<(), Error> {
        let now = self.now();

        for (exchange, kind) in self.exch_mgr.due_timers(now) {
            if let Err(e) = self.fire_timer(exchange, kind) {
                error!("{:?} timer of {} failed: {}", kind, exchange, e);
            }
        }

        for expired in self.ctr_sync.expire(now) {
            error!(
                "Counter sync for {} timed out, {} queued messages discarded",
                expired.session, expired.dropped
            );

            if self.exch_mgr.get(expired.exchange).is_some() {
                self.cancel_exchange(expired.exchange)?;
            }
        }

        self.exch_mgr.purge();

        Ok(())
    }

    /// Fires one exchange timer. Returns `false` when there was nothing to
    /// do: the exchange is gone (or its slot was reused) or the timer is not
    /// due.
    pub fn fire_timer(&mut self, exchange: ExchangeId, kind: TimerKind) -> Result<bool, Error> {
        let now = self.now();
        let mrp_config = self.matter.config().mrp;

        let Some(exch) = self.exch_mgr.get_mut(exchange) else {
            return Ok(false);
        };

        if !exch.is_timer_due(kind, now) {
            return Ok(false);
        }

        match kind {
            TimerKind::StandaloneAck => self.flush_ack(exchange)?,
            TimerKind::Retransmit => match exch.mrp.retransmit(now, &mrp_config) {
                Some(datagram) => self.outbox.push_back(datagram),
                None => self.delivery_failed(exchange)?,
            },
            TimerKind::Response => self.response_timed_out(exchange)?,
        }

        self.exch_mgr.purge();

        Ok(true)
    }

    fn delivery_failed(&mut self, exchange: ExchangeId) -> Result<(), Error> {
        let exch = self
            .exch_mgr
            .get_mut(exchange)
            .ok_or(ErrorCode::NoExchange)?;
        let session = exch.session();

        exch.response = None;
        if exch.state() == ExchangeState::WaitingForResponse {
            exch.set_state(ExchangeState::TimedOut);
        }

        if self.is_handshake(exchange) {
            self.abandon_handshake(exchange);
        } else {
            warn!("Delivery on {} failed", exchange);
            self.events
                .push_back(Event::DeliveryFailed { exchange, session });
        }

        Ok(())
    }

    fn response_timed_out(&mut self, exchange: ExchangeId) -> Result<(), Error> {
        let exch = self
            .exch_mgr
            .get_mut(exchange)
            .ok_or(ErrorCode::NoExchange)?;
        let session = exch.session();

        let Some(pending) = exch.response.take() else {
            return Ok(());
        };

        if pending.retries_left > 0 {
            debug!(
                "No response on {}, re-sending ({} retries left)",
                exchange,
                pending.retries_left - 1
            );

            exch.mrp.clear_retrans();
            self.send_message(exchange, pending.meta, &pending.payload, Some(pending.policy))?;

            if let Some(resent) = self
                .exch_mgr
                .get_mut(exchange)
                .and_then(|exch| exch.response.as_mut())
            {
                resent.retries_left = pending.retries_left - 1;
            }

            return Ok(());
        }

        exch.mrp.clear_retrans();
        exch.set_state(ExchangeState::TimedOut);

        if self.is_handshake(exchange) {
            self.abandon_handshake(exchange);
        } else {
            warn!("No response on {}", exchange);
            self.events
                .push_back(Event::ResponseTimeout { exchange, session });
        }

        Ok(())
    }

    /// The earliest instant at which [`TransportMgr::poll_timers`] has work.
    pub fn next_deadline(&self) -> Option<Duration> {
        match (self.exch_mgr.next_deadline(), self.ctr_sync.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Requests the peer's message counter on a secure session. A second
    /// call while a synchronization is in flight does nothing.
    pub fn start_sync(&mut self, session: SessionHandle) -> Result<(), Error> {
        if self.ctr_sync.is_in_flight(session) {
            debug!("Counter sync for {} already in flight", session);
            return Ok(());
        }

        if self.session_mgr.get(session).is_none() {
            Err(ErrorCode::NoSession)?;
        }

        if !self.is_secure(session) {
            Err(ErrorCode::InvalidArgument)?;
        }

        let exchange = self.new_exchange(session)?;

        let mut challenge = [0; CHALLENGE_LEN];
        (self.matter.rand)(&mut challenge);

        let deadline = self.now() + self.matter.config().counter_sync.timeout;
        self.ctr_sync.begin(session, exchange, challenge, deadline)?;

        let sent = self.send_message(
            exchange,
            MessageMeta::new(
                PROTO_ID_SECURE_CHANNEL,
                OpCode::MsgCounterSyncReq as u8,
                true,
            ),
            &encode_sync_req(&challenge),
            None,
        );

        if let Err(e) = sent {
            self.ctr_sync.forget_session(session);
            self.exch_mgr.release(exchange);
            return Err(e);
        }

        info!("Counter sync requested on {}", session);

        Ok(())
    }

    /// Parks a datagram whose counter cannot be validated yet and makes sure
    /// a synchronization is running for its session.
    pub fn queue_received_message_and_start_sync(
        &mut self,
        session: SessionHandle,
        peer: Address,
        data: &[u8],
    ) -> Result<(), Error> {
        self.start_sync(session)?;
        self.ctr_sync.queue_message(session, peer, data);

        Ok(())
    }

    /// Closes a session, telling the peer with a CloseSession status report
    /// when the session is secure.
    pub fn close_session(&mut self, session: SessionHandle) -> Result<(), Error> {
        if self.session_mgr.get(session).is_none() {
            Err(ErrorCode::NoSession)?;
        }

        self.remove_session(session, true);

        Ok(())
    }

    pub(crate) fn remove_session(&mut self, session: SessionHandle, notify: bool) {
        let secure = self.is_secure(session);

        if notify && secure {
            if let Err(e) = self.send_close_session(session) {
                warn!("Could not notify the peer of {}: {}", session, e);
            }
        }

        for exchange in self.exch_mgr.for_session(session) {
            self.forget_exchange(exchange);
            self.exch_mgr.release(exchange);
        }

        self.ctr_sync.forget_session(session);

        if self.session_mgr.remove(session).is_some() {
            debug!("Removed session {}", session);

            if secure {
                info!("Closed secure session {}", session);
                self.events.push_back(Event::SessionClosed { session });
            }
        }
    }

    fn send_close_session(&mut self, session: SessionHandle) -> Result<(), Error> {
        let mut proto = ProtoHdr::new();
        MessageMeta::new(PROTO_ID_SECURE_CHANNEL, OpCode::StatusReport as u8, false)
            .set_into(&mut proto);
        proto.exch_id = self.exch_mgr.get_next_exch_id();
        proto.set_initiator(true);

        let payload = sc_status_report_payload(SCStatusCodes::CloseSession, None)?;

        self.send_raw(session, &proto, &payload)
    }

    /// Evicts the least recently used session that has no exchange open.
    /// Unless `evict_secure` is set only unauthenticated sessions qualify.
    fn evict_session(&mut self, evict_secure: bool) -> Result<(), Error> {
        let exch_mgr = &self.exch_mgr;
        let session = self
            .session_mgr
            .lru(|handle, s| {
                (evict_secure || !s.is_encrypted()) && exch_mgr.for_session(handle).is_empty()
            })
            .ok_or(ErrorCode::NoSpaceSessions)?;

        warn!("Evicting session {}", session);

        self.remove_session(session, true);

        Ok(())
    }

    /// Makes room for one more session. Room for an unauthenticated session
    /// opened by an unknown peer is never made at the expense of a secure
    /// one.
    pub(crate) fn ensure_session_slot(&mut self, evict_secure: bool) -> Result<(), Error> {
        if self.session_mgr.is_full() {
            self.evict_session(evict_secure)?;
        }

        Ok(())
    }

    /// Sends an unreliable message to a group. The outgoing group session is
    /// created on first use.
    pub fn send_group(
        &mut self,
        fab_idx: FabricIndex,
        group_id: GroupId,
        addr: Address,
        proto_id: u16,
        opcode: u8,
        payload: &[u8],
    ) -> Result<(), Error> {
        let session = match self.session_mgr.find_group(fab_idx, group_id) {
            Some(session) => session,
            None => {
                self.ensure_session_slot(true)?;

                let fabric_mgr = self.matter.fabric_mgr.borrow();
                self.session_mgr
                    .add_group(&fabric_mgr, fab_idx, group_id, addr)?
            }
        };

        let mut proto = ProtoHdr::new();
        MessageMeta::new(proto_id, opcode, false).set_into(&mut proto);
        proto.exch_id = self.exch_mgr.get_next_exch_id();
        proto.set_initiator(true);

        let (datagram, _) = self.session_mgr.encode(session, &proto, payload)?;
        self.outbox.push_back((addr, datagram));

        Ok(())
    }

    /// Closes every session, notifying secure peers, and drops all exchange
    /// and synchronization state. The CloseSession reports stay in the
    /// outbox.
    pub fn shutdown(&mut self) {
        for session in self.session_mgr.handles() {
            self.remove_session(session, true);
        }

        for exchange in self.exch_mgr.ids() {
            self.exch_mgr.release(exchange);
        }

        self.handshakes.clear();
        self.ctr_sync.clear();

        info!("Transport shut down");
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub fn pop_outgoing(&mut self) -> Option<(Address, Vec<u8>)> {
        self.outbox.pop_front()
    }

    /// Sends everything in the outbox. A datagram the network refuses is
    /// dropped; MRP retransmits it or reports `DeliveryFailed`.
    pub async fn flush<S>(&mut self, send: &mut S)
    where
        S: NetworkSend,
    {
        while let Some((addr, data)) = self.outbox.pop_front() {
            trace!("Sending {} bytes to {}", data.len(), addr);

            if let Err(e) = send.send_to(&data, addr).await {
                warn!("Failed to send {} bytes to {}: {}", data.len(), addr, e);
            }
        }
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Hands every queued event to `delegate`.
    pub fn process_events<D>(&mut self, delegate: &mut D)
    where
        D: AppDelegate + ?Sized,
    {
        while let Some(event) = self.events.pop_front() {
            match event {
                Event::Message(msg) => delegate.on_message(self, msg),
                Event::GroupMessage(msg) => delegate.on_group_message(self, msg),
                Event::ResponseTimeout { exchange, session } => {
                    delegate.on_response_timeout(self, exchange, session)
                }
                Event::DeliveryFailed { exchange, session } => {
                    delegate.on_delivery_failed(self, exchange, session)
                }
                Event::SessionEstablished {
                    session,
                    peer_node_id,
                    mode,
                } => delegate.on_session_established(self, session, peer_node_id, mode),
                Event::SessionEstablishmentFailed { exchange, error } => {
                    delegate.on_session_establishment_failed(self, exchange, error)
                }
                Event::SessionClosed { session } => delegate.on_session_closed(self, session),
            }
        }
    }
}
