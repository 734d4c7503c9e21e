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

//! Secure channel message handling: PASE and CASE handshakes, message
//! counter synchronization and CloseSession.

use core::time::Duration;

use log::{debug, error, info, warn};

use crate::error::*;
use crate::group_id::{FabricIndex, NodeId, MIN_TEMPORARY_LOCAL_NODE_ID};
use crate::transport::dispatch::ExchangeDispatch;
use crate::transport::exchange::{ExchangeId, MessageMeta, ResponsePolicy};
use crate::transport::mgr::{Event, Handshake, RxMessage, TransportMgr};
use crate::transport::network::Address;
use crate::transport::packet::Packet;
use crate::transport::session::{
    CaseDetails, SessionHandle, SessionKeys, SessionMode, SessionParams, SessionRole,
};

use super::case::{self, CaseInitiator, CaseResponder};
use super::common::{
    busy_status_report_payload, check_sc_status, sc_status_report_payload, OpCode,
    SCStatusCodes, PROTO_ID_SECURE_CHANNEL,
};
use super::msg_counter::{decode_sync_req, decode_sync_resp, encode_sync_resp};
use super::pake::{PaseInitiator, PaseResponder};

impl<'a> TransportMgr<'a> {
    /// Starts a PASE handshake with a commissionable node. The outcome is
    /// reported with `SessionEstablished` or `SessionEstablishmentFailed`
    /// for the returned exchange.
    pub fn establish_pase(&mut self, peer: Address, passcode: u32) -> Result<ExchangeId, Error> {
        let timeout = self.matter.config().pase_discard_timeout;

        let exchange = self.initiate(peer, |mgr, local_sess_id| {
            let (initiator, req) = PaseInitiator::new(passcode, local_sess_id, mgr.matter.rand)?;
            Ok((
                Handshake::PaseInitiator(initiator),
                OpCode::PBKDFParamRequest,
                req,
                timeout,
            ))
        })?;

        info!("PASE with {} started on {}", peer, exchange);

        Ok(exchange)
    }

    /// Starts a CASE handshake with `peer_node_id` on the fabric at
    /// `fab_idx`.
    pub fn establish_case(
        &mut self,
        peer: Address,
        fab_idx: FabricIndex,
        peer_node_id: NodeId,
    ) -> Result<ExchangeId, Error> {
        let timeout = self.matter.config().case_timeout;

        let exchange = self.initiate(peer, |mgr, local_sess_id| {
            let fabric_mgr = mgr.matter.fabric_mgr.borrow();
            let fabric = fabric_mgr
                .get_fabric(fab_idx)
                .ok_or(ErrorCode::NoFabricId)?;

            let (initiator, sigma1) =
                CaseInitiator::new(fabric, fab_idx, peer_node_id, local_sess_id, mgr.matter.rand)?;

            Ok((
                Handshake::CaseInitiator(initiator),
                OpCode::CASESigma1,
                sigma1,
                timeout,
            ))
        })?;

        info!(
            "CASE with node {:x} at {} started on {}",
            peer_node_id, peer, exchange
        );

        Ok(exchange)
    }

    /// Opens an unauthenticated session with a fresh ephemeral node id and
    /// sends the first handshake message on a new exchange.
    fn initiate<F>(&mut self, peer: Address, start: F) -> Result<ExchangeId, Error>
    where
        F: FnOnce(&Self, u16) -> Result<(Handshake, OpCode, Vec<u8>, Duration), Error>,
    {
        self.ensure_session_slot(true)?;

        let mut node = [0; 4];
        (self.matter.rand)(&mut node);
        let local_nodeid = MIN_TEMPORARY_LOCAL_NODE_ID + u32::from_le_bytes(node) as u64;

        let session = self.session_mgr.add(peer, Some(local_nodeid), None)?;
        let local_sess_id = self.session_mgr.get_next_sess_id();

        let result = self.new_exchange(session).and_then(|exchange| {
            let (handshake, opcode, payload, timeout) = start(self, local_sess_id)?;
            self.handshakes.push((exchange, handshake));
            self.send_handshake(exchange, opcode, &payload, Some(timeout))?;

            Ok(exchange)
        });

        if result.is_err() {
            self.remove_session(session, false);
        }

        result
    }

    fn send_handshake(
        &mut self,
        exchange: ExchangeId,
        opcode: OpCode,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.send_message(
            exchange,
            MessageMeta::new(PROTO_ID_SECURE_CHANNEL, opcode as u8, true),
            payload,
            timeout.map(|timeout| ResponsePolicy {
                timeout,
                retries: 0,
            }),
        )
    }

    fn send_status(
        &mut self,
        exchange: ExchangeId,
        status: SCStatusCodes,
    ) -> Result<(), Error> {
        let payload = if status == SCStatusCodes::Busy {
            busy_status_report_payload()?
        } else {
            sc_status_report_payload(status, None)?
        };

        self.send_handshake(exchange, OpCode::StatusReport, &payload, None)
    }

    pub(crate) fn is_handshake(&self, exchange: ExchangeId) -> bool {
        self.handshakes.iter().any(|(id, _)| *id == exchange)
    }

    fn take_handshake(&mut self, exchange: ExchangeId) -> Option<Handshake> {
        let index = self.handshakes.iter().position(|(id, _)| *id == exchange)?;

        Some(self.handshakes.swap_remove(index).1)
    }

    /// Aborts the handshake on `exchange`, optionally telling the peer why.
    pub(crate) fn fail_handshake(
        &mut self,
        exchange: ExchangeId,
        error: ErrorCode,
        status: Option<SCStatusCodes>,
    ) {
        error!("Session establishment on {} failed: {:?}", exchange, error);

        self.handshakes.retain(|(id, _)| *id != exchange);
        self.matter.pase_mgr.borrow_mut().release(exchange);

        if let Some(status) = status {
            if let Err(e) = self.send_status(exchange, status) {
                warn!("Could not report {:?} on {}: {}", status, exchange, e);
            }
        }

        if self.exch_mgr.get(exchange).is_some() {
            if let Err(e) = self.close_exchange(exchange) {
                warn!("Could not close {}: {}", exchange, e);
            }
        }

        self.events
            .push_back(Event::SessionEstablishmentFailed { exchange, error });
    }

    /// Fails a handshake whose peer went silent and drops its unauthenticated
    /// session once nothing else runs on it.
    pub(crate) fn abandon_handshake(&mut self, exchange: ExchangeId) {
        let session = self.exch_mgr.get(exchange).map(|exch| exch.session());

        self.fail_handshake(exchange, ErrorCode::RxTimeout, None);

        let Some(session) = session else {
            return;
        };

        let plain = self
            .session_mgr
            .get(session)
            .map_or(false, |s| s.mode() == SessionMode::PlainText);
        let idle = self
            .exch_mgr
            .for_session(session)
            .into_iter()
            .all(|id| self.exch_mgr.get(id).map_or(true, |exch| exch.is_closing()));

        if plain && idle {
            debug!("Dropping the session of abandoned {}", exchange);
            self.remove_session(session, false);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn install_session(
        &mut self,
        exchange: ExchangeId,
        mode: SessionMode,
        role: SessionRole,
        local_sess_id: u16,
        peer_sess_id: u16,
        local_nodeid: NodeId,
        peer_nodeid: Option<NodeId>,
        keys: SessionKeys,
    ) -> Result<SessionHandle, Error> {
        let plain = self
            .exch_mgr
            .get(exchange)
            .ok_or(ErrorCode::NoExchange)?
            .session();
        let peer_addr = self
            .session_mgr
            .get(plain)
            .ok_or(ErrorCode::NoSession)?
            .peer_addr();

        self.ensure_session_slot(true)?;

        let session = self.session_mgr.add_secure(SessionParams {
            mode,
            role,
            local_sess_id,
            peer_sess_id,
            peer_addr,
            local_nodeid,
            peer_nodeid: peer_nodeid.unwrap_or(0),
            keys,
        })?;

        info!(
            "{:?} session {} established with {} ({:?})",
            mode, session, peer_addr, role
        );

        self.events.push_back(Event::SessionEstablished {
            session,
            peer_node_id: peer_nodeid,
            mode,
        });

        Ok(session)
    }

    /// Handles a secure channel message that was accepted on `exchange`.
    pub(crate) fn handle_sc(
        &mut self,
        exchange: ExchangeId,
        session: SessionHandle,
        dispatch: ExchangeDispatch,
        rx: Packet,
    ) -> Result<(), Error> {
        let Some(opcode) = rx.sc_opcode() else {
            return Err(ErrorCode::InvalidOpcode.into());
        };

        match opcode {
            OpCode::MsgCounterSyncReq => self.handle_sync_req(exchange, session, &rx.payload),
            OpCode::MsgCounterSyncResp => self.handle_sync_resp(exchange, session, &rx.payload),
            OpCode::StatusReport if dispatch == ExchangeDispatch::Application => {
                self.handle_app_status_report(exchange, session, rx)
            }
            _ => {
                if let Err(e) = self.handle_establishment(exchange, opcode, &rx.payload) {
                    self.fail_handshake(exchange, e.code(), Some(case::failure_status(&e)));
                }

                Ok(())
            }
        }
    }

    fn handle_sync_req(
        &mut self,
        exchange: ExchangeId,
        session: SessionHandle,
        payload: &[u8],
    ) -> Result<(), Error> {
        let challenge = decode_sync_req(payload)?;

        // The response carries the counter it is sent with
        let ctr = self
            .session_mgr
            .peek_ctr(session)
            .ok_or(ErrorCode::NoSession)?;

        debug!("Answering counter sync on {} with {}", session, ctr);

        self.send_message(
            exchange,
            MessageMeta::new(
                PROTO_ID_SECURE_CHANNEL,
                OpCode::MsgCounterSyncResp as u8,
                true,
            ),
            &encode_sync_resp(ctr, &challenge),
            None,
        )?;

        self.close_exchange(exchange)
    }

    fn handle_sync_resp(
        &mut self,
        exchange: ExchangeId,
        session: SessionHandle,
        payload: &[u8],
    ) -> Result<(), Error> {
        if self.ctr_sync.exchange(session) != Some(exchange) {
            warn!("Unexpected counter sync response on {}", exchange);
            Err(ErrorCode::InvalidState)?;
        }

        let (ctr, challenge) = decode_sync_resp(payload)?;
        let queued = self.ctr_sync.complete(session, &challenge)?;

        let adopted = self
            .session_mgr
            .get_mut(session)
            .ok_or(ErrorCode::NoSession)?
            .set_rx_synced(ctr);

        if adopted {
            info!("Peer counter of {} synchronized to {}", session, ctr);
        } else {
            debug!("Peer counter of {} already tracked, keeping the window", session);
        }

        self.close_exchange(exchange)?;

        for (peer, data) in queued {
            self.handle_message_received(peer, &data)?;
        }

        Ok(())
    }

    fn handle_app_status_report(
        &mut self,
        exchange: ExchangeId,
        session: SessionHandle,
        rx: Packet,
    ) -> Result<(), Error> {
        if let Ok(SCStatusCodes::CloseSession) = check_sc_status(&rx.payload) {
            info!("Peer closed session {}", session);
            self.remove_session(session, false);
            return Ok(());
        }

        self.events.push_back(Event::Message(RxMessage {
            exchange,
            session,
            peer: rx.peer,
            proto_id: rx.proto.proto_id,
            opcode: rx.proto.proto_opcode,
            payload: rx.payload,
        }));

        Ok(())
    }

    fn handle_establishment(
        &mut self,
        exchange: ExchangeId,
        opcode: OpCode,
        payload: &[u8],
    ) -> Result<(), Error> {
        match opcode {
            OpCode::PBKDFParamRequest => self.handle_pbkdf_param_request(exchange, payload),
            OpCode::PASEPake1 => self.handle_pake1(exchange, payload),
            OpCode::PASEPake3 => self.handle_pake3(exchange, payload),
            OpCode::PBKDFParamResponse => self.handle_pbkdf_param_response(exchange, payload),
            OpCode::PASEPake2 => self.handle_pake2(exchange, payload),
            OpCode::CASESigma1 => self.handle_sigma1(exchange, payload),
            OpCode::CASESigma2 => self.handle_sigma2(exchange, payload),
            OpCode::CASESigma3 => self.handle_sigma3(exchange, payload),
            OpCode::StatusReport => self.handle_establishment_status(exchange, payload),
            OpCode::CASESigma2Resume => {
                error!("Session resumption is not supported");
                Err(ErrorCode::InvalidOpcode.into())
            }
            _ => Err(ErrorCode::InvalidOpcode.into()),
        }
    }

    fn claim_pase(&mut self, exchange: ExchangeId, new: bool) -> Result<bool, Error> {
        let now = self.now();
        let discard = self.matter.config().pase_discard_timeout;

        let claimed = self
            .matter
            .pase_mgr
            .borrow_mut()
            .claim(exchange, new, now, discard);

        match claimed {
            Ok(()) => Ok(true),
            Err(status) => {
                // Refusals do not disturb a handshake running elsewhere
                warn!("PASE on {} refused: {:?}", exchange, status);
                self.send_status(exchange, status)?;
                self.close_exchange(exchange)?;
                Ok(false)
            }
        }
    }

    fn handle_pbkdf_param_request(
        &mut self,
        exchange: ExchangeId,
        payload: &[u8],
    ) -> Result<(), Error> {
        if !self.claim_pase(exchange, true)? {
            return Ok(());
        }

        let local_sess_id = self.session_mgr.get_next_sess_id();
        let (responder, resp) = {
            let pase_mgr = self.matter.pase_mgr.borrow();
            let verifier = pase_mgr.verifier().ok_or(ErrorCode::InvalidState)?;

            PaseResponder::handle_pbkdf_param_request(
                verifier,
                payload,
                local_sess_id,
                self.matter.rand,
            )?
        };

        self.handshakes
            .push((exchange, Handshake::PaseResponder(responder)));

        let timeout = self.matter.config().pase_discard_timeout;
        self.send_handshake(exchange, OpCode::PBKDFParamResponse, &resp, Some(timeout))
    }

    fn handle_pake1(&mut self, exchange: ExchangeId, payload: &[u8]) -> Result<(), Error> {
        if !self.claim_pase(exchange, false)? {
            return Ok(());
        }

        let Some(Handshake::PaseResponder(mut responder)) = self.take_handshake(exchange) else {
            return Err(ErrorCode::InvalidState.into());
        };

        let pake2 = {
            let pase_mgr = self.matter.pase_mgr.borrow();
            let verifier = pase_mgr.verifier().ok_or(ErrorCode::InvalidState)?;

            responder.handle_pake1(verifier, payload, self.matter.rand)?
        };

        self.handshakes
            .push((exchange, Handshake::PaseResponder(responder)));

        let timeout = self.matter.config().pase_discard_timeout;
        self.send_handshake(exchange, OpCode::PASEPake2, &pake2, Some(timeout))
    }

    fn handle_pake3(&mut self, exchange: ExchangeId, payload: &[u8]) -> Result<(), Error> {
        let Some(Handshake::PaseResponder(mut responder)) = self.take_handshake(exchange) else {
            return Err(ErrorCode::InvalidState.into());
        };

        let (status, keys) = responder.handle_pake3(payload);
        self.send_status(exchange, status)?;

        let Some(keys) = keys else {
            self.fail_handshake(exchange, ErrorCode::Crypto, None);
            return Ok(());
        };

        self.matter.pase_mgr.borrow_mut().release(exchange);

        self.install_session(
            exchange,
            SessionMode::Pase,
            SessionRole::Responder,
            responder.local_sess_id(),
            responder.peer_sess_id(),
            0,
            None,
            keys,
        )?;

        self.close_exchange(exchange)
    }

    fn handle_pbkdf_param_response(
        &mut self,
        exchange: ExchangeId,
        payload: &[u8],
    ) -> Result<(), Error> {
        let Some(Handshake::PaseInitiator(mut initiator)) = self.take_handshake(exchange) else {
            return Err(ErrorCode::InvalidState.into());
        };

        let pake1 = initiator.handle_pbkdf_param_response(payload, self.matter.rand)?;

        self.handshakes
            .push((exchange, Handshake::PaseInitiator(initiator)));

        let timeout = self.matter.config().pase_discard_timeout;
        self.send_handshake(exchange, OpCode::PASEPake1, &pake1, Some(timeout))
    }

    fn handle_pake2(&mut self, exchange: ExchangeId, payload: &[u8]) -> Result<(), Error> {
        let Some(Handshake::PaseInitiator(mut initiator)) = self.take_handshake(exchange) else {
            return Err(ErrorCode::InvalidState.into());
        };

        let pake3 = initiator.handle_pake2(payload)?;

        self.handshakes
            .push((exchange, Handshake::PaseInitiator(initiator)));

        let timeout = self.matter.config().pase_discard_timeout;
        self.send_handshake(exchange, OpCode::PASEPake3, &pake3, Some(timeout))
    }

    fn handle_sigma1(&mut self, exchange: ExchangeId, payload: &[u8]) -> Result<(), Error> {
        let local_sess_id = self.session_mgr.get_next_sess_id();

        let (responder, sigma2) = {
            let fabric_mgr = self.matter.fabric_mgr.borrow();
            CaseResponder::handle_sigma1(&fabric_mgr, payload, local_sess_id, self.matter.rand)?
        };

        self.handshakes
            .push((exchange, Handshake::CaseResponder(responder)));

        let timeout = self.matter.config().case_timeout;
        self.send_handshake(exchange, OpCode::CASESigma2, &sigma2, Some(timeout))
    }

    fn handle_sigma2(&mut self, exchange: ExchangeId, payload: &[u8]) -> Result<(), Error> {
        let Some(Handshake::CaseInitiator(mut initiator)) = self.take_handshake(exchange) else {
            return Err(ErrorCode::InvalidState.into());
        };

        let sigma3 = {
            let fabric_mgr = self.matter.fabric_mgr.borrow();
            let fabric = fabric_mgr
                .get_fabric(initiator.fab_idx())
                .ok_or(ErrorCode::NoFabricId)?;

            initiator.handle_sigma2(fabric, payload)?
        };

        self.handshakes
            .push((exchange, Handshake::CaseInitiator(initiator)));

        let timeout = self.matter.config().case_timeout;
        self.send_handshake(exchange, OpCode::CASESigma3, &sigma3, Some(timeout))
    }

    fn handle_sigma3(&mut self, exchange: ExchangeId, payload: &[u8]) -> Result<(), Error> {
        let Some(Handshake::CaseResponder(mut responder)) = self.take_handshake(exchange) else {
            return Err(ErrorCode::InvalidState.into());
        };

        let (keys, peer_node_id, local_node_id) = {
            let fabric_mgr = self.matter.fabric_mgr.borrow();
            let (keys, peer_node_id) = responder.handle_sigma3(&fabric_mgr, payload)?;
            let local_node_id = fabric_mgr
                .get_fabric(responder.fab_idx())
                .ok_or(ErrorCode::NoFabricId)?
                .get_node_id();

            (keys, peer_node_id, local_node_id)
        };

        self.send_status(exchange, SCStatusCodes::SessionEstablishmentSuccess)?;

        self.install_session(
            exchange,
            SessionMode::Case(CaseDetails {
                fab_idx: responder.fab_idx(),
            }),
            SessionRole::Responder,
            responder.local_sess_id(),
            responder.peer_sess_id(),
            local_node_id,
            Some(peer_node_id),
            keys,
        )?;

        self.close_exchange(exchange)
    }

    fn handle_establishment_status(
        &mut self,
        exchange: ExchangeId,
        payload: &[u8],
    ) -> Result<(), Error> {
        let established = match self.take_handshake(exchange) {
            Some(Handshake::PaseInitiator(mut initiator)) => {
                initiator.handle_status_report(payload).map(|keys| {
                    (
                        SessionMode::Pase,
                        initiator.local_sess_id(),
                        initiator.peer_sess_id(),
                        0,
                        None,
                        keys,
                    )
                })
            }
            Some(Handshake::CaseInitiator(mut initiator)) => {
                initiator.handle_status_report(payload).and_then(|keys| {
                    let local_node_id = self
                        .matter
                        .fabric_mgr
                        .borrow()
                        .get_fabric(initiator.fab_idx())
                        .ok_or(ErrorCode::NoFabricId)?
                        .get_node_id();

                    Ok((
                        SessionMode::Case(CaseDetails {
                            fab_idx: initiator.fab_idx(),
                        }),
                        initiator.local_sess_id(),
                        initiator.peer_sess_id(),
                        local_node_id,
                        Some(initiator.peer_node_id()),
                        keys,
                    ))
                })
            }
            _ => {
                let error = match check_sc_status(payload) {
                    Ok(_) => ErrorCode::InvalidState,
                    Err(e) => e.code(),
                };

                warn!("Peer aborted the handshake on {}", exchange);
                self.fail_handshake(exchange, error, None);

                return Ok(());
            }
        };

        match established {
            Ok((mode, local_sess_id, peer_sess_id, local_nodeid, peer_nodeid, keys)) => {
                self.install_session(
                    exchange,
                    mode,
                    SessionRole::Initiator,
                    local_sess_id,
                    peer_sess_id,
                    local_nodeid,
                    peer_nodeid,
                    keys,
                )?;
            }
            Err(e) => {
                // A refusal from the responder is not answered
                self.fail_handshake(exchange, e.code(), None);
                return Ok(());
            }
        }

        self.close_exchange(exchange)
    }
}
