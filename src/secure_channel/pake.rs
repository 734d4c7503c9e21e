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

use log::{debug, error, info};

use crate::crypto;
use crate::error::{Error, ErrorCode};
use crate::tlv::{get_root_node_struct, TLVWriter, TagType};
use crate::transport::exchange::ExchangeId;
use crate::transport::session::SessionKeys;
use crate::utils::{rand::Rand, writebuf::WriteBuf};

use super::common::{check_sc_status, EstablishmentState, SCStatusCodes};
use super::spake2p::{Spake2P, VerifierData, CRYPTO_PUBLIC_KEY_SIZE_BYTES};

pub const PASE_DISCARD_TIMEOUT: Duration = Duration::from_secs(60);

const PAKE_RANDOM_LEN: usize = 32;
const MAX_PAKE_MSG_LEN: usize = 160;

struct Timeout {
    start: Duration,
    exchange: ExchangeId,
}

impl Timeout {
    fn is_expired(&self, now: Duration, discard: Duration) -> bool {
        now.saturating_sub(self.start) > discard
    }
}

/// The commissionee side of PASE: holds the commissioning verifier while
/// the device is open for commissioning and serializes handshakes.
#[derive(Default)]
pub struct PaseMgr {
    verifier: Option<(VerifierData, u16)>,
    timeout: Option<Timeout>,
}

impl PaseMgr {
    pub const fn new() -> Self {
        Self {
            verifier: None,
            timeout: None,
        }
    }

    pub fn is_pase_session_enabled(&self) -> bool {
        self.verifier.is_some()
    }

    pub fn enable_pase_session(
        &mut self,
        verifier: VerifierData,
        discriminator: u16,
    ) -> Result<(), Error> {
        if self.verifier.is_some() {
            Err(ErrorCode::Invalid)?;
        }

        info!("PASE enabled, discriminator {}", discriminator);
        self.verifier = Some((verifier, discriminator));
        Ok(())
    }

    pub fn disable_pase_session(&mut self) {
        info!("PASE disabled");
        self.verifier = None;
        self.timeout = None;
    }

    pub fn discriminator(&self) -> Option<u16> {
        self.verifier.as_ref().map(|(_, d)| *d)
    }

    pub fn verifier(&self) -> Option<&VerifierData> {
        self.verifier.as_ref().map(|(v, _)| v)
    }

    /// Reserves the responder for a handshake running on `exchange`.
    ///
    /// `new` is set for the opening PBKDFParamRequest. A handshake on another
    /// exchange that has not exceeded the discard timeout makes this fail
    /// with `Busy`.
    pub fn claim(
        &mut self,
        exchange: ExchangeId,
        new: bool,
        now: Duration,
        discard: Duration,
    ) -> Result<(), SCStatusCodes> {
        if self.verifier.is_none() {
            error!("PASE not enabled");
            return Err(SCStatusCodes::InvalidParameter);
        }

        if self
            .timeout
            .as_ref()
            .map_or(false, |t| t.is_expired(now, discard))
        {
            debug!("Discarding stale PASE handshake");
            self.timeout = None;
        }

        match self.timeout.as_ref() {
            Some(t) if t.exchange != exchange => {
                debug!("Other PAKE session in progress");
                return Err(SCStatusCodes::Busy);
            }
            None if !new => {
                error!("PAKE session not found or expired");
                return Err(SCStatusCodes::SessionNotFound);
            }
            _ => (),
        }

        self.timeout = Some(Timeout {
            start: now,
            exchange,
        });

        Ok(())
    }

    /// Frees the responder if `exchange` holds it.
    pub fn release(&mut self, exchange: ExchangeId) {
        if self.timeout.as_ref().map(|t| t.exchange) == Some(exchange) {
            self.timeout = None;
        }
    }
}

/// A PASE handshake answered by this node.
pub struct PaseResponder {
    state: EstablishmentState,
    spake2p: Spake2P,
    local_sess_id: u16,
    peer_sess_id: u16,
}

impl PaseResponder {
    /// Answers a PBKDFParamRequest.
    pub fn handle_pbkdf_param_request(
        verifier: &VerifierData,
        req: &[u8],
        local_sess_id: u16,
        rand: Rand,
    ) -> Result<(Self, Vec<u8>), Error> {
        let root = get_root_node_struct(req)?;
        let initiator_random = root.find_tag(1)?.slice()?;
        let peer_sess_id = root.find_tag(2)?.u16()?;
        let passcode_id = root.find_tag(3)?.u16()?;
        let has_params = root.find_tag(4)?.bool()?;

        if passcode_id != 0 {
            error!("Can't yet handle passcode_id != 0");
            Err(ErrorCode::Invalid)?;
        }

        if initiator_random.len() != PAKE_RANDOM_LEN {
            Err(ErrorCode::InvalidData)?;
        }

        let mut our_random = [0; PAKE_RANDOM_LEN];
        rand(&mut our_random);

        let mut buf = [0; MAX_PAKE_MSG_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.str8(TagType::Context(1), initiator_random)?;
        tw.str8(TagType::Context(2), &our_random)?;
        tw.u16(TagType::Context(3), local_sess_id)?;
        if !has_params {
            tw.start_struct(TagType::Context(4))?;
            tw.u32(TagType::Context(1), verifier.count)?;
            tw.str8(TagType::Context(2), verifier.salt())?;
            tw.end_container()?;
        }
        tw.end_container()?;

        let mut spake2p = Spake2P::new();
        spake2p.set_context();
        spake2p.update_context(req)?;
        spake2p.update_context(wb.as_slice())?;

        Ok((
            Self {
                state: EstablishmentState::ReceivedResponse,
                spake2p,
                local_sess_id,
                peer_sess_id,
            },
            wb.as_slice().to_vec(),
        ))
    }

    /// Answers Pake1 with Pake2.
    #[allow(non_snake_case)]
    pub fn handle_pake1(
        &mut self,
        verifier: &VerifierData,
        payload: &[u8],
        rand: Rand,
    ) -> Result<Vec<u8>, Error> {
        if self.state != EstablishmentState::ReceivedResponse {
            Err(ErrorCode::InvalidState)?;
        }

        let pA = get_root_node_struct(payload)?.find_tag(1)?.slice()?;

        let mut pB = [0; CRYPTO_PUBLIC_KEY_SIZE_BYTES];
        let mut cB = [0; crypto::SHA256_HASH_LEN_BYTES];

        let result = self
            .spake2p
            .start_verifier(verifier)
            .and_then(|_| self.spake2p.handle_pA(pA, &mut pB, &mut cB, rand));
        if let Err(e) = result {
            self.state = EstablishmentState::Failed;
            return Err(e);
        }

        self.state = EstablishmentState::KeysDerived;

        let mut buf = [0; MAX_PAKE_MSG_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.str8(TagType::Context(1), &pB)?;
        tw.str8(TagType::Context(2), &cB)?;
        tw.end_container()?;

        Ok(wb.as_slice().to_vec())
    }

    /// Checks the confirmation in Pake3. The returned status is what goes
    /// back to the initiator; keys are only produced on success.
    #[allow(non_snake_case)]
    pub fn handle_pake3(&mut self, payload: &[u8]) -> (SCStatusCodes, Option<SessionKeys>) {
        if self.state != EstablishmentState::KeysDerived {
            return (SCStatusCodes::SessionNotFound, None);
        }

        let Ok(cA) = get_root_node_struct(payload)
            .and_then(|root| root.find_tag(1))
            .and_then(|cA| cA.slice())
        else {
            self.state = EstablishmentState::Failed;
            return (SCStatusCodes::InvalidParameter, None);
        };

        let (status, keys) = match self.spake2p.handle_cA(cA) {
            (SCStatusCodes::SessionEstablishmentSuccess, Some(ke)) => {
                match SessionKeys::derive(&[], ke) {
                    Ok(keys) => (SCStatusCodes::SessionEstablishmentSuccess, Some(keys)),
                    Err(_) => (SCStatusCodes::InvalidParameter, None),
                }
            }
            (status, _) => (status, None),
        };

        self.state = if keys.is_some() {
            EstablishmentState::Established
        } else {
            error!("PASE confirmation failed: {:?}", status);
            EstablishmentState::Failed
        };

        (status, keys)
    }

    pub fn state(&self) -> EstablishmentState {
        self.state
    }

    pub fn local_sess_id(&self) -> u16 {
        self.local_sess_id
    }

    pub fn peer_sess_id(&self) -> u16 {
        self.peer_sess_id
    }
}

/// The commissioner side of PASE, proving knowledge of the passcode.
pub struct PaseInitiator {
    state: EstablishmentState,
    spake2p: Spake2P,
    passcode: u32,
    random: [u8; PAKE_RANDOM_LEN],
    local_sess_id: u16,
    peer_sess_id: u16,
    keys: Option<SessionKeys>,
}

impl PaseInitiator {
    /// Starts a handshake. Returns the PBKDFParamRequest to send.
    pub fn new(passcode: u32, local_sess_id: u16, rand: Rand) -> Result<(Self, Vec<u8>), Error> {
        let mut random = [0; PAKE_RANDOM_LEN];
        rand(&mut random);

        let mut buf = [0; MAX_PAKE_MSG_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.str8(TagType::Context(1), &random)?;
        tw.u16(TagType::Context(2), local_sess_id)?;
        tw.u16(TagType::Context(3), 0)?;
        tw.bool(TagType::Context(4), false)?;
        tw.end_container()?;

        let mut spake2p = Spake2P::new();
        spake2p.set_context();
        spake2p.update_context(wb.as_slice())?;

        Ok((
            Self {
                state: EstablishmentState::SentRequest,
                spake2p,
                passcode,
                random,
                local_sess_id,
                peer_sess_id: 0,
                keys: None,
            },
            wb.as_slice().to_vec(),
        ))
    }

    /// Processes the PBKDFParamResponse. Returns Pake1.
    #[allow(non_snake_case)]
    pub fn handle_pbkdf_param_response(
        &mut self,
        payload: &[u8],
        rand: Rand,
    ) -> Result<Vec<u8>, Error> {
        if self.state != EstablishmentState::SentRequest {
            Err(ErrorCode::InvalidState)?;
        }
        self.state = EstablishmentState::Failed;

        let root = get_root_node_struct(payload)?;
        if !crypto::ct_equal(root.find_tag(1)?.slice()?, &self.random) {
            error!("PBKDFParamResponse does not echo our random");
            Err(ErrorCode::InvalidData)?;
        }

        let peer_sess_id = root.find_tag(3)?.u16()?;
        let params = root.find_tag(4)?.confirm_struct()?;
        let count = params.find_tag(1)?.u32()?;
        let salt = params.find_tag(2)?.slice()?;

        self.spake2p.update_context(payload)?;
        self.spake2p.start_prover(self.passcode, count, salt)?;

        let mut pA = [0; CRYPTO_PUBLIC_KEY_SIZE_BYTES];
        self.spake2p.get_pA(&mut pA, rand)?;

        let mut buf = [0; MAX_PAKE_MSG_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.str8(TagType::Context(1), &pA)?;
        tw.end_container()?;

        self.peer_sess_id = peer_sess_id;
        self.state = EstablishmentState::ReceivedResponse;

        Ok(wb.as_slice().to_vec())
    }

    /// Verifies Pake2 and derives the session keys. Returns Pake3.
    #[allow(non_snake_case)]
    pub fn handle_pake2(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        if self.state != EstablishmentState::ReceivedResponse {
            Err(ErrorCode::InvalidState)?;
        }
        self.state = EstablishmentState::Failed;

        let root = get_root_node_struct(payload)?;
        let pB = root.find_tag(1)?.slice()?;
        let cB = root.find_tag(2)?.slice()?;

        let mut cA = [0; crypto::SHA256_HASH_LEN_BYTES];
        self.spake2p.handle_pB_cB(pB, cB, &mut cA)?;

        let ke = self.spake2p.prover_ke().ok_or(ErrorCode::InvalidState)?;
        self.keys = Some(SessionKeys::derive(&[], ke)?);

        let mut buf = [0; MAX_PAKE_MSG_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.str8(TagType::Context(1), &cA)?;
        tw.end_container()?;

        self.state = EstablishmentState::KeysDerived;

        Ok(wb.as_slice().to_vec())
    }

    /// Processes the responder's final status report.
    pub fn handle_status_report(&mut self, payload: &[u8]) -> Result<SessionKeys, Error> {
        let result = match check_sc_status(payload) {
            Ok(SCStatusCodes::SessionEstablishmentSuccess)
                if self.state == EstablishmentState::KeysDerived =>
            {
                self.keys
                    .take()
                    .ok_or_else(|| Error::from(ErrorCode::InvalidState))
            }
            Ok(_) => Err(Error::from(ErrorCode::InvalidState)),
            Err(e) => Err(e),
        };

        self.state = if result.is_ok() {
            EstablishmentState::Established
        } else {
            self.keys = None;
            EstablishmentState::Failed
        };

        result
    }

    pub fn state(&self) -> EstablishmentState {
        self.state
    }

    pub fn local_sess_id(&self) -> u16 {
        self.local_sess_id
    }

    pub fn peer_sess_id(&self) -> u16 {
        self.peer_sess_id
    }
}
