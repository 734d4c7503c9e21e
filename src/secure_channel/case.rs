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

use log::{error, trace};
use zeroize::Zeroize;

use crate::crypto::{self, KeyPair, Sha256};
use crate::error::{Error, ErrorCode};
use crate::fabric::{Fabric, FabricMgr, OpCredential, MAX_CREDENTIAL_LEN};
use crate::group_id::{FabricIndex, NodeId};
use crate::tlv::{get_root_node_struct, TLVWriter, TagType};
use crate::transport::session::SessionKeys;
use crate::utils::{rand::Rand, writebuf::WriteBuf};

use super::common::{check_sc_status, EstablishmentState, SCStatusCodes};

const SIGMA_RANDOM_LEN: usize = 32;
const MAX_SIGMA_MSG_LEN: usize = 512;
const MAX_TBS_LEN: usize = 400;

const S2K_INFO: &[u8] = b"Sigma2";
const S3K_INFO: &[u8] = b"Sigma3";

const SIGMA2_NONCE: &[u8; crypto::AEAD_NONCE_LEN_BYTES] = b"NCASE_Sigma2N";
const SIGMA3_NONCE: &[u8; crypto::AEAD_NONCE_LEN_BYTES] = b"NCASE_Sigma3N";

fn get_tbs(
    credential: &[u8],
    sender_pub_key: &[u8],
    receiver_pub_key: &[u8],
    buf: &mut [u8],
) -> Result<usize, Error> {
    let mut wb = WriteBuf::new(buf);
    let mut tw = TLVWriter::new(&mut wb);
    tw.start_struct(TagType::Anonymous)?;
    tw.str8(TagType::Context(1), credential)?;
    tw.str8(TagType::Context(2), sender_pub_key)?;
    tw.str8(TagType::Context(3), receiver_pub_key)?;
    tw.end_container()?;

    Ok(wb.as_slice().len())
}

/// Builds the plaintext of an encrypted Sigma2/Sigma3 part: our credential
/// and our signature binding it to both ephemeral keys.
fn get_tbe(fabric: &Fabric, our_pub_key: &[u8], peer_pub_key: &[u8]) -> Result<Vec<u8>, Error> {
    let mut credential = [0; MAX_CREDENTIAL_LEN];
    let credential_len = fabric.credential().encode(&mut credential)?;
    let credential = &credential[..credential_len];

    let mut tbs = [0; MAX_TBS_LEN];
    let tbs_len = get_tbs(credential, our_pub_key, peer_pub_key, &mut tbs)?;

    let mut signature = [0; crypto::EC_SIGNATURE_LEN_BYTES];
    fabric.sign_msg(&tbs[..tbs_len], &mut signature)?;

    let mut buf = [0; MAX_SIGMA_MSG_LEN];
    let mut wb = WriteBuf::new(&mut buf);
    let mut tw = TLVWriter::new(&mut wb);
    tw.start_struct(TagType::Anonymous)?;
    tw.str8(TagType::Context(1), credential)?;
    tw.str8(TagType::Context(2), &signature)?;
    tw.end_container()?;

    Ok(wb.as_slice().to_vec())
}

/// Checks the peer's credential against our fabric and its signature over
/// the ephemeral keys. Returns the peer's node id.
fn validate_peer(
    fabric: &Fabric,
    tbe: &[u8],
    peer_pub_key: &[u8],
    our_pub_key: &[u8],
    expected_node_id: Option<NodeId>,
) -> Result<NodeId, Error> {
    let root = get_root_node_struct(tbe)?;
    let credential_bytes = root.find_tag(1)?.slice()?;
    let signature = root.find_tag(2)?.slice()?;

    let credential = OpCredential::decode(credential_bytes)?;
    credential.verify(fabric.root_pubkey()).map_err(|e| {
        error!("Peer credential is not issued by our fabric: {}", e);
        e
    })?;

    if credential.fabric_id != fabric.get_fabric_id() {
        error!("Peer credential is for fabric {:x}", credential.fabric_id);
        Err(ErrorCode::Invalid)?;
    }

    if let Some(expected) = expected_node_id {
        if credential.node_id != expected {
            error!(
                "Expected node {:x}, peer presented {:x}",
                expected, credential.node_id
            );
            Err(ErrorCode::Invalid)?;
        }
    }

    let mut tbs = [0; MAX_TBS_LEN];
    let tbs_len = get_tbs(credential_bytes, peer_pub_key, our_pub_key, &mut tbs)?;

    KeyPair::new_from_public(&credential.pubkey)?.verify_msg(&tbs[..tbs_len], signature)?;

    Ok(credential.node_id)
}

fn derive_key(
    ipk: &[u8],
    salt_parts: &[&[u8]],
    shared_secret: &[u8],
    info: &[u8],
) -> Result<[u8; crypto::SYMM_KEY_LEN_BYTES], Error> {
    let mut salt = Vec::with_capacity(256);
    salt.extend_from_slice(ipk);
    for part in salt_parts {
        salt.extend_from_slice(part);
    }

    let mut key = [0; crypto::SYMM_KEY_LEN_BYTES];
    crypto::hkdf_sha256(&salt, shared_secret, info, &mut key)?;

    Ok(key)
}

fn encrypt_tbe(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let mut buf = plaintext.to_vec();
    buf.resize(plaintext.len() + crypto::AEAD_MIC_LEN_BYTES, 0);

    let len = crypto::encrypt_in_place(key, nonce, &[], &mut buf, plaintext.len())?;
    buf.truncate(len);

    Ok(buf)
}

fn decrypt_tbe(key: &[u8], nonce: &[u8], encrypted: &[u8]) -> Result<Vec<u8>, Error> {
    let mut buf = encrypted.to_vec();

    let len = crypto::decrypt_in_place(key, nonce, &[], &mut buf)?;
    buf.truncate(len);

    Ok(buf)
}

fn get_session_keys(ipk: &[u8], tt_hash: &Sha256, shared_secret: &[u8]) -> Result<SessionKeys, Error> {
    let mut hash = [0; crypto::SHA256_HASH_LEN_BYTES];
    tt_hash.peek(&mut hash);

    let mut salt = Vec::with_capacity(ipk.len() + hash.len());
    salt.extend_from_slice(ipk);
    salt.extend_from_slice(&hash);

    SessionKeys::derive(&salt, shared_secret)
}

/// A CASE handshake opened by this node towards a peer on one of our
/// fabrics.
pub struct CaseInitiator {
    state: EstablishmentState,
    fab_idx: FabricIndex,
    peer_node_id: NodeId,
    local_sess_id: u16,
    peer_sess_id: u16,
    key_pair: KeyPair,
    our_pub_key: [u8; crypto::EC_POINT_LEN_BYTES],
    peer_pub_key: [u8; crypto::EC_POINT_LEN_BYTES],
    shared_secret: [u8; crypto::ECDH_SHARED_SECRET_LEN_BYTES],
    tt_hash: Sha256,
    keys: Option<SessionKeys>,
}

impl CaseInitiator {
    /// Starts a handshake. Returns Sigma1.
    pub fn new(
        fabric: &Fabric,
        fab_idx: FabricIndex,
        peer_node_id: NodeId,
        local_sess_id: u16,
        rand: Rand,
    ) -> Result<(Self, Vec<u8>), Error> {
        let key_pair = KeyPair::new(rand)?;
        let mut our_pub_key = [0; crypto::EC_POINT_LEN_BYTES];
        key_pair.get_public_key(&mut our_pub_key)?;

        let mut random = [0; SIGMA_RANDOM_LEN];
        rand(&mut random);

        let mut dest_id = [0; crypto::SHA256_HASH_LEN_BYTES];
        crate::fabric::compute_dest_id(
            fabric.ipk().op_key(),
            &random,
            fabric.root_pubkey(),
            fabric.get_fabric_id(),
            peer_node_id,
            &mut dest_id,
        )?;

        let mut buf = [0; MAX_SIGMA_MSG_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.str8(TagType::Context(1), &random)?;
        tw.u16(TagType::Context(2), local_sess_id)?;
        tw.str8(TagType::Context(3), &dest_id)?;
        tw.str8(TagType::Context(4), &our_pub_key)?;
        tw.end_container()?;

        let sigma1 = wb.as_slice().to_vec();

        let mut tt_hash = Sha256::new();
        tt_hash.update(&sigma1);

        Ok((
            Self {
                state: EstablishmentState::SentRequest,
                fab_idx,
                peer_node_id,
                local_sess_id,
                peer_sess_id: 0,
                key_pair,
                our_pub_key,
                peer_pub_key: [0; crypto::EC_POINT_LEN_BYTES],
                shared_secret: [0; crypto::ECDH_SHARED_SECRET_LEN_BYTES],
                tt_hash,
                keys: None,
            },
            sigma1,
        ))
    }

    /// Authenticates the responder from Sigma2. Returns Sigma3.
    pub fn handle_sigma2(&mut self, fabric: &Fabric, payload: &[u8]) -> Result<Vec<u8>, Error> {
        if self.state != EstablishmentState::SentRequest {
            Err(ErrorCode::InvalidState)?;
        }
        self.state = EstablishmentState::Failed;

        let root = get_root_node_struct(payload)?;
        let responder_random = root.find_tag(1)?.slice()?;
        let peer_sess_id = root.find_tag(2)?.u16()?;
        let peer_pub_key = root.find_tag(3)?.slice()?;
        let encrypted = root.find_tag(4)?.slice()?;

        if peer_pub_key.len() != crypto::EC_POINT_LEN_BYTES {
            error!("Invalid public key length");
            Err(ErrorCode::Invalid)?;
        }
        self.peer_pub_key.copy_from_slice(peer_pub_key);

        self.key_pair
            .derive_secret(peer_pub_key, &mut self.shared_secret)?;

        let ipk = fabric.ipk().op_key();

        let mut sigma1_hash = [0; crypto::SHA256_HASH_LEN_BYTES];
        self.tt_hash.peek(&mut sigma1_hash);

        let mut s2k = derive_key(
            ipk,
            &[responder_random, peer_pub_key, &sigma1_hash],
            &self.shared_secret,
            S2K_INFO,
        )?;
        let tbe2 = decrypt_tbe(&s2k, SIGMA2_NONCE, encrypted);
        s2k.zeroize();

        validate_peer(
            fabric,
            &tbe2?,
            peer_pub_key,
            &self.our_pub_key,
            Some(self.peer_node_id),
        )?;

        self.peer_sess_id = peer_sess_id;
        self.tt_hash.update(payload);
        self.state = EstablishmentState::ReceivedResponse;

        let tbe3 = get_tbe(fabric, &self.our_pub_key, &self.peer_pub_key)?;

        let mut sigma12_hash = [0; crypto::SHA256_HASH_LEN_BYTES];
        self.tt_hash.peek(&mut sigma12_hash);

        let mut s3k = derive_key(ipk, &[&sigma12_hash], &self.shared_secret, S3K_INFO)?;
        let encrypted = encrypt_tbe(&s3k, SIGMA3_NONCE, &tbe3);
        s3k.zeroize();
        let encrypted = encrypted?;

        let mut buf = [0; MAX_SIGMA_MSG_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.str16(TagType::Context(1), &encrypted)?;
        tw.end_container()?;

        let sigma3 = wb.as_slice().to_vec();
        self.tt_hash.update(&sigma3);

        self.keys = Some(get_session_keys(ipk, &self.tt_hash, &self.shared_secret)?);
        self.state = EstablishmentState::KeysDerived;

        trace!("Sigma2 from node {:x} verified", self.peer_node_id);

        Ok(sigma3)
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

    pub fn fab_idx(&self) -> FabricIndex {
        self.fab_idx
    }

    pub fn peer_node_id(&self) -> NodeId {
        self.peer_node_id
    }

    pub fn local_sess_id(&self) -> u16 {
        self.local_sess_id
    }

    pub fn peer_sess_id(&self) -> u16 {
        self.peer_sess_id
    }
}

impl Drop for CaseInitiator {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

/// A CASE handshake answered by this node.
pub struct CaseResponder {
    state: EstablishmentState,
    fab_idx: FabricIndex,
    local_sess_id: u16,
    peer_sess_id: u16,
    our_pub_key: [u8; crypto::EC_POINT_LEN_BYTES],
    peer_pub_key: [u8; crypto::EC_POINT_LEN_BYTES],
    shared_secret: [u8; crypto::ECDH_SHARED_SECRET_LEN_BYTES],
    tt_hash: Sha256,
}

impl CaseResponder {
    /// Answers Sigma1 with Sigma2. Fails with `NoSharedTrustRoots` when the
    /// destination id names none of our fabrics.
    pub fn handle_sigma1(
        fabric_mgr: &FabricMgr,
        payload: &[u8],
        local_sess_id: u16,
        rand: Rand,
    ) -> Result<(Self, Vec<u8>), Error> {
        let root = get_root_node_struct(payload)?;
        let initiator_random = root.find_tag(1)?.slice()?;
        let peer_sess_id = root.find_tag(2)?.u16()?;
        let dest_id = root.find_tag(3)?.slice()?;
        let peer_pub_key = root.find_tag(4)?.slice()?;

        let fab_idx = fabric_mgr
            .match_dest_id(initiator_random, dest_id)
            .map_err(|_| {
                error!("Fabric Index mismatch");
                ErrorCode::NoSharedTrustRoots
            })?;
        let fabric = fabric_mgr
            .get_fabric(fab_idx)
            .ok_or(ErrorCode::NoSharedTrustRoots)?;
        trace!("Destination ID matched to fabric index {}", fab_idx);

        if peer_pub_key.len() != crypto::EC_POINT_LEN_BYTES {
            error!("Invalid public key length");
            Err(ErrorCode::Invalid)?;
        }

        let mut responder = Self {
            state: EstablishmentState::Init,
            fab_idx,
            local_sess_id,
            peer_sess_id,
            our_pub_key: [0; crypto::EC_POINT_LEN_BYTES],
            peer_pub_key: [0; crypto::EC_POINT_LEN_BYTES],
            shared_secret: [0; crypto::ECDH_SHARED_SECRET_LEN_BYTES],
            tt_hash: Sha256::new(),
        };
        responder.peer_pub_key.copy_from_slice(peer_pub_key);
        responder.tt_hash.update(payload);

        let key_pair = KeyPair::new(rand)?;
        key_pair.get_public_key(&mut responder.our_pub_key)?;
        key_pair.derive_secret(peer_pub_key, &mut responder.shared_secret)?;

        let mut our_random = [0; SIGMA_RANDOM_LEN];
        rand(&mut our_random);

        let mut sigma1_hash = [0; crypto::SHA256_HASH_LEN_BYTES];
        responder.tt_hash.peek(&mut sigma1_hash);

        let tbe2 = get_tbe(fabric, &responder.our_pub_key, &responder.peer_pub_key)?;

        let mut s2k = derive_key(
            fabric.ipk().op_key(),
            &[&our_random, &responder.our_pub_key, &sigma1_hash],
            &responder.shared_secret,
            S2K_INFO,
        )?;
        let encrypted = encrypt_tbe(&s2k, SIGMA2_NONCE, &tbe2);
        s2k.zeroize();
        let encrypted = encrypted?;

        let mut buf = [0; MAX_SIGMA_MSG_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.str8(TagType::Context(1), &our_random)?;
        tw.u16(TagType::Context(2), local_sess_id)?;
        tw.str8(TagType::Context(3), &responder.our_pub_key)?;
        tw.str16(TagType::Context(4), &encrypted)?;
        tw.end_container()?;

        let sigma2 = wb.as_slice().to_vec();
        responder.tt_hash.update(&sigma2);
        responder.state = EstablishmentState::ReceivedResponse;

        Ok((responder, sigma2))
    }

    /// Authenticates the initiator from Sigma3. Returns the session keys and
    /// the initiator's node id.
    pub fn handle_sigma3(
        &mut self,
        fabric_mgr: &FabricMgr,
        payload: &[u8],
    ) -> Result<(SessionKeys, NodeId), Error> {
        if self.state != EstablishmentState::ReceivedResponse {
            Err(ErrorCode::InvalidState)?;
        }
        self.state = EstablishmentState::Failed;

        let fabric = fabric_mgr
            .get_fabric(self.fab_idx)
            .ok_or(ErrorCode::NoSharedTrustRoots)?;
        let ipk = fabric.ipk().op_key();

        let encrypted = get_root_node_struct(payload)?.find_tag(1)?.slice()?;

        let mut sigma12_hash = [0; crypto::SHA256_HASH_LEN_BYTES];
        self.tt_hash.peek(&mut sigma12_hash);

        let mut s3k = derive_key(ipk, &[&sigma12_hash], &self.shared_secret, S3K_INFO)?;
        let tbe3 = decrypt_tbe(&s3k, SIGMA3_NONCE, encrypted);
        s3k.zeroize();

        let peer_node_id = validate_peer(fabric, &tbe3?, &self.peer_pub_key, &self.our_pub_key, None)
            .map_err(|e| {
                error!("Sigma3 validation failed: {}", e);
                e
            })?;

        self.tt_hash.update(payload);
        let keys = get_session_keys(ipk, &self.tt_hash, &self.shared_secret)?;
        self.state = EstablishmentState::Established;

        Ok((keys, peer_node_id))
    }

    pub fn state(&self) -> EstablishmentState {
        self.state
    }

    pub fn fab_idx(&self) -> FabricIndex {
        self.fab_idx
    }

    pub fn local_sess_id(&self) -> u16 {
        self.local_sess_id
    }

    pub fn peer_sess_id(&self) -> u16 {
        self.peer_sess_id
    }
}

impl Drop for CaseResponder {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

/// The status a responder reports for a failed CASE step.
pub fn failure_status(err: &Error) -> SCStatusCodes {
    match err.code() {
        ErrorCode::NoSharedTrustRoots => SCStatusCodes::NoSharedTrustRoots,
        _ => SCStatusCodes::InvalidParameter,
    }
}
