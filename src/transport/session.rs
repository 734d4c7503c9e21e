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

use log::{debug, info, trace, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto;
use crate::error::*;
use crate::fabric::FabricMgr;
use crate::group_id::{FabricIndex, GroupId, NodeId};
use crate::persist::PersistentStorage;
use crate::utils::epoch::Epoch;
use crate::utils::rand::Rand;

use super::counter::{GlobalEncryptedCounter, MessageCounter};
use super::dedup::{CtrCheck, GroupCtrStore, RxCtrState};
use super::network::Address;
use super::packet::{self, Packet};
use super::plain_hdr::{PlainHdr, SessionType};
use super::proto_hdr::ProtoHdr;

pub const MAX_SESSIONS: usize = 16;

/// Default number of consecutive decryption failures after which a secure
/// session is considered compromised and closed.
pub const MAX_DECRYPT_FAILURES: u8 = 8;

pub const SESSION_KEYS_LEN: usize = 3 * crypto::SYMM_KEY_LEN_BYTES;

/// Key material derived at the end of a PASE or CASE handshake.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
#[cfg_attr(test, derive(PartialEq))]
pub struct SessionKeys {
    pub i2r: [u8; crypto::SYMM_KEY_LEN_BYTES],
    pub r2i: [u8; crypto::SYMM_KEY_LEN_BYTES],
    pub att_challenge: [u8; crypto::SYMM_KEY_LEN_BYTES],
}

impl SessionKeys {
    pub fn derive(salt: &[u8], ikm: &[u8]) -> Result<Self, Error> {
        const SEKEYS_INFO: &[u8] = b"SessionKeys";

        let mut okm = [0u8; SESSION_KEYS_LEN];
        crypto::hkdf_sha256(salt, ikm, SEKEYS_INFO, &mut okm)?;

        let mut keys = Self::default();
        keys.i2r.copy_from_slice(&okm[0..16]);
        keys.r2i.copy_from_slice(&okm[16..32]);
        keys.att_challenge.copy_from_slice(&okm[32..48]);
        okm.zeroize();

        Ok(keys)
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaseDetails {
    pub fab_idx: FabricIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupDetails {
    pub fab_idx: FabricIndex,
    pub group_id: GroupId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Unauthenticated; used to carry PASE and CASE handshakes.
    PlainText,
    Pase,
    Case(CaseDetails),
    /// Outgoing group session.
    Group(GroupDetails),
}

impl SessionMode {
    pub fn is_secure(&self) -> bool {
        !matches!(self, Self::PlainText)
    }

    pub fn fab_idx(&self) -> Option<FabricIndex> {
        match self {
            Self::Case(d) => Some(d.fab_idx),
            Self::Group(d) => Some(d.fab_idx),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// A weak reference to a session table slot. Resolving a handle whose
/// session was removed (or whose slot was reused) yields nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u16,
    generation: u32,
}

impl SessionHandle {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}.{}", self.index, self.generation)
    }
}

/// Everything needed to install a PASE or CASE session.
#[derive(Debug)]
pub struct SessionParams {
    pub mode: SessionMode,
    pub role: SessionRole,
    pub local_sess_id: u16,
    pub peer_sess_id: u16,
    pub peer_addr: Address,
    pub local_nodeid: NodeId,
    pub peer_nodeid: NodeId,
    pub keys: SessionKeys,
}

pub struct Session {
    generation: u32,
    mode: SessionMode,
    role: SessionRole,
    peer_addr: Address,
    local_nodeid: NodeId,
    peer_nodeid: Option<NodeId>,
    local_sess_id: u16,
    peer_sess_id: u16,
    enc_key: [u8; crypto::SYMM_KEY_LEN_BYTES],
    dec_key: [u8; crypto::SYMM_KEY_LEN_BYTES],
    att_challenge: [u8; crypto::SYMM_KEY_LEN_BYTES],
    msg_ctr: MessageCounter,
    rx_ctr_state: Option<RxCtrState>,
    last_use: Duration,
    decrypt_failures: u8,
}

impl Session {
    fn new_plain(
        generation: u32,
        peer_addr: Address,
        local_nodeid: Option<NodeId>,
        peer_nodeid: Option<NodeId>,
        rand: Rand,
        now: Duration,
    ) -> Self {
        Self {
            generation,
            mode: SessionMode::PlainText,
            role: if local_nodeid.is_some() {
                SessionRole::Initiator
            } else {
                SessionRole::Responder
            },
            peer_addr,
            local_nodeid: local_nodeid.unwrap_or(0),
            peer_nodeid,
            local_sess_id: 0,
            peer_sess_id: 0,
            enc_key: [0; crypto::SYMM_KEY_LEN_BYTES],
            dec_key: [0; crypto::SYMM_KEY_LEN_BYTES],
            att_challenge: [0; crypto::SYMM_KEY_LEN_BYTES],
            msg_ctr: MessageCounter::new(rand),
            rx_ctr_state: None,
            last_use: now,
            decrypt_failures: 0,
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn is_encrypted(&self) -> bool {
        self.mode.is_secure()
    }

    pub fn peer_addr(&self) -> Address {
        self.peer_addr
    }

    pub fn local_nodeid(&self) -> NodeId {
        self.local_nodeid
    }

    pub fn peer_nodeid(&self) -> Option<NodeId> {
        self.peer_nodeid
    }

    pub fn local_sess_id(&self) -> u16 {
        self.local_sess_id
    }

    pub fn peer_sess_id(&self) -> u16 {
        self.peer_sess_id
    }

    pub fn att_challenge(&self) -> &[u8] {
        &self.att_challenge
    }

    pub fn last_use(&self) -> Duration {
        self.last_use
    }

    pub fn decrypt_failures(&self) -> u8 {
        self.decrypt_failures
    }

    /// Whether the peer's message counter is known.
    pub fn is_synced(&self) -> bool {
        self.rx_ctr_state.is_some()
    }

    /// Adopts the peer counter learned by counter synchronization. A session
    /// already tracking the peer keeps its window and `false` is returned.
    pub fn set_rx_synced(&mut self, peer_ctr: u32) -> bool {
        if self.rx_ctr_state.is_some() {
            return false;
        }

        self.rx_ctr_state = Some(RxCtrState::new_synced(peer_ctr));

        true
    }

    /// Checks a received counter. Returns `None` when the peer counter is
    /// unknown and `trust_first` is off; the message then needs counter
    /// synchronization before it can be accepted.
    pub fn post_recv(&mut self, ctr: u32, trust_first: bool) -> Option<CtrCheck> {
        let encrypted = self.is_encrypted();

        match self.rx_ctr_state.as_mut() {
            Some(state) => Some(state.post_recv(ctr, encrypted)),
            None if trust_first || !encrypted => {
                self.rx_ctr_state = Some(RxCtrState::new(ctr));
                Some(CtrCheck::New)
            }
            None => None,
        }
    }

    fn nonce_nodeids(&self) -> (u64, u64) {
        match self.mode {
            // PASE sessions have no operational node ids
            SessionMode::Pase => (0, 0),
            _ => (self.local_nodeid, self.peer_nodeid.unwrap_or(0)),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.enc_key.zeroize();
        self.dec_key.zeroize();
        self.att_challenge.zeroize();
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} peer {} LSID:{:x} PSID:{:x}",
            self.mode, self.peer_addr, self.local_sess_id, self.peer_sess_id
        )?;

        if let Some(peer_nodeid) = self.peer_nodeid {
            write!(f, " node {:x}", peer_nodeid)?;
        }

        Ok(())
    }
}

/// A group message that passed decryption and replay checks.
#[derive(Debug, Clone)]
pub struct GroupPacket {
    pub fab_idx: FabricIndex,
    pub group_id: GroupId,
    pub src_nodeid: NodeId,
    pub packet: Packet,
}

/// The session table.
pub struct SessionMgr<'a> {
    sessions: [Option<Session>; MAX_SESSIONS],
    generation: u32,
    next_sess_id: u16,
    unencrypted_ctr: MessageCounter,
    encrypted_ctr: GlobalEncryptedCounter<'a>,
    group_ctrs: GroupCtrStore,
    epoch: Epoch,
    rand: Rand,
}

impl<'a> SessionMgr<'a> {
    pub fn new(epoch: Epoch, rand: Rand, psm: &'a dyn PersistentStorage) -> Result<Self, Error> {
        let mut sess_id = [0; 2];
        rand(&mut sess_id);

        Ok(Self {
            sessions: core::array::from_fn(|_| None),
            generation: 0,
            next_sess_id: u16::from_le_bytes(sess_id).max(1),
            unencrypted_ctr: MessageCounter::new(rand),
            encrypted_ctr: GlobalEncryptedCounter::load(psm, rand)?,
            group_ctrs: GroupCtrStore::new(),
            epoch,
            rand,
        })
    }

    /// Allocates a local session id: never 0, never one currently in use.
    pub fn get_next_sess_id(&mut self) -> u16 {
        loop {
            let id = self.next_sess_id;
            self.next_sess_id = self.next_sess_id.wrapping_add(1);
            if self.next_sess_id == 0 {
                self.next_sess_id = 1;
            }

            if id != 0 && self.find_secure(id).is_none() {
                return id;
            }
        }
    }

    pub fn is_full(&self) -> bool {
        self.sessions.iter().all(Option::is_some)
    }

    pub fn len(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The least recently used session among those `evictable` accepts, the
    /// eviction candidate when the table is full.
    pub fn lru<F>(&self, evictable: F) -> Option<SessionHandle>
    where
        F: Fn(SessionHandle, &Session) -> bool,
    {
        self.iter()
            .filter(|(handle, s)| evictable(*handle, s))
            .min_by_key(|(_, s)| s.last_use)
            .map(|(handle, _)| handle)
    }

    fn insert(&mut self, build: impl FnOnce(u32) -> Session) -> Result<SessionHandle, Error> {
        let index = self
            .sessions
            .iter()
            .position(Option::is_none)
            .ok_or(ErrorCode::NoSpaceSessions)?;

        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        self.sessions[index] = Some(build(generation));

        Ok(SessionHandle {
            index: index as u16,
            generation,
        })
    }

    /// Adds an unauthenticated session. The initiator of a handshake passes
    /// its ephemeral node id as `local_nodeid`; the responder records the
    /// initiator's as `peer_nodeid`.
    pub fn add(
        &mut self,
        peer_addr: Address,
        local_nodeid: Option<NodeId>,
        peer_nodeid: Option<NodeId>,
    ) -> Result<SessionHandle, Error> {
        let now = (self.epoch)();
        let rand = self.rand;

        let handle = self.insert(|generation| {
            Session::new_plain(generation, peer_addr, local_nodeid, peer_nodeid, rand, now)
        })?;
        debug!("Added unauthenticated session {} for {}", handle, peer_addr);

        Ok(handle)
    }

    /// Adds a PASE or CASE session. The peer counter starts out unknown; it
    /// is either trusted from the first message or synchronized, depending
    /// on the counter sync policy applied on receive.
    pub fn add_secure(&mut self, params: SessionParams) -> Result<SessionHandle, Error> {
        if !matches!(params.mode, SessionMode::Pase | SessionMode::Case(_)) {
            Err(ErrorCode::InvalidArgument)?;
        }

        let now = (self.epoch)();
        let rand = self.rand;

        let (enc_key, dec_key) = match params.role {
            SessionRole::Initiator => (params.keys.i2r, params.keys.r2i),
            SessionRole::Responder => (params.keys.r2i, params.keys.i2r),
        };

        let handle = self.insert(|generation| {
            let mut session = Session::new_plain(
                generation,
                params.peer_addr,
                None,
                Some(params.peer_nodeid),
                rand,
                now,
            );
            session.mode = params.mode;
            session.role = params.role;
            session.local_nodeid = params.local_nodeid;
            session.local_sess_id = params.local_sess_id;
            session.peer_sess_id = params.peer_sess_id;
            session.enc_key = enc_key;
            session.dec_key = dec_key;
            session.att_challenge = params.keys.att_challenge;
            session
        })?;

        if let Some(session) = self.get(handle) {
            info!("Added secure session {}: {}", handle, session);
        }

        Ok(handle)
    }

    /// Adds an outgoing group session for `group_id` on the given fabric.
    pub fn add_group(
        &mut self,
        fabric_mgr: &FabricMgr,
        fab_idx: FabricIndex,
        group_id: GroupId,
        peer_addr: Address,
    ) -> Result<SessionHandle, Error> {
        let fabric = fabric_mgr
            .get_fabric(fab_idx)
            .ok_or(ErrorCode::NoFabricId)?;
        let keys = fabric.group_keys(group_id).ok_or(ErrorCode::NotFound)?;

        let now = (self.epoch)();
        let rand = self.rand;
        let local_nodeid = fabric.get_node_id();
        let sess_id = keys.session_id();
        let mut enc_key = [0; crypto::SYMM_KEY_LEN_BYTES];
        enc_key.copy_from_slice(keys.op_key());

        let handle = self.insert(|generation| {
            let mut session =
                Session::new_plain(generation, peer_addr, None, None, rand, now);
            session.mode = SessionMode::Group(GroupDetails { fab_idx, group_id });
            session.role = SessionRole::Initiator;
            session.local_nodeid = local_nodeid;
            session.peer_sess_id = sess_id;
            session.enc_key = enc_key;
            session
        })?;
        enc_key.zeroize();

        info!("Added group session {} for group {}", handle, group_id);

        Ok(handle)
    }

    pub fn remove(&mut self, handle: SessionHandle) -> Option<Session> {
        let slot = self.sessions.get_mut(handle.index())?;
        if slot.as_ref().map(|s| s.generation) == Some(handle.generation) {
            slot.take()
        } else {
            None
        }
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&Session> {
        self.sessions
            .get(handle.index())?
            .as_ref()
            .filter(|s| s.generation == handle.generation)
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.sessions
            .get_mut(handle.index())?
            .as_mut()
            .filter(|s| s.generation == handle.generation)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessionHandle, &Session)> {
        self.sessions.iter().enumerate().filter_map(|(index, s)| {
            s.as_ref().map(|s| {
                (
                    SessionHandle {
                        index: index as u16,
                        generation: s.generation,
                    },
                    s,
                )
            })
        })
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Finds an unauthenticated session by peer address and the peer's
    /// ephemeral node id. When the message names a destination node id it
    /// must be our own ephemeral id.
    pub fn find_unauthenticated(
        &self,
        peer_addr: &Address,
        peer_nodeid: Option<NodeId>,
        local_nodeid: Option<NodeId>,
    ) -> Option<SessionHandle> {
        self.iter()
            .find(|(_, s)| {
                s.mode == SessionMode::PlainText
                    && s.peer_addr == *peer_addr
                    && s.peer_nodeid == peer_nodeid
                    && local_nodeid.map_or(true, |id| id == s.local_nodeid)
            })
            .map(|(handle, _)| handle)
    }

    pub fn find_secure(&self, local_sess_id: u16) -> Option<SessionHandle> {
        self.iter()
            .find(|(_, s)| {
                matches!(s.mode, SessionMode::Pase | SessionMode::Case(_))
                    && s.local_sess_id == local_sess_id
            })
            .map(|(handle, _)| handle)
    }

    pub fn find_group(&self, fab_idx: FabricIndex, group_id: GroupId) -> Option<SessionHandle> {
        self.iter()
            .find(|(_, s)| s.mode == SessionMode::Group(GroupDetails { fab_idx, group_id }))
            .map(|(handle, _)| handle)
    }

    /// The counter the next message on this session will carry.
    pub fn peek_ctr(&self, handle: SessionHandle) -> Option<u32> {
        let session = self.get(handle)?;

        Some(match session.mode {
            SessionMode::PlainText => self.unencrypted_ctr.peek(),
            SessionMode::Group(_) => self.encrypted_ctr.peek(),
            _ => session.msg_ctr.peek(),
        })
    }

    /// Stamps a counter, encodes and (for secure sessions) encrypts a
    /// message. Returns the datagram and the counter it carries.
    pub fn encode(
        &mut self,
        handle: SessionHandle,
        proto: &ProtoHdr,
        payload: &[u8],
    ) -> Result<(Vec<u8>, u32), Error> {
        let now = (self.epoch)();

        let session = self
            .sessions
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .filter(|s| s.generation == handle.generation)
            .ok_or(ErrorCode::NoSession)?;

        let ctr = match session.mode {
            SessionMode::PlainText => self.unencrypted_ctr.next(),
            SessionMode::Group(_) => self.encrypted_ctr.next()?,
            _ => session.msg_ctr.next(),
        };

        let mut plain = PlainHdr::new();
        plain.ctr = ctr;

        let key = match session.mode {
            SessionMode::PlainText => {
                if session.local_nodeid != 0 {
                    plain.set_src_nodeid(Some(session.local_nodeid));
                }
                plain.set_dst_unicast_nodeid(session.peer_nodeid);
                None
            }
            SessionMode::Group(details) => {
                plain.sess_id = session.peer_sess_id;
                plain.set_session_type(SessionType::Group);
                plain.set_src_nodeid(Some(session.local_nodeid));
                plain.set_dst_group(Some(details.group_id));
                Some((&session.enc_key[..], session.local_nodeid))
            }
            _ => {
                plain.sess_id = session.peer_sess_id;
                Some((&session.enc_key[..], session.nonce_nodeids().0))
            }
        };

        let data = packet::encode_datagram(&plain, proto, payload, key)?;
        session.last_use = now;

        trace!("Encoded on {}: [{}] [{}]", handle, plain, proto);

        Ok((data, ctr))
    }

    /// Looks up the unicast session an inbound message belongs to.
    pub fn lookup(&self, plain: &PlainHdr, peer_addr: &Address) -> Option<SessionHandle> {
        if plain.is_encrypted() {
            self.find_secure(plain.sess_id)
        } else {
            self.find_unauthenticated(
                peer_addr,
                plain.get_src_nodeid(),
                plain.get_dst_unicast_nodeid(),
            )
        }
    }

    /// Decrypts and decodes a unicast message received on `handle`.
    ///
    /// A MIC failure is counted against the session and reported as
    /// `ErrorCode::Crypto`; a success resets the count. The counter is not
    /// checked here.
    pub fn decode(
        &mut self,
        handle: SessionHandle,
        peer_addr: Address,
        data: &mut [u8],
    ) -> Result<Packet, Error> {
        let now = (self.epoch)();
        let session = self.get_mut(handle).ok_or(ErrorCode::NoSession)?;

        let key = session
            .is_encrypted()
            .then(|| (session.dec_key, session.nonce_nodeids().1));

        let result = packet::decode_datagram(data, key.as_ref().map(|(k, n)| (&k[..], *n)));

        let (plain, proto, payload) = match result {
            Ok(decoded) => decoded,
            Err(e) => {
                if e.code() == ErrorCode::Crypto {
                    session.decrypt_failures = session.decrypt_failures.saturating_add(1);
                    warn!(
                        "Decryption failed on {} ({} in a row)",
                        handle, session.decrypt_failures
                    );
                }
                return Err(e);
            }
        };

        session.decrypt_failures = 0;
        session.last_use = now;
        if session.is_encrypted() && session.peer_addr != peer_addr {
            debug!(
                "Peer of {} moved from {} to {}",
                handle, session.peer_addr, peer_addr
            );
            session.peer_addr = peer_addr;
        }

        Ok(Packet {
            peer: peer_addr,
            plain,
            proto,
            payload,
            duplicate: false,
        })
    }

    /// Decrypts a group message with the first matching group key of any
    /// fabric and runs it through the group replay store. Duplicates and
    /// stale counters yield `ErrorCode::Duplicate`.
    pub fn decode_group(
        &mut self,
        fabric_mgr: &FabricMgr,
        peer_addr: Address,
        data: &[u8],
    ) -> Result<GroupPacket, Error> {
        let plain = packet::peek_plain_hdr(data)?;
        let group_id = plain.get_dst_group().ok_or(ErrorCode::Invalid)?;
        let src_nodeid = plain.get_src_nodeid().ok_or(ErrorCode::NoNodeId)?;

        for (fab_idx, fabric) in fabric_mgr.iter() {
            let Some(keys) = fabric.group_keys(group_id) else {
                continue;
            };

            if keys.session_id() != plain.sess_id {
                continue;
            }

            let mut buf = data.to_vec();
            let Ok((plain, proto, payload)) =
                packet::decode_datagram(&mut buf, Some((keys.op_key(), src_nodeid)))
            else {
                continue;
            };

            let check = self.group_ctrs.post_recv(fab_idx, src_nodeid, plain.ctr);
            if !check.is_new() {
                debug!(
                    "Group message from {:x} with counter {} dropped: {:?}",
                    src_nodeid, plain.ctr, check
                );
                Err(ErrorCode::Duplicate)?;
            }

            return Ok(GroupPacket {
                fab_idx,
                group_id,
                src_nodeid,
                packet: Packet {
                    peer: peer_addr,
                    plain,
                    proto,
                    payload,
                    duplicate: false,
                },
            });
        }

        Err(ErrorCode::NoSession.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemPsm;
    use crate::utils::epoch::dummy_epoch;
    use crate::utils::rand::sys_rand;

    fn addr() -> Address {
        Address::Udp("[::1]:5540".parse().unwrap())
    }

    fn keys() -> SessionKeys {
        SessionKeys::derive(&[], b"shared secret").unwrap()
    }

    fn params(role: SessionRole, local: u16, peer: u16) -> SessionParams {
        SessionParams {
            mode: SessionMode::Pase,
            role,
            local_sess_id: local,
            peer_sess_id: peer,
            peer_addr: addr(),
            local_nodeid: 0,
            peer_nodeid: 0,
            keys: keys(),
        }
    }

    #[test]
    fn test_keys_are_distinct() {
        let keys = keys();
        assert_ne!(keys.i2r, keys.r2i);
        assert_ne!(keys.r2i, keys.att_challenge);
    }

    #[test]
    fn test_sess_id_skips_zero_and_in_use() {
        let psm = MemPsm::new();
        let mut mgr = SessionMgr::new(dummy_epoch, sys_rand, &psm).unwrap();
        mgr.next_sess_id = u16::MAX;

        assert_eq!(mgr.get_next_sess_id(), u16::MAX);
        mgr.add_secure(params(SessionRole::Initiator, 1, 10))
            .unwrap();
        assert_eq!(mgr.get_next_sess_id(), 2);
    }

    #[test]
    fn test_handle_generation() {
        let psm = MemPsm::new();
        let mut mgr = SessionMgr::new(dummy_epoch, sys_rand, &psm).unwrap();

        let h1 = mgr.add(addr(), None, Some(1)).unwrap();
        assert!(mgr.remove(h1).is_some());
        let h2 = mgr.add(addr(), None, Some(2)).unwrap();

        assert_eq!(h1.index(), h2.index());
        assert!(mgr.get(h1).is_none());
        assert!(mgr.get(h2).is_some());
        assert!(mgr.remove(h1).is_none());
    }

    #[test]
    fn test_table_full() {
        let psm = MemPsm::new();
        let mut mgr = SessionMgr::new(dummy_epoch, sys_rand, &psm).unwrap();

        for i in 0..MAX_SESSIONS {
            mgr.add(addr(), None, Some(i as u64)).unwrap();
        }

        assert!(mgr.is_full());
        assert_eq!(
            mgr.add(addr(), None, Some(100)).map_err(|e| e.code()),
            Err(ErrorCode::NoSpaceSessions)
        );
        assert_eq!(mgr.lru(|_, _| true), mgr.handles().first().copied());
        assert!(mgr.lru(|_, s| s.is_encrypted()).is_none());
    }

    #[test]
    fn test_lru_skips_what_is_not_evictable() {
        let psm = MemPsm::new();
        let mut mgr = SessionMgr::new(dummy_epoch, sys_rand, &psm).unwrap();

        let secure = mgr
            .add_secure(params(SessionRole::Responder, 3, 4))
            .unwrap();
        let plain = mgr.add(addr(), None, Some(7)).unwrap();

        assert_eq!(mgr.lru(|_, _| true), Some(secure));
        assert_eq!(mgr.lru(|_, s| !s.is_encrypted()), Some(plain));
        assert_eq!(mgr.lru(|handle, _| handle != plain), Some(secure));
    }

    #[test]
    fn test_encrypt_decrypt_mirrored() {
        let psm = MemPsm::new();
        let mut tx = SessionMgr::new(dummy_epoch, sys_rand, &psm).unwrap();
        let mut rx = SessionMgr::new(dummy_epoch, sys_rand, &psm).unwrap();

        let htx = tx
            .add_secure(params(SessionRole::Initiator, 1, 2))
            .unwrap();
        let hrx = rx
            .add_secure(params(SessionRole::Responder, 2, 1))
            .unwrap();

        let mut proto = ProtoHdr::new();
        proto.proto_id = 1;
        proto.proto_opcode = 5;
        proto.set_initiator(true);

        let (mut data, ctr) = tx.encode(htx, &proto, b"payload").unwrap();

        let plain = packet::peek_plain_hdr(&data).unwrap();
        assert_eq!(plain.ctr, ctr);
        assert_eq!(rx.lookup(&plain, &addr()), Some(hrx));

        let packet = rx.decode(hrx, addr(), &mut data).unwrap();
        assert_eq!(packet.payload, b"payload");
        assert_eq!(packet.proto, proto);

        let session = rx.get_mut(hrx).unwrap();
        assert_eq!(session.post_recv(ctr, true), Some(CtrCheck::New));
        assert_eq!(session.post_recv(ctr, true), Some(CtrCheck::Duplicate));
    }

    #[test]
    fn test_decrypt_failures_counted() {
        let psm = MemPsm::new();
        let mut tx = SessionMgr::new(dummy_epoch, sys_rand, &psm).unwrap();
        let mut rx = SessionMgr::new(dummy_epoch, sys_rand, &psm).unwrap();

        let htx = tx
            .add_secure(params(SessionRole::Initiator, 1, 2))
            .unwrap();
        let hrx = rx
            .add_secure(params(SessionRole::Responder, 2, 1))
            .unwrap();

        let (data, _) = tx.encode(htx, &ProtoHdr::new(), b"x").unwrap();

        for i in 1..=3 {
            let mut corrupted = data.clone();
            let last = corrupted.len() - 1;
            corrupted[last] ^= 0xff;
            assert!(rx.decode(hrx, addr(), &mut corrupted).is_err());
            assert_eq!(rx.get(hrx).unwrap().decrypt_failures(), i);
        }

        rx.decode(hrx, addr(), &mut data.clone()).unwrap();
        assert_eq!(rx.get(hrx).unwrap().decrypt_failures(), 0);
    }

    #[test]
    fn test_unsynced_counter() {
        let psm = MemPsm::new();
        let mut mgr = SessionMgr::new(dummy_epoch, sys_rand, &psm).unwrap();
        let h = mgr
            .add_secure(params(SessionRole::Responder, 3, 4))
            .unwrap();

        let session = mgr.get_mut(h).unwrap();
        assert!(!session.is_synced());
        assert_eq!(session.post_recv(10, false), None);

        assert!(session.set_rx_synced(10));
        assert_eq!(session.post_recv(9, false), Some(CtrCheck::New));
        assert_eq!(session.post_recv(10, false), Some(CtrCheck::Duplicate));

        // A later synchronization does not reopen the window
        assert!(!session.set_rx_synced(20));
        assert_eq!(session.post_recv(9, false), Some(CtrCheck::Duplicate));
        assert_eq!(session.post_recv(20, false), Some(CtrCheck::New));
    }
}
