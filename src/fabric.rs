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

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use heapless::Vec;
use log::{error, info};

use crate::{
    crypto::{self, hkdf_sha256, HmacSha256, KeyPair},
    error::*,
    group_id::{FabricIndex, GroupId, NodeId},
    group_keys::KeySet,
    tlv::{get_root_node_struct, TLVWriter, TagType},
    utils::{rand::Rand, writebuf::WriteBuf},
};

pub const MAX_FABRICS: usize = 5;
pub const MAX_GROUPS_PER_FABRIC: usize = 4;

pub const COMPRESSED_FABRIC_ID_LEN: usize = 8;

const COMPRESSED_FABRIC_INFO: &[u8] = b"CompressedFabric";

/// Encoded credential size: struct + node id + fabric id + pubkey + signature.
pub const MAX_CREDENTIAL_LEN: usize =
    2 + 10 + 10 + 3 + crypto::EC_POINT_LEN_BYTES + 3 + crypto::EC_SIGNATURE_LEN_BYTES;

/// The operational credential of a node: its identity on a fabric bound to
/// its public key by the fabric root's signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpCredential {
    pub node_id: NodeId,
    pub fabric_id: u64,
    pub pubkey: [u8; crypto::EC_POINT_LEN_BYTES],
    pub signature: [u8; crypto::EC_SIGNATURE_LEN_BYTES],
}

impl OpCredential {
    fn encode_tbs(
        node_id: NodeId,
        fabric_id: u64,
        pubkey: &[u8],
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let mut wb = WriteBuf::new(buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.u64(TagType::Context(1), node_id)?;
        tw.u64(TagType::Context(2), fabric_id)?;
        tw.str8(TagType::Context(3), pubkey)?;
        tw.end_container()?;

        Ok(wb.as_slice().len())
    }

    /// Issues a credential for `pubkey`, signed by the fabric root key.
    pub fn issue(
        root: &KeyPair,
        node_id: NodeId,
        fabric_id: u64,
        pubkey: &[u8],
    ) -> Result<Self, Error> {
        let mut tbs = [0; MAX_CREDENTIAL_LEN];
        let len = Self::encode_tbs(node_id, fabric_id, pubkey, &mut tbs)?;

        let mut signature = [0; crypto::EC_SIGNATURE_LEN_BYTES];
        root.sign_msg(&tbs[..len], &mut signature)?;

        Ok(Self {
            node_id,
            fabric_id,
            pubkey: pubkey.try_into()?,
            signature,
        })
    }

    pub fn verify(&self, root_pubkey: &[u8]) -> Result<(), Error> {
        let mut tbs = [0; MAX_CREDENTIAL_LEN];
        let len = Self::encode_tbs(self.node_id, self.fabric_id, &self.pubkey, &mut tbs)?;

        KeyPair::new_from_public(root_pubkey)?.verify_msg(&tbs[..len], &self.signature)
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut wb = WriteBuf::new(buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.u64(TagType::Context(1), self.node_id)?;
        tw.u64(TagType::Context(2), self.fabric_id)?;
        tw.str8(TagType::Context(3), &self.pubkey)?;
        tw.str8(TagType::Context(4), &self.signature)?;
        tw.end_container()?;

        Ok(wb.as_slice().len())
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let root = get_root_node_struct(data)?;

        Ok(Self {
            node_id: root.find_tag(1)?.u64()?,
            fabric_id: root.find_tag(2)?.u64()?,
            pubkey: root.find_tag(3)?.slice()?.try_into()?,
            signature: root.find_tag(4)?.slice()?.try_into()?,
        })
    }
}

/// The signing authority of a fabric. Commissioners use it to mint
/// operational credentials for the nodes they add.
pub struct FabricAuthority {
    key_pair: KeyPair,
    fabric_id: u64,
    ipk_epoch_key: [u8; crypto::SYMM_KEY_LEN_BYTES],
}

impl FabricAuthority {
    pub fn new(rand: Rand, fabric_id: u64) -> Result<Self, Error> {
        let mut ipk_epoch_key = [0; crypto::SYMM_KEY_LEN_BYTES];
        rand(&mut ipk_epoch_key);

        Ok(Self {
            key_pair: KeyPair::new(rand)?,
            fabric_id,
            ipk_epoch_key,
        })
    }

    pub fn fabric_id(&self) -> u64 {
        self.fabric_id
    }

    pub fn root_pubkey(&self) -> Result<[u8; crypto::EC_POINT_LEN_BYTES], Error> {
        let mut pubkey = [0; crypto::EC_POINT_LEN_BYTES];
        self.key_pair.get_public_key(&mut pubkey)?;
        Ok(pubkey)
    }

    /// Generates an operational key pair for `node_id` and returns the fabric
    /// entry that node would install.
    pub fn new_node_fabric(&self, rand: Rand, node_id: NodeId) -> Result<Fabric, Error> {
        let key_pair = KeyPair::new(rand)?;
        let mut pubkey = [0; crypto::EC_POINT_LEN_BYTES];
        key_pair.get_public_key(&mut pubkey)?;

        let credential = OpCredential::issue(&self.key_pair, node_id, self.fabric_id, &pubkey)?;

        Fabric::new(key_pair, &self.root_pubkey()?, credential, &self.ipk_epoch_key)
    }
}

#[derive(Debug)]
pub struct GroupKeyEntry {
    pub group_id: GroupId,
    pub keys: KeySet,
}

#[derive(Debug)]
pub struct Fabric {
    node_id: NodeId,
    fabric_id: u64,
    root_pubkey: [u8; crypto::EC_POINT_LEN_BYTES],
    key_pair: KeyPair,
    credential: OpCredential,
    ipk: KeySet,
    compressed_id: [u8; COMPRESSED_FABRIC_ID_LEN],
    groups: Vec<GroupKeyEntry, MAX_GROUPS_PER_FABRIC>,
}

impl Fabric {
    pub fn new(
        key_pair: KeyPair,
        root_pubkey: &[u8],
        credential: OpCredential,
        ipk_epoch_key: &[u8],
    ) -> Result<Self, Error> {
        let mut pubkey = [0; crypto::EC_POINT_LEN_BYTES];
        key_pair.get_public_key(&mut pubkey)?;

        if pubkey != credential.pubkey {
            error!("Operational credential does not match the key pair");
            Err(ErrorCode::InvalidData)?;
        }

        credential.verify(root_pubkey).map_err(|e| {
            error!("Operational credential is not signed by the root: {}", e);
            e
        })?;

        let mut compressed_id = [0; COMPRESSED_FABRIC_ID_LEN];
        Self::get_compressed_id(root_pubkey, credential.fabric_id, &mut compressed_id)?;

        let ipk = KeySet::new(ipk_epoch_key, &compressed_id)?;

        info!(
            "Fabric {:x} node {:x}, compressed id {:02x?}",
            credential.fabric_id, credential.node_id, compressed_id
        );

        Ok(Self {
            node_id: credential.node_id,
            fabric_id: credential.fabric_id,
            root_pubkey: root_pubkey.try_into()?,
            key_pair,
            credential,
            ipk,
            compressed_id,
            groups: Vec::new(),
        })
    }

    fn get_compressed_id(root_pubkey: &[u8], fabric_id: u64, out: &mut [u8]) -> Result<(), Error> {
        // The leading SEC1 format byte is not part of the key material
        let root_pubkey = root_pubkey.get(1..).ok_or(ErrorCode::InvalidData)?;

        let mut fabric_id_be = [0; 8];
        BigEndian::write_u64(&mut fabric_id_be, fabric_id);

        hkdf_sha256(&fabric_id_be, root_pubkey, COMPRESSED_FABRIC_INFO, out)
    }

    /// Computes the CASE destination identifier a peer would use to address
    /// this node on this fabric.
    pub fn compute_dest_id(&self, random: &[u8], out: &mut [u8]) -> Result<(), Error> {
        compute_dest_id(
            self.ipk.op_key(),
            random,
            &self.root_pubkey,
            self.fabric_id,
            self.node_id,
            out,
        )
    }

    pub fn match_dest_id(&self, random: &[u8], target: &[u8]) -> Result<(), Error> {
        let mut id = [0; crypto::SHA256_HASH_LEN_BYTES];
        self.compute_dest_id(random, &mut id)?;

        if crypto::ct_equal(&id, target) {
            Ok(())
        } else {
            Err(ErrorCode::NotFound.into())
        }
    }

    pub fn sign_msg(&self, msg: &[u8], signature: &mut [u8]) -> Result<usize, Error> {
        self.key_pair.sign_msg(msg, signature)
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn credential(&self) -> &OpCredential {
        &self.credential
    }

    pub fn root_pubkey(&self) -> &[u8] {
        &self.root_pubkey
    }

    pub fn ipk(&self) -> &KeySet {
        &self.ipk
    }

    pub fn compressed_id(&self) -> &[u8] {
        &self.compressed_id
    }

    pub fn get_node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn get_fabric_id(&self) -> u64 {
        self.fabric_id
    }

    /// Installs (or replaces) the epoch key of a group on this fabric.
    pub fn set_group_key(&mut self, group_id: GroupId, epoch_key: &[u8]) -> Result<(), Error> {
        if !group_id.is_valid() {
            Err(ErrorCode::InvalidArgument)?;
        }

        let keys = KeySet::new(epoch_key, &self.compressed_id)?;

        if let Some(entry) = self.groups.iter_mut().find(|e| e.group_id == group_id) {
            entry.keys = keys;
        } else {
            self.groups
                .push(GroupKeyEntry { group_id, keys })
                .map_err(|_| ErrorCode::NoSpace)?;
        }

        Ok(())
    }

    pub fn remove_group_key(&mut self, group_id: GroupId) {
        self.groups.retain(|e| e.group_id != group_id);
    }

    pub fn group_keys(&self, group_id: GroupId) -> Option<&KeySet> {
        self.groups
            .iter()
            .find(|e| e.group_id == group_id)
            .map(|e| &e.keys)
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupKeyEntry> {
        self.groups.iter()
    }
}

pub fn compute_dest_id(
    ipk: &[u8],
    random: &[u8],
    root_pubkey: &[u8],
    fabric_id: u64,
    node_id: NodeId,
    out: &mut [u8],
) -> Result<(), Error> {
    let mut mac = HmacSha256::new(ipk)?;

    mac.update(random);
    mac.update(root_pubkey);

    let mut buf = [0; 8];
    LittleEndian::write_u64(&mut buf, fabric_id);
    mac.update(&buf);

    LittleEndian::write_u64(&mut buf, node_id);
    mac.update(&buf);

    mac.finish(out);
    Ok(())
}

pub struct FabricMgr {
    // Slot `n` holds fabric index `n + 1`
    fabrics: [Option<Fabric>; MAX_FABRICS],
}

impl FabricMgr {
    pub fn new() -> Self {
        Self {
            fabrics: core::array::from_fn(|_| None),
        }
    }

    pub fn add(&mut self, f: Fabric) -> Result<FabricIndex, Error> {
        if self.fabrics.iter().flatten().any(|e| {
            e.fabric_id == f.fabric_id && e.root_pubkey == f.root_pubkey && e.node_id == f.node_id
        }) {
            Err(ErrorCode::Invalid)?;
        }

        let slot = self
            .fabrics
            .iter()
            .position(Option::is_none)
            .ok_or(ErrorCode::NoSpace)?;

        self.fabrics[slot] = Some(f);

        let fab_idx = (slot + 1) as FabricIndex;
        info!("Added fabric at index {}", fab_idx);

        Ok(fab_idx)
    }

    pub fn remove(&mut self, fab_idx: FabricIndex) -> Result<(), Error> {
        let slot = Self::slot(fab_idx)?;
        self.fabrics[slot].take().ok_or(ErrorCode::NotFound)?;

        info!("Removed fabric at index {}", fab_idx);
        Ok(())
    }

    fn slot(fab_idx: FabricIndex) -> Result<usize, Error> {
        match fab_idx as usize {
            1..=MAX_FABRICS => Ok(fab_idx as usize - 1),
            _ => Err(ErrorCode::NoFabricId.into()),
        }
    }

    /// Finds the fabric a CASE destination identifier refers to.
    pub fn match_dest_id(&self, random: &[u8], target: &[u8]) -> Result<FabricIndex, Error> {
        self.iter()
            .find(|(_, f)| f.match_dest_id(random, target).is_ok())
            .map(|(fab_idx, _)| fab_idx)
            .ok_or(ErrorCode::NotFound.into())
    }

    pub fn get_fabric(&self, fab_idx: FabricIndex) -> Option<&Fabric> {
        Self::slot(fab_idx)
            .ok()
            .and_then(|slot| self.fabrics[slot].as_ref())
    }

    pub fn get_fabric_mut(&mut self, fab_idx: FabricIndex) -> Option<&mut Fabric> {
        Self::slot(fab_idx)
            .ok()
            .and_then(|slot| self.fabrics[slot].as_mut())
    }

    pub fn is_empty(&self) -> bool {
        self.fabrics.iter().all(Option::is_none)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FabricIndex, &Fabric)> {
        self.fabrics
            .iter()
            .enumerate()
            .filter_map(|(slot, f)| f.as_ref().map(|f| ((slot + 1) as FabricIndex, f)))
    }
}

impl Default for FabricMgr {
    fn default() -> Self {
        Self::new()
    }
}
