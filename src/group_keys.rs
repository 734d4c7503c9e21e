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

use byteorder::{BigEndian, ByteOrder};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{crypto, error::Error};

const GROUP_KEY_INFO: &[u8] = b"GroupKey v1.0";
const GROUP_KEY_HASH_INFO: &[u8] = b"GroupKeyHash";

/// An epoch key together with the operational key derived from it for one
/// fabric. Used both for the IPK and for group message keys.
#[derive(Debug, Default, Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeySet {
    epoch_key: [u8; crypto::SYMM_KEY_LEN_BYTES],
    op_key: [u8; crypto::SYMM_KEY_LEN_BYTES],
    session_id: u16,
}

impl KeySet {
    pub fn new(epoch_key: &[u8], compressed_id: &[u8]) -> Result<Self, Error> {
        let mut ks = KeySet::default();
        ks.epoch_key.copy_from_slice(epoch_key);

        crypto::hkdf_sha256(compressed_id, epoch_key, GROUP_KEY_INFO, &mut ks.op_key)?;

        let mut hash = [0; 2];
        crypto::hkdf_sha256(&[], &ks.op_key, GROUP_KEY_HASH_INFO, &mut hash)?;
        ks.session_id = BigEndian::read_u16(&hash);

        Ok(ks)
    }

    pub fn op_key(&self) -> &[u8] {
        &self.op_key
    }

    pub fn epoch_key(&self) -> &[u8] {
        &self.epoch_key
    }

    /// The session id carried in the plain header of group messages
    /// encrypted with this key.
    pub fn session_id(&self) -> u16 {
        self.session_id
    }
}
