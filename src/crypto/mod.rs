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

//! Cryptographic primitives used by the secure channel and the session layer.
//!
//! Everything here is a thin shell over the RustCrypto crates; see
//! [`rustcrypto`] for the actual bindings.

pub const SYMM_KEY_LEN_BITS: usize = 128;
pub const SYMM_KEY_LEN_BYTES: usize = SYMM_KEY_LEN_BITS / 8;

pub const AEAD_MIC_LEN_BYTES: usize = 16;
pub const AEAD_NONCE_LEN_BYTES: usize = 13;

pub const SHA256_HASH_LEN_BYTES: usize = 256 / 8;

pub const BIGNUM_LEN_BYTES: usize = 32;
pub const EC_POINT_LEN_BYTES: usize = 65;
pub const EC_SIGNATURE_LEN_BYTES: usize = 64;
pub const ECDH_SHARED_SECRET_LEN_BYTES: usize = 32;

mod rustcrypto;

pub use rustcrypto::*;

#[cfg(test)]
mod tests {
    use crate::utils::rand::sys_rand;

    use super::{KeyPair, ECDH_SHARED_SECRET_LEN_BYTES, EC_POINT_LEN_BYTES};

    #[test]
    fn test_ecdh_agreement() {
        let a = KeyPair::new(sys_rand).unwrap();
        let b = KeyPair::new(sys_rand).unwrap();

        let mut a_pub = [0; EC_POINT_LEN_BYTES];
        let mut b_pub = [0; EC_POINT_LEN_BYTES];
        a.get_public_key(&mut a_pub).unwrap();
        b.get_public_key(&mut b_pub).unwrap();

        let mut s1 = [0; ECDH_SHARED_SECRET_LEN_BYTES];
        let mut s2 = [0; ECDH_SHARED_SECRET_LEN_BYTES];
        a.derive_secret(&b_pub, &mut s1).unwrap();
        b.derive_secret(&a_pub, &mut s2).unwrap();

        assert_eq!(s1, s2);
    }

    #[test]
    fn test_sign_verify() {
        let key = KeyPair::new(sys_rand).unwrap();
        let mut sig = [0; super::EC_SIGNATURE_LEN_BYTES];
        key.sign_msg(b"operational credential", &mut sig).unwrap();

        let mut pub_key = [0; EC_POINT_LEN_BYTES];
        key.get_public_key(&mut pub_key).unwrap();
        let verifier = KeyPair::new_from_public(&pub_key).unwrap();

        assert!(verifier.verify_msg(b"operational credential", &sig).is_ok());
        assert!(verifier.verify_msg(b"tampered credential", &sig).is_err());
    }
}
