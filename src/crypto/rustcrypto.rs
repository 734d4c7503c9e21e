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

use aes::Aes128;
use ccm::{
    aead::generic_array::GenericArray,
    consts::{U13, U16},
    AeadInPlace, Ccm, KeyInit,
};
use hmac::Mac;
use log::error;
use p256::{
    ecdsa::{
        signature::{Signer, Verifier},
        Signature, SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
    PublicKey, SecretKey,
};
use sha2::Digest;
use subtle::ConstantTimeEq;

use crate::{
    error::{Error, ErrorCode},
    utils::rand::{Rand, RandRngCore},
};

use super::{AEAD_NONCE_LEN_BYTES, EC_SIGNATURE_LEN_BYTES, SYMM_KEY_LEN_BYTES};

type HmacSha256I = hmac::Hmac<sha2::Sha256>;
type AesCcm = Ccm<Aes128, U16, U13>;

#[derive(Debug, Clone, Default)]
pub struct Sha256 {
    hasher: sha2::Sha256,
}

impl Sha256 {
    pub fn new() -> Self {
        Self {
            hasher: sha2::Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Writes the digest of everything fed so far, leaving the running
    /// hash untouched.
    pub fn peek(&self, digest: &mut [u8]) {
        self.clone().finish(digest)
    }

    pub fn finish(self, digest: &mut [u8]) {
        let output = self.hasher.finalize();
        digest.copy_from_slice(output.as_slice());
    }

    pub fn digest(data: &[&[u8]], out: &mut [u8]) {
        let mut hasher = Self::new();
        for d in data {
            hasher.update(d);
        }
        hasher.finish(out);
    }
}

pub struct HmacSha256 {
    inner: HmacSha256I,
}

impl HmacSha256 {
    pub fn new(key: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            inner: <HmacSha256I as Mac>::new_from_slice(key).map_err(|e| {
                error!("Error creating HmacSha256 {}", e);
                ErrorCode::InvalidKeyLength
            })?,
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(self, out: &mut [u8]) {
        out.copy_from_slice(&self.inner.finalize().into_bytes());
    }
}

#[derive(Debug, Clone)]
enum KeyType {
    Private(SecretKey),
    Public(PublicKey),
}

/// A NIST P-256 key, either a full key pair or only the public half of a
/// peer's key.
#[derive(Debug, Clone)]
pub struct KeyPair {
    key: KeyType,
}

impl KeyPair {
    pub fn new(rand: Rand) -> Result<Self, Error> {
        let mut rng = RandRngCore(rand);

        Ok(Self {
            key: KeyType::Private(SecretKey::random(&mut rng)),
        })
    }

    pub fn new_from_private(priv_key: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            key: KeyType::Private(SecretKey::from_slice(priv_key)?),
        })
    }

    pub fn new_from_public(pub_key: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            key: KeyType::Public(PublicKey::from_sec1_bytes(pub_key)?),
        })
    }

    fn public_key(&self) -> PublicKey {
        match &self.key {
            KeyType::Private(k) => k.public_key(),
            KeyType::Public(k) => *k,
        }
    }

    fn private_key(&self) -> Result<&SecretKey, Error> {
        match &self.key {
            KeyType::Private(key) => Ok(key),
            KeyType::Public(_) => Err(ErrorCode::Crypto.into()),
        }
    }

    pub fn get_public_key(&self, pub_key: &mut [u8]) -> Result<usize, Error> {
        let point = self.public_key().to_encoded_point(false);
        let bytes = point.as_bytes();
        if pub_key.len() < bytes.len() {
            Err(ErrorCode::NoSpace)?;
        }

        pub_key[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    pub fn get_private_key(&self, priv_key: &mut [u8]) -> Result<usize, Error> {
        let bytes = self.private_key()?.to_bytes();
        if priv_key.len() < bytes.len() {
            Err(ErrorCode::NoSpace)?;
        }

        priv_key[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// ECDH with the peer's uncompressed SEC1 public key.
    pub fn derive_secret(&self, peer_pub_key: &[u8], secret: &mut [u8]) -> Result<usize, Error> {
        let peer = PublicKey::from_sec1_bytes(peer_pub_key)?;
        let shared =
            p256::ecdh::diffie_hellman(self.private_key()?.to_nonzero_scalar(), peer.as_affine());

        let bytes = shared.raw_secret_bytes();
        if secret.len() != bytes.len() {
            Err(ErrorCode::InvalidKeyLength)?;
        }

        secret.copy_from_slice(bytes);
        Ok(bytes.len())
    }

    pub fn sign_msg(&self, msg: &[u8], signature: &mut [u8]) -> Result<usize, Error> {
        if signature.len() < EC_SIGNATURE_LEN_BYTES {
            Err(ErrorCode::NoSpace)?;
        }

        let signing_key = SigningKey::from(self.private_key()?);
        let sig: Signature = signing_key.sign(msg);
        let bytes = sig.to_bytes();

        signature[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    pub fn verify_msg(&self, msg: &[u8], signature: &[u8]) -> Result<(), Error> {
        let verifying_key = VerifyingKey::from(self.public_key());
        let signature = Signature::from_slice(signature)?;

        verifying_key
            .verify(msg, &signature)
            .map_err(|_| ErrorCode::InvalidSignature)?;

        Ok(())
    }
}

pub fn pbkdf2_hmac(pass: &[u8], iter: usize, salt: &[u8], key: &mut [u8]) -> Result<(), Error> {
    pbkdf2::pbkdf2::<HmacSha256I>(pass, salt, iter as u32, key).map_err(|e| {
        error!("Error with pbkdf2_hmac {}", e);
        ErrorCode::InvalidKeyLength.into()
    })
}

pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], key: &mut [u8]) -> Result<(), Error> {
    hkdf::Hkdf::<sha2::Sha256>::new(Some(salt), ikm)
        .expand(info, key)
        .map_err(|e| {
            error!("Error with hkdf_sha256 {}", e);
            ErrorCode::InvalidKeyLength.into()
        })
}

/// Constant-time comparison of two MACs or confirmation values.
pub fn ct_equal(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

fn aes_ccm(key: &[u8], nonce: &[u8]) -> Result<AesCcm, Error> {
    if key.len() != SYMM_KEY_LEN_BYTES {
        Err(ErrorCode::InvalidKeyLength)?;
    }
    if nonce.len() != AEAD_NONCE_LEN_BYTES {
        Err(ErrorCode::InvalidArgument)?;
    }

    Ok(AesCcm::new(GenericArray::from_slice(key)))
}

/// AES-CCM encrypts the first `data_len` bytes of `data` and appends the MIC.
/// Returns the length of ciphertext plus MIC.
pub fn encrypt_in_place(
    key: &[u8],
    nonce: &[u8],
    ad: &[u8],
    data: &mut [u8],
    data_len: usize,
) -> Result<usize, Error> {
    let cipher = aes_ccm(key, nonce)?;

    let mut buffer = SliceBuffer::new(data, data_len);
    cipher.encrypt_in_place(GenericArray::from_slice(nonce), ad, &mut buffer)?;
    Ok(buffer.len)
}

/// Verifies the trailing MIC of `data` and decrypts it in place. Returns the
/// plaintext length.
pub fn decrypt_in_place(
    key: &[u8],
    nonce: &[u8],
    ad: &[u8],
    data: &mut [u8],
) -> Result<usize, Error> {
    let cipher = aes_ccm(key, nonce)?;

    let len = data.len();
    let mut buffer = SliceBuffer::new(data, len);
    cipher.decrypt_in_place(GenericArray::from_slice(nonce), ad, &mut buffer)?;
    Ok(buffer.len)
}

struct SliceBuffer<'a> {
    slice: &'a mut [u8],
    len: usize,
}

impl<'a> SliceBuffer<'a> {
    fn new(slice: &'a mut [u8], len: usize) -> Self {
        Self { slice, len }
    }
}

impl AsMut<[u8]> for SliceBuffer<'_> {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.slice[..self.len]
    }
}

impl AsRef<[u8]> for SliceBuffer<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.slice[..self.len]
    }
}

impl ccm::aead::Buffer for SliceBuffer<'_> {
    fn extend_from_slice(&mut self, other: &[u8]) -> ccm::aead::Result<()> {
        let end = self.len + other.len();
        if end > self.slice.len() {
            error!("AEAD buffer overflow");
            return Err(ccm::aead::Error);
        }

        self.slice[self.len..end].copy_from_slice(other);
        self.len = end;
        Ok(())
    }

    fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }
}
