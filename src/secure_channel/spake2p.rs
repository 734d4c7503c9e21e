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

use zeroize::Zeroize;

use crate::crypto::{self, pbkdf2_hmac, HmacSha256, Sha256};
use crate::error::{Error, ErrorCode};
use crate::utils::rand::Rand;

use super::{common::SCStatusCodes, crypto::CryptoSpake2};

// SPAKE2+ message flow. The EC arithmetic lives in CryptoSpake2; this file
// owns the transcript context and the key confirmation step. The verifier
// only releases Ke once cA has been confirmed.

pub const SPAKE2_ITERATION_COUNT: u32 = 2000;
pub const MIN_SALT_SIZE_BYTES: usize = 16;
pub const MAX_SALT_SIZE_BYTES: usize = 32;

const SPAKE2P_KEY_CONFIRM_INFO: &[u8] = b"ConfirmationKeys";
const SPAKE2P_CONTEXT_PREFIX: &[u8] = b"CHIP PAKE V1 Commissioning";

pub(crate) const CRYPTO_GROUP_SIZE_BYTES: usize = 32;
pub(crate) const CRYPTO_W_SIZE_BYTES: usize = CRYPTO_GROUP_SIZE_BYTES + 8;
pub(crate) const CRYPTO_PUBLIC_KEY_SIZE_BYTES: usize = (2 * CRYPTO_GROUP_SIZE_BYTES) + 1;

pub const VERIFIER_SIZE_BYTES: usize = CRYPTO_GROUP_SIZE_BYTES + CRYPTO_PUBLIC_KEY_SIZE_BYTES;

pub const KE_LEN_BYTES: usize = 16;

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Spake2VerifierState {
    // w0 and L are set
    Init,
    // Keys derived, cA not yet seen
    PendingConfirmation,
    Confirmed,
}

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Spake2ProverState {
    // w0 and w1 are set
    Init,
    // pA sent
    SentShare,
    Confirmed,
}

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Spake2Mode {
    Unknown,
    Prover(Spake2ProverState),
    Verifier(Spake2VerifierState),
}

#[allow(non_snake_case)]
pub struct Spake2P {
    mode: Spake2Mode,
    context: Option<Sha256>,
    Ke: [u8; KE_LEN_BYTES],
    cA: [u8; crypto::SHA256_HASH_LEN_BYTES],
    pA: [u8; CRYPTO_PUBLIC_KEY_SIZE_BYTES],
    crypto_spake2: Option<CryptoSpake2>,
}

impl Spake2P {
    pub const fn new() -> Self {
        Self {
            mode: Spake2Mode::Unknown,
            context: None,
            Ke: [0; KE_LEN_BYTES],
            cA: [0; crypto::SHA256_HASH_LEN_BYTES],
            pA: [0; CRYPTO_PUBLIC_KEY_SIZE_BYTES],
            crypto_spake2: None,
        }
    }

    pub fn mode(&self) -> Spake2Mode {
        self.mode
    }

    pub fn set_context(&mut self) {
        let mut context = Sha256::new();
        context.update(SPAKE2P_CONTEXT_PREFIX);
        self.context = Some(context);
    }

    pub fn update_context(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.context
            .as_mut()
            .ok_or(ErrorCode::InvalidState)?
            .update(buf);
        Ok(())
    }

    fn take_context_hash(&mut self) -> Result<[u8; crypto::SHA256_HASH_LEN_BYTES], Error> {
        let context = self.context.take().ok_or(ErrorCode::InvalidState)?;
        let mut hash = [0; crypto::SHA256_HASH_LEN_BYTES];
        context.finish(&mut hash);
        Ok(hash)
    }

    pub(crate) fn get_w0w1s(
        pw: u32,
        iter: u32,
        salt: &[u8],
        w0w1s: &mut [u8],
    ) -> Result<(), Error> {
        pbkdf2_hmac(&pw.to_le_bytes(), iter as usize, salt, w0w1s)
    }

    pub fn start_verifier(&mut self, verifier: &VerifierData) -> Result<(), Error> {
        let mut crypto_spake2 = CryptoSpake2::new()?;

        match &verifier.data {
            VerifierOption::Password(pw) => {
                let mut w0w1s = [0; 2 * CRYPTO_W_SIZE_BYTES];
                Self::get_w0w1s(*pw, verifier.count, verifier.salt(), &mut w0w1s)?;

                crypto_spake2.set_w0_from_w0s(&w0w1s[..CRYPTO_W_SIZE_BYTES]);
                crypto_spake2.set_L_from_w1s(&w0w1s[CRYPTO_W_SIZE_BYTES..]);
                w0w1s.zeroize();
            }
            VerifierOption::Verifier(v) => {
                crypto_spake2.set_w0(&v[..CRYPTO_GROUP_SIZE_BYTES])?;
                crypto_spake2.set_L(&v[CRYPTO_GROUP_SIZE_BYTES..])?;
            }
        }

        self.crypto_spake2 = Some(crypto_spake2);
        self.mode = Spake2Mode::Verifier(Spake2VerifierState::Init);
        Ok(())
    }

    pub fn start_prover(&mut self, pw: u32, iter: u32, salt: &[u8]) -> Result<(), Error> {
        let mut crypto_spake2 = CryptoSpake2::new()?;

        let mut w0w1s = [0; 2 * CRYPTO_W_SIZE_BYTES];
        Self::get_w0w1s(pw, iter, salt, &mut w0w1s)?;
        crypto_spake2.set_w0_from_w0s(&w0w1s[..CRYPTO_W_SIZE_BYTES]);
        crypto_spake2.set_w1_from_w1s(&w0w1s[CRYPTO_W_SIZE_BYTES..]);
        w0w1s.zeroize();

        self.crypto_spake2 = Some(crypto_spake2);
        self.mode = Spake2Mode::Prover(Spake2ProverState::Init);
        Ok(())
    }

    /// Prover: generates pA.
    #[allow(non_snake_case)]
    pub fn get_pA(&mut self, pA: &mut [u8], rand: Rand) -> Result<(), Error> {
        if self.mode != Spake2Mode::Prover(Spake2ProverState::Init) {
            Err(ErrorCode::InvalidState)?;
        }

        let crypto_spake2 = self.crypto_spake2.as_mut().ok_or(ErrorCode::InvalidState)?;
        crypto_spake2.get_pA(pA, rand)?;
        self.pA.copy_from_slice(pA);

        self.mode = Spake2Mode::Prover(Spake2ProverState::SentShare);
        Ok(())
    }

    /// Prover: checks the verifier's confirmation `cB` and produces `cA`.
    #[allow(non_snake_case)]
    pub fn handle_pB_cB(&mut self, pB: &[u8], cB: &[u8], cA: &mut [u8]) -> Result<(), Error> {
        if self.mode != Spake2Mode::Prover(Spake2ProverState::SentShare) {
            Err(ErrorCode::InvalidState)?;
        }

        let hash = self.take_context_hash()?;
        let crypto_spake2 = self.crypto_spake2.take().ok_or(ErrorCode::InvalidState)?;

        let mut TT = [0; crypto::SHA256_HASH_LEN_BYTES];
        crypto_spake2.get_TT_as_prover(&hash, &self.pA, pB, &mut TT)?;

        let mut expected_cB = [0; crypto::SHA256_HASH_LEN_BYTES];
        let pA = self.pA;
        Self::get_Ke_and_cAcB(&TT, &pA, pB, &mut self.Ke, cA, &mut expected_cB)?;

        if !crypto::ct_equal(cB, &expected_cB) {
            self.Ke.zeroize();
            Err(ErrorCode::InvalidSignature)?;
        }

        self.mode = Spake2Mode::Prover(Spake2ProverState::Confirmed);
        Ok(())
    }

    /// Verifier: answers pA with pB and cB.
    #[allow(non_snake_case)]
    pub fn handle_pA(
        &mut self,
        pA: &[u8],
        pB: &mut [u8],
        cB: &mut [u8],
        rand: Rand,
    ) -> Result<(), Error> {
        if self.mode != Spake2Mode::Verifier(Spake2VerifierState::Init) {
            Err(ErrorCode::InvalidState)?;
        }

        let hash = self.take_context_hash()?;
        let mut crypto_spake2 = self.crypto_spake2.take().ok_or(ErrorCode::InvalidState)?;

        crypto_spake2.get_pB(pB, rand)?;

        let mut TT = [0; crypto::SHA256_HASH_LEN_BYTES];
        crypto_spake2.get_TT_as_verifier(&hash, pA, pB, &mut TT)?;

        Self::get_Ke_and_cAcB(&TT, pA, pB, &mut self.Ke, &mut self.cA, cB)?;

        self.mode = Spake2Mode::Verifier(Spake2VerifierState::PendingConfirmation);
        Ok(())
    }

    /// Verifier: checks the prover's confirmation. Ke is returned only on
    /// success.
    #[allow(non_snake_case)]
    pub fn handle_cA(&mut self, cA: &[u8]) -> (SCStatusCodes, Option<&[u8]>) {
        if self.mode != Spake2Mode::Verifier(Spake2VerifierState::PendingConfirmation) {
            return (SCStatusCodes::SessionNotFound, None);
        }

        self.mode = Spake2Mode::Verifier(Spake2VerifierState::Confirmed);
        if crypto::ct_equal(cA, &self.cA) {
            (SCStatusCodes::SessionEstablishmentSuccess, Some(&self.Ke))
        } else {
            (SCStatusCodes::InvalidParameter, None)
        }
    }

    /// The shared secret Ke once the prover has confirmed the exchange.
    pub fn prover_ke(&self) -> Option<&[u8]> {
        (self.mode == Spake2Mode::Prover(Spake2ProverState::Confirmed)).then_some(&self.Ke[..])
    }

    #[allow(non_snake_case)]
    fn get_Ke_and_cAcB(
        TT: &[u8],
        pA: &[u8],
        pB: &[u8],
        Ke: &mut [u8],
        cA: &mut [u8],
        cB: &mut [u8],
    ) -> Result<(), Error> {
        // Ka || Ke = Hash(TT)
        let (Ka, ke_internal) = TT.split_at(TT.len() / 2);
        if ke_internal.len() != Ke.len() {
            Err(ErrorCode::NoSpace)?;
        }
        Ke.copy_from_slice(ke_internal);

        // KcA || KcB = KDF(nil, Ka, "ConfirmationKeys")
        let mut KcAKcB = [0; 32];
        crypto::hkdf_sha256(&[], Ka, SPAKE2P_KEY_CONFIRM_INFO, &mut KcAKcB)?;

        let (KcA, KcB) = KcAKcB.split_at(KcAKcB.len() / 2);

        // cA = HMAC(KcA, pB), cB = HMAC(KcB, pA)
        let mut mac = HmacSha256::new(KcA)?;
        mac.update(pB);
        mac.finish(cA);

        let mut mac = HmacSha256::new(KcB)?;
        mac.update(pA);
        mac.finish(cB);

        KcAKcB.zeroize();
        Ok(())
    }
}

impl Default for Spake2P {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Spake2P {
    fn drop(&mut self) {
        self.Ke.zeroize();
        self.cA.zeroize();
    }
}

#[derive(Debug, Clone)]
pub enum VerifierOption {
    /// The passcode itself; w0 and L are derived for each handshake.
    Password(u32),
    /// A precomputed w0 || L.
    Verifier([u8; VERIFIER_SIZE_BYTES]),
}

#[derive(Debug, Clone)]
pub struct VerifierData {
    pub data: VerifierOption,
    salt: heapless::Vec<u8, MAX_SALT_SIZE_BYTES>,
    pub count: u32,
}

impl VerifierData {
    /// Passcode-based verifier with a fresh random salt.
    pub fn new_with_pw(pw: u32, rand: Rand) -> Self {
        let mut salt = [0; MAX_SALT_SIZE_BYTES];
        rand(&mut salt);

        Self {
            data: VerifierOption::Password(pw),
            salt: heapless::Vec::from_slice(&salt).unwrap_or_default(),
            count: SPAKE2_ITERATION_COUNT,
        }
    }

    pub fn new(verifier: &[u8], salt: &[u8], count: u32) -> Result<Self, Error> {
        Ok(Self {
            data: VerifierOption::Verifier(
                verifier.try_into().map_err(|_| ErrorCode::InvalidData)?,
            ),
            salt: Self::check_salt(salt)?,
            count,
        })
    }

    /// Passcode-based verifier with a caller-chosen salt.
    pub fn new_with_pw_and_salt(pw: u32, salt: &[u8], count: u32) -> Result<Self, Error> {
        Ok(Self {
            data: VerifierOption::Password(pw),
            salt: Self::check_salt(salt)?,
            count,
        })
    }

    /// Precomputes w0 || L for a passcode, so the passcode itself need not
    /// be kept on the device.
    pub fn compute_verifier(
        pw: u32,
        salt: &[u8],
        count: u32,
    ) -> Result<[u8; VERIFIER_SIZE_BYTES], Error> {
        let mut w0w1s = [0; 2 * CRYPTO_W_SIZE_BYTES];
        Spake2P::get_w0w1s(pw, count, salt, &mut w0w1s)?;

        let mut c = CryptoSpake2::new()?;
        c.set_w0_from_w0s(&w0w1s[..CRYPTO_W_SIZE_BYTES]);
        c.set_L_from_w1s(&w0w1s[CRYPTO_W_SIZE_BYTES..]);
        w0w1s.zeroize();

        let mut verifier = [0; VERIFIER_SIZE_BYTES];
        c.get_w0(&mut verifier[..CRYPTO_GROUP_SIZE_BYTES]);
        c.get_L(&mut verifier[CRYPTO_GROUP_SIZE_BYTES..]);
        Ok(verifier)
    }

    fn check_salt(salt: &[u8]) -> Result<heapless::Vec<u8, MAX_SALT_SIZE_BYTES>, Error> {
        if salt.len() < MIN_SALT_SIZE_BYTES {
            Err(ErrorCode::InvalidData)?;
        }

        heapless::Vec::from_slice(salt).map_err(|_| ErrorCode::InvalidData.into())
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }
}
