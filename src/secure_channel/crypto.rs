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

//! Elliptic-curve arithmetic behind SPAKE2+ on P-256.

use core::ops::Neg;

use p256::{
    elliptic_curve::{sec1::ToEncodedPoint, Field, PrimeField},
    AffinePoint, EncodedPoint, ProjectivePoint, PublicKey, Scalar,
};
use sha2::Digest;

use crate::{
    error::*,
    utils::rand::{Rand, RandRngCore},
};

use super::spake2p::{CRYPTO_GROUP_SIZE_BYTES, CRYPTO_PUBLIC_KEY_SIZE_BYTES};

pub(crate) const MATTER_M_BIN: [u8; 65] = [
    0x04, 0x88, 0x6e, 0x2f, 0x97, 0xac, 0xe4, 0x6e, 0x55, 0xba, 0x9d, 0xd7, 0x24, 0x25, 0x79, 0xf2,
    0x99, 0x3b, 0x64, 0xe1, 0x6e, 0xf3, 0xdc, 0xab, 0x95, 0xaf, 0xd4, 0x97, 0x33, 0x3d, 0x8f, 0xa1,
    0x2f, 0x5f, 0xf3, 0x55, 0x16, 0x3e, 0x43, 0xce, 0x22, 0x4e, 0x0b, 0x0e, 0x65, 0xff, 0x02, 0xac,
    0x8e, 0x5c, 0x7b, 0xe0, 0x94, 0x19, 0xc7, 0x85, 0xe0, 0xca, 0x54, 0x7d, 0x55, 0xa1, 0x2e, 0x2d,
    0x20,
];
pub(crate) const MATTER_N_BIN: [u8; 65] = [
    0x04, 0xd8, 0xbb, 0xd6, 0xc6, 0x39, 0xc6, 0x29, 0x37, 0xb0, 0x4d, 0x99, 0x7f, 0x38, 0xc3, 0x77,
    0x07, 0x19, 0xc6, 0x29, 0xd7, 0x01, 0x4d, 0x49, 0xa2, 0x4b, 0x4f, 0x98, 0xba, 0xa1, 0x29, 0x2b,
    0x49, 0x07, 0xd6, 0x0a, 0xa6, 0xbf, 0xad, 0xe4, 0x50, 0x08, 0xa6, 0x36, 0x33, 0x7f, 0x51, 0x68,
    0xc6, 0x4d, 0x9b, 0xd3, 0x60, 0x34, 0x80, 0x8c, 0xd5, 0x64, 0x49, 0x0b, 0x1e, 0x65, 0x6e, 0xdb,
    0xe7,
];

fn point(bytes: &[u8]) -> Result<AffinePoint, Error> {
    // Rejects the identity and points off the curve
    Ok(*PublicKey::from_sec1_bytes(bytes)?.as_affine())
}

fn encode(p: ProjectivePoint) -> EncodedPoint {
    p.to_encoded_point(false)
}

/// Interprets big-endian `bytes` of any length as an integer reduced modulo
/// the group order.
fn scalar_mod_n(bytes: &[u8]) -> Scalar {
    let base = Scalar::from(256u64);
    bytes
        .iter()
        .fold(Scalar::ZERO, |acc, b| acc * base + Scalar::from(*b as u64))
}

fn scalar(bytes: &[u8]) -> Result<Scalar, Error> {
    if bytes.len() != CRYPTO_GROUP_SIZE_BYTES {
        Err(ErrorCode::InvalidData)?;
    }

    let mut repr = p256::FieldBytes::default();
    repr.copy_from_slice(bytes);

    Option::<Scalar>::from(Scalar::from_repr(repr)).ok_or(ErrorCode::InvalidData.into())
}

#[allow(non_snake_case)]
pub struct CryptoSpake2 {
    xy: Scalar,
    w0: Scalar,
    w1: Scalar,
    M: AffinePoint,
    N: AffinePoint,
    L: AffinePoint,
}

#[allow(non_snake_case)]
impl CryptoSpake2 {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            xy: Scalar::ZERO,
            w0: Scalar::ZERO,
            w1: Scalar::ZERO,
            M: point(&MATTER_M_BIN)?,
            N: point(&MATTER_N_BIN)?,
            L: AffinePoint::IDENTITY,
        })
    }

    /// w0 = w0s mod n
    pub fn set_w0_from_w0s(&mut self, w0s: &[u8]) {
        self.w0 = scalar_mod_n(w0s);
    }

    /// w1 = w1s mod n
    pub fn set_w1_from_w1s(&mut self, w1s: &[u8]) {
        self.w1 = scalar_mod_n(w1s);
    }

    pub fn set_w0(&mut self, w0: &[u8]) -> Result<(), Error> {
        self.w0 = scalar(w0)?;
        Ok(())
    }

    pub fn set_w1(&mut self, w1: &[u8]) -> Result<(), Error> {
        self.w1 = scalar(w1)?;
        Ok(())
    }

    pub fn set_L(&mut self, l: &[u8]) -> Result<(), Error> {
        self.L = point(l)?;
        Ok(())
    }

    /// L = w1 * P, where P is the generator of the curve.
    pub fn set_L_from_w1s(&mut self, w1s: &[u8]) {
        self.set_w1_from_w1s(w1s);
        self.L = (AffinePoint::GENERATOR * self.w1).to_affine();
    }

    pub fn get_w0(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.w0.to_bytes());
    }

    pub fn get_L(&self, out: &mut [u8]) {
        out.copy_from_slice(self.L.to_encoded_point(false).as_bytes());
    }

    /// Prover share: X = x*P + w0*M with a fresh random x.
    pub fn get_pA(&mut self, pA: &mut [u8], rand: Rand) -> Result<(), Error> {
        self.xy = Scalar::random(&mut RandRngCore(rand));

        let X = Self::do_add_mul(AffinePoint::GENERATOR, self.xy, self.M, self.w0);
        Self::copy_point(&X, pA)
    }

    /// Verifier share: Y = y*P + w0*N with a fresh random y.
    pub fn get_pB(&mut self, pB: &mut [u8], rand: Rand) -> Result<(), Error> {
        self.xy = Scalar::random(&mut RandRngCore(rand));

        let Y = Self::do_add_mul(AffinePoint::GENERATOR, self.xy, self.N, self.w0);
        Self::copy_point(&Y, pB)
    }

    pub fn get_TT_as_verifier(
        &self,
        context: &[u8],
        pA: &[u8],
        pB: &[u8],
        out: &mut [u8],
    ) -> Result<(), Error> {
        let X = point(pA)?;
        let (Z, V) = Self::get_ZV_as_verifier(self.w0, self.L, self.M, X, self.xy);

        self.get_TT(context, pA, pB, &Z, &V, out)
    }

    pub fn get_TT_as_prover(
        &self,
        context: &[u8],
        pA: &[u8],
        pB: &[u8],
        out: &mut [u8],
    ) -> Result<(), Error> {
        let Y = point(pB)?;
        let (Z, V) = Self::get_ZV_as_prover(self.w0, self.w1, self.N, Y, self.xy);

        self.get_TT(context, pA, pB, &Z, &V, out)
    }

    fn get_TT(
        &self,
        context: &[u8],
        pA: &[u8],
        pB: &[u8],
        Z: &EncodedPoint,
        V: &EncodedPoint,
        out: &mut [u8],
    ) -> Result<(), Error> {
        let mut TT = sha2::Sha256::new();

        Self::add_to_tt(&mut TT, context);
        // Neither side carries an identity
        Self::add_to_tt(&mut TT, &[]);
        Self::add_to_tt(&mut TT, &[]);
        Self::add_to_tt(&mut TT, &MATTER_M_BIN);
        Self::add_to_tt(&mut TT, &MATTER_N_BIN);
        Self::add_to_tt(&mut TT, pA);
        Self::add_to_tt(&mut TT, pB);
        Self::add_to_tt(&mut TT, Z.as_bytes());
        Self::add_to_tt(&mut TT, V.as_bytes());
        Self::add_to_tt(&mut TT, &self.w0.to_bytes());

        out.copy_from_slice(TT.finalize().as_slice());
        Ok(())
    }

    fn add_to_tt(tt: &mut sha2::Sha256, buf: &[u8]) {
        tt.update((buf.len() as u64).to_le_bytes());
        tt.update(buf);
    }

    fn copy_point(p: &EncodedPoint, out: &mut [u8]) -> Result<(), Error> {
        let bytes = p.as_bytes();
        if out.len() != CRYPTO_PUBLIC_KEY_SIZE_BYTES || bytes.len() != out.len() {
            Err(ErrorCode::InvalidData)?;
        }

        out.copy_from_slice(bytes);
        Ok(())
    }

    fn do_add_mul(a: AffinePoint, b: Scalar, c: AffinePoint, d: Scalar) -> EncodedPoint {
        encode((a * b) + (c * d))
    }

    /// Z = x*(Y - w0*N), V = w1*(Y - w0*N). The P-256 cofactor is 1.
    fn get_ZV_as_prover(
        w0: Scalar,
        w1: Scalar,
        N: AffinePoint,
        Y: AffinePoint,
        x: Scalar,
    ) -> (EncodedPoint, EncodedPoint) {
        let N_neg = N.neg();

        let Z = Self::do_add_mul(Y, x, N_neg, x * w0);
        let V = Self::do_add_mul(Y, w1, N_neg, w1 * w0);
        (Z, V)
    }

    /// Z = y*(X - w0*M), V = y*L.
    fn get_ZV_as_verifier(
        w0: Scalar,
        L: AffinePoint,
        M: AffinePoint,
        X: AffinePoint,
        y: Scalar,
    ) -> (EncodedPoint, EncodedPoint) {
        let M_neg = M.neg();

        let Z = Self::do_add_mul(X, y, M_neg, y * w0);
        let V = encode(L * y);
        (Z, V)
    }
}
