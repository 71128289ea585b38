// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Schnorr proof of knowledge of a discrete logarithm over secp256k1.
//!
//! The prover's first message can be computed ahead of time (see
//! [`PiSchPrecommit`]), which lets the pre-parameter pool absorb the cost of
//! sampling the nonce.
#![allow(non_snake_case)]

use super::Proof;
use crate::{
    errors::*,
    serialization,
    utils::{random_nonzero_scalar, scalar_from_transcript, CurvePoint},
};
use k256::Scalar;
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PiSchProof {
    A: CurvePoint,
    #[serde(with = "serialization::scalar")]
    e: Scalar,
    #[serde(with = "serialization::scalar")]
    z: Scalar,
}

/// The prover's commitment `A = g^alpha` together with its nonce.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct PiSchPrecommit {
    #[serde(with = "serialization::scalar")]
    alpha: Scalar,
    A: CurvePoint,
}

impl std::fmt::Debug for PiSchPrecommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiSchPrecommit")
            .field("alpha", &"[redacted]")
            .field("A", &self.A)
            .finish()
    }
}

impl Drop for PiSchPrecommit {
    fn drop(&mut self) {
        self.alpha.zeroize();
    }
}

impl PiSchPrecommit {
    pub(crate) fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let alpha = random_nonzero_scalar(rng);
        Self {
            alpha,
            A: CurvePoint::base_mul(&alpha),
        }
    }
}

pub(crate) struct PiSchInput {
    X: CurvePoint,
}

impl PiSchInput {
    pub(crate) fn new(X: &CurvePoint) -> Self {
        Self { X: *X }
    }
}

pub(crate) struct PiSchSecret {
    x: Scalar,
}

impl PiSchSecret {
    pub(crate) fn new(x: &Scalar) -> Self {
        Self { x: *x }
    }
}

impl Drop for PiSchSecret {
    fn drop(&mut self) {
        self.x.zeroize();
    }
}

fn challenge(transcript: &mut Transcript, input: &PiSchInput, A: &CurvePoint) -> Scalar {
    transcript.append_message(b"PiSchProof X", &input.X.to_bytes());
    transcript.append_message(b"PiSchProof A", &A.to_bytes());
    scalar_from_transcript(transcript, b"PiSchProof e")
}

impl PiSchProof {
    /// Finish a proof whose commitment was sampled ahead of time.
    pub(crate) fn prove_from_precommit(
        precommit: &PiSchPrecommit,
        input: &PiSchInput,
        secret: &PiSchSecret,
        transcript: &mut Transcript,
    ) -> Self {
        let e = challenge(transcript, input, &precommit.A);
        let z = precommit.alpha + e * secret.x;
        Self {
            A: precommit.A,
            e,
            z,
        }
    }
}

impl Proof for PiSchProof {
    type CommonInput = PiSchInput;
    type ProverSecret = PiSchSecret;

    fn prove<R: RngCore + CryptoRng>(
        input: &Self::CommonInput,
        secret: &Self::ProverSecret,
        transcript: &mut Transcript,
        rng: &mut R,
    ) -> Result<Self> {
        let precommit = PiSchPrecommit::generate(rng);
        Ok(Self::prove_from_precommit(
            &precommit, input, secret, transcript,
        ))
    }

    fn verify(&self, input: &Self::CommonInput, transcript: &mut Transcript) -> Result<()> {
        // First check Fiat-Shamir challenge consistency
        let e = challenge(transcript, input, &self.A);
        if e != self.e {
            return verify_err!("Fiat-Shamir consistency check failed");
        }

        let lhs = CurvePoint::base_mul(&self.z);
        let rhs = self.A + input.X * &self.e;
        if lhs != rhs {
            return verify_err!("eq_check_1 failed");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn random_schnorr_proof(additive: bool) -> Result<(PiSchInput, PiSchProof)> {
        let mut rng = OsRng;

        let mut x = random_nonzero_scalar(&mut rng);
        let X = CurvePoint::base_mul(&x);
        if additive {
            x += random_nonzero_scalar(&mut rng);
        }

        let input = PiSchInput::new(&X);
        let mut transcript = Transcript::new(b"PiSchProof test");
        let proof = PiSchProof::prove(&input, &PiSchSecret::new(&x), &mut transcript, &mut rng)?;

        Ok((input, proof))
    }

    #[test]
    fn test_schnorr_proof() -> Result<()> {
        let (input, proof) = random_schnorr_proof(false)?;
        let mut transcript = Transcript::new(b"PiSchProof test");
        assert!(proof.verify(&input, &mut transcript).is_ok());

        let (input, proof) = random_schnorr_proof(true)?;
        let mut transcript = Transcript::new(b"PiSchProof test");
        assert!(proof.verify(&input, &mut transcript).is_err());

        Ok(())
    }

    #[test]
    fn proof_is_bound_to_transcript_context() -> Result<()> {
        let (input, proof) = random_schnorr_proof(false)?;
        let mut transcript = Transcript::new(b"some other context");
        assert!(proof.verify(&input, &mut transcript).is_err());
        Ok(())
    }

    #[test]
    fn precommitted_proof_verifies() {
        let mut rng = OsRng;
        let x = random_nonzero_scalar(&mut rng);
        let input = PiSchInput::new(&CurvePoint::base_mul(&x));
        let precommit = PiSchPrecommit::generate(&mut rng);

        let mut transcript = Transcript::new(b"precommit");
        let proof =
            PiSchProof::prove_from_precommit(&precommit, &input, &PiSchSecret::new(&x), &mut transcript);

        let mut transcript = Transcript::new(b"precommit");
        assert!(proof.verify(&input, &mut transcript).is_ok());
    }
}
