// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2023 Bolt Labs, Inc.
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Non-interactive proofs exchanged during key generation.
//!
//! Key generation only needs one: [`pisch::PiSchProof`], showing that a member
//! knows the discrete log of the constant term it committed to. Proofs are
//! made non-interactive with a [`Transcript`] both sides build identically;
//! binding the transcript to the group and the sender is the caller's job.

pub(crate) mod pisch;

use crate::errors::Result;
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{de::DeserializeOwned, Serialize};

/// A proof about a public `CommonInput` for a `ProverSecret` only the prover
/// holds. Proofs travel inside round messages, hence the serde bounds.
pub(crate) trait Proof: Sized + Serialize + DeserializeOwned {
    type CommonInput;
    type ProverSecret;

    fn prove<R: RngCore + CryptoRng>(
        input: &Self::CommonInput,
        secret: &Self::ProverSecret,
        transcript: &mut Transcript,
        rng: &mut R,
    ) -> Result<Self>;

    /// Fails with [`InternalError::FailedToVerify`](crate::errors::InternalError::FailedToVerify)
    /// if the proof does not hold for `input` under `transcript`.
    fn verify(&self, input: &Self::CommonInput, transcript: &mut Transcript) -> Result<()>;
}
