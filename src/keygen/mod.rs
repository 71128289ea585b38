// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Distributed generation of a Feldman-verifiable sharing of a secp256k1
//! signing key.

mod keygen_commit;
mod keyshare;
mod participant;

pub(crate) use keyshare::KeyShare;
pub(crate) use participant::KeygenParticipant;
