// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Canonical byte encoding for everything that crosses the wire or hits disk.
//!
//! All encoding goes through one set of [`bincode`] options: fixed-width
//! integers, a bounded input size, and rejection of trailing bytes, so a
//! value has exactly one accepted encoding.

use crate::errors::{InternalError, Result};
use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};
use tracing::trace;

/// Upper bound on the size of any single decoded value.
const MAX_ENCODED_SIZE: u64 = 16 * 1024 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_ENCODED_SIZE)
        .reject_trailing_bytes()
}

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    options().serialize(value).map_err(|e| {
        trace!("Failed to encode value: {e}");
        InternalError::Serialization
    })
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    options().deserialize(bytes).map_err(|e| {
        trace!("Failed to decode {} bytes: {e}", bytes.len());
        InternalError::Serialization
    })
}

/// Serde adapter for [`k256::Scalar`] as 32 big-endian bytes.
pub(crate) mod scalar {
    use k256::{elliptic_curve::PrimeField, FieldBytes, Scalar};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(value: &Scalar, serializer: S) -> Result<S::Ok, S::Error> {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&value.to_bytes());
        serde::Serialize::serialize(&bytes, serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Scalar, D::Error> {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        Option::from(Scalar::from_repr(FieldBytes::from(bytes)))
            .ok_or_else(|| D::Error::custom("scalar is not reduced modulo the group order"))
    }
}

/// Serde adapter for [`k256::PublicKey`] as SEC1 bytes.
pub(crate) mod public_key {
    use k256::PublicKey;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(value: &PublicKey, serializer: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&value.to_sec1_bytes().to_vec(), serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PublicKey, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        PublicKey::from_sec1_bytes(&bytes).map_err(|_| D::Error::custom("invalid SEC1 public key"))
    }
}

/// Serde adapter for a list of [`k256::PublicKey`]s.
pub(crate) mod public_keys {
    use k256::PublicKey;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(
        values: &[PublicKey],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: Vec<Vec<u8>> = values.iter().map(|k| k.to_sec1_bytes().to_vec()).collect();
        serde::Serialize::serialize(&encoded, serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<PublicKey>, D::Error> {
        Vec::<Vec<u8>>::deserialize(deserializer)?
            .iter()
            .map(|bytes| {
                PublicKey::from_sec1_bytes(bytes)
                    .map_err(|_| D::Error::custom("invalid SEC1 public key"))
            })
            .collect()
    }
}
