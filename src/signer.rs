// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The persisted unit of signing state.

use crate::{
    errors::{InternalError, Result},
    group::{GroupId, GroupInfo, MemberId},
    keygen::KeyShare,
};
use k256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key share material produced by a key generation run.
///
/// Opaque to everything but the signing protocol; stored and compared as raw
/// bytes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdKey(Vec<u8>);

impl ThresholdKey {
    pub(crate) fn from_key_share(key_share: &KeyShare) -> Result<Self> {
        Ok(ThresholdKey(serialize!(key_share)?))
    }

    pub(crate) fn key_share(&self) -> Result<KeyShare> {
        deserialize!(&self.0)
    }

    /// The raw key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ThresholdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThresholdKey([redacted; {} bytes])", self.0.len())
    }
}

/// One member's signing state for one group: the group description plus the
/// member's key share.
///
/// Only a successful key generation run creates a `ThresholdSigner`, and it
/// never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdSigner {
    group_info: GroupInfo,
    threshold_key: ThresholdKey,
}

impl ThresholdSigner {
    pub(crate) fn new(group_info: GroupInfo, key_share: &KeyShare) -> Result<Self> {
        check_key_share(&group_info, key_share)?;
        Ok(Self {
            group_info,
            threshold_key: ThresholdKey::from_key_share(key_share)?,
        })
    }

    /// The group this signer belongs to.
    pub fn group_info(&self) -> &GroupInfo {
        &self.group_info
    }

    /// This member's key material.
    pub fn threshold_key(&self) -> &ThresholdKey {
        &self.threshold_key
    }

    /// Shorthand for the group identifier.
    pub fn group_id(&self) -> &GroupId {
        self.group_info.group_id()
    }

    /// Shorthand for the local member identifier.
    pub fn member_id(&self) -> &MemberId {
        self.group_info.member_id()
    }

    pub(crate) fn key_share(&self) -> Result<KeyShare> {
        self.threshold_key.key_share()
    }

    /// The group's public signing key.
    pub fn public_key(&self) -> Result<PublicKey> {
        self.key_share()?.group_public_key()
    }

    /// The group's public key as the uncompressed `X || Y` coordinates.
    pub fn public_key_bytes(&self) -> Result<[u8; 64]> {
        let encoded = self.public_key()?.to_encoded_point(false);
        let mut bytes = [0u8; 64];
        // Skip the SEC1 tag byte.
        bytes.copy_from_slice(
            encoded
                .as_bytes()
                .get(1..65)
                .ok_or(InternalError::InternalInvariantFailed)?,
        );
        Ok(bytes)
    }

    /// Encode for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serialize!(self)
    }

    /// Decode a stored signer.
    ///
    /// Besides the encoding, checks that the key material belongs to the
    /// member and group described by the group info.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let decoded: Result<Self> = deserialize!(bytes);
        let signer = decoded.map_err(|_| {
            InternalError::MalformedMessage("could not decode threshold signer".into())
        })?;
        let key_share = signer.key_share().map_err(|_| {
            InternalError::MalformedMessage("could not decode threshold key".into())
        })?;
        check_key_share(&signer.group_info, &key_share)
            .map_err(|e| InternalError::MalformedMessage(format!("inconsistent threshold key: {e}")))?;
        Ok(signer)
    }
}

/// The share must belong to the local member, and the announced key recorded
/// for it must be the member's own.
fn check_key_share(group_info: &GroupInfo, key_share: &KeyShare) -> Result<()> {
    let index = group_info
        .member_index(group_info.member_id())
        .ok_or(InternalError::InternalInvariantFailed)?;
    key_share.validate(index, group_info.group_size())?;
    if key_share.member_keys().get(index - 1) != Some(group_info.member_public_key()) {
        return verify_err!("key share records a different static key for this member");
    }
    Ok(())
}
