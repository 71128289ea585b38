// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{InternalError, Result},
    serialization,
    utils::{index_scalar, lagrange_at_zero, CurvePoint},
};
use k256::{PublicKey, Scalar};
use serde::{Deserialize, Serialize};
use tracing::error;
use zeroize::Zeroize;

/// One member's share of a group signing key, plus the public material every
/// member derived during key generation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct KeyShare {
    #[serde(with = "serialization::scalar")]
    private_share: Scalar,
    public_key: CurvePoint,
    /// `g^{x_j}` for every member `j`, in group order.
    verification_shares: Vec<CurvePoint>,
    /// Static public keys announced during formation, in group order.
    #[serde(with = "serialization::public_keys")]
    member_keys: Vec<PublicKey>,
}

impl std::fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyShare")
            .field("private_share", &"[redacted]")
            .field("public_key", &self.public_key)
            .field("verification_shares", &self.verification_shares.len())
            .finish()
    }
}

impl Drop for KeyShare {
    fn drop(&mut self) {
        self.private_share.zeroize();
    }
}

impl KeyShare {
    pub(crate) fn new(
        private_share: Scalar,
        public_key: CurvePoint,
        verification_shares: Vec<CurvePoint>,
    ) -> Self {
        Self {
            private_share,
            public_key,
            verification_shares,
            member_keys: Vec::new(),
        }
    }

    pub(crate) fn with_member_keys(mut self, member_keys: Vec<PublicKey>) -> Self {
        self.member_keys = member_keys;
        self
    }

    pub(crate) fn private_share(&self) -> &Scalar {
        &self.private_share
    }

    pub(crate) fn public_key(&self) -> &CurvePoint {
        &self.public_key
    }

    pub(crate) fn verification_shares(&self) -> &[CurvePoint] {
        &self.verification_shares
    }

    pub(crate) fn member_keys(&self) -> &[PublicKey] {
        &self.member_keys
    }

    /// Check the share is usable by the member at 1-based `index` in a group
    /// of `group_size`.
    pub(crate) fn validate(&self, index: usize, group_size: usize) -> Result<()> {
        if self.verification_shares.len() != group_size || self.member_keys.len() != group_size {
            error!(
                "Key share describes {} members and {} keys, group has {group_size}",
                self.verification_shares.len(),
                self.member_keys.len()
            );
            return Err(InternalError::InternalInvariantFailed);
        }
        let own = index
            .checked_sub(1)
            .and_then(|position| self.verification_shares.get(position))
            .ok_or(InternalError::InternalInvariantFailed)?;
        if CurvePoint::base_mul(&self.private_share) != *own {
            error!("Private share does not match its verification share");
            return Err(InternalError::InternalInvariantFailed);
        }
        if self.public_key == CurvePoint::IDENTITY {
            error!("Group public key is the identity");
            return Err(InternalError::InternalInvariantFailed);
        }
        Ok(())
    }

    /// Reconstruct the group public key from the verification shares of the
    /// members at the given 1-based indices.
    pub(crate) fn public_key_from_shares(&self, indices: &[usize]) -> Result<CurvePoint> {
        let xs: Vec<Scalar> = indices.iter().map(|i| index_scalar(*i)).collect();
        let mut total = CurvePoint::IDENTITY;
        for (position, index) in indices.iter().enumerate() {
            let share = index
                .checked_sub(1)
                .and_then(|p| self.verification_shares.get(p))
                .ok_or(InternalError::InternalInvariantFailed)?;
            let lambda = lagrange_at_zero(&xs, position)?;
            total = total + *share * &lambda;
        }
        Ok(total)
    }

    /// SEC1 public key of the whole group.
    pub(crate) fn group_public_key(&self) -> Result<PublicKey> {
        PublicKey::from_affine(self.public_key.0.to_affine())
            .map_err(|_| InternalError::InternalInvariantFailed)
    }
}

/// Open a sharing from `(index, share)` pairs.
#[cfg(test)]
pub(crate) fn reconstruct_secret(shares: &[(usize, Scalar)]) -> Result<Scalar> {
    let points: Vec<(Scalar, Scalar)> = shares
        .iter()
        .map(|(index, share)| (index_scalar(*index), *share))
        .collect();
    crate::utils::interpolate_at_zero(&points)
}
