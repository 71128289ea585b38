// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Threshold signing with an existing key share, and the signature it
//! produces.

mod participant;

pub(crate) use participant::SignParticipant;

use crate::{
    errors::{InternalError, Result},
    utils::CurvePoint,
};
use k256::{
    ecdsa::{signature::hazmat::PrehashVerifier, RecoveryId, VerifyingKey},
    elliptic_curve::scalar::IsHigh,
    FieldBytes, PublicKey, Scalar,
};
use serde::{Deserialize, Serialize};

/// A low-S ECDSA signature over secp256k1 with its public key recovery id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// The x-coordinate of the nonce point, reduced modulo the group order.
    pub r: [u8; 32],
    /// The signature proof, normalized to the lower half of the group order.
    pub s: [u8; 32],
    /// Bit 0 is the parity of the nonce point's y-coordinate, bit 1 is set
    /// when its x-coordinate exceeded the group order.
    pub recovery_id: u8,
}

impl Signature {
    /// Assemble a signature from the nonce point `R` and the opened `s`.
    pub(crate) fn from_nonce_point(nonce_point: &CurvePoint, s: Scalar) -> Result<Self> {
        let (r, mut y_is_odd) = nonce_point.x_projection();
        let x_is_reduced = nonce_point.x_overflows_order();
        if bool::from(r.is_zero()) || bool::from(s.is_zero()) {
            return verify_err!("signature component is zero");
        }
        let s = if bool::from(s.is_high()) {
            y_is_odd = !y_is_odd;
            -s
        } else {
            s
        };

        let mut signature = Self {
            r: [0u8; 32],
            s: [0u8; 32],
            recovery_id: u8::from(y_is_odd) | (u8::from(x_is_reduced) << 1),
        };
        signature.r.copy_from_slice(&r.to_bytes());
        signature.s.copy_from_slice(&s.to_bytes());
        Ok(signature)
    }

    /// Convert into a [`k256::ecdsa::Signature`].
    pub fn to_ecdsa(&self) -> Result<k256::ecdsa::Signature> {
        k256::ecdsa::Signature::from_scalars(FieldBytes::from(self.r), FieldBytes::from(self.s))
            .map_err(|_| InternalError::InvalidArgument("signature scalars out of range".into()))
    }

    /// Whether this is a valid signature of `digest` under `public_key`.
    pub fn verify(&self, public_key: &PublicKey, digest: &[u8; 32]) -> bool {
        let Ok(signature) = self.to_ecdsa() else {
            return false;
        };
        VerifyingKey::from(public_key)
            .verify_prehash(digest, &signature)
            .is_ok()
    }

    /// Recover the public key that produced this signature over `digest`.
    pub fn recover(&self, digest: &[u8; 32]) -> Result<PublicKey> {
        let recovery_id = RecoveryId::from_byte(self.recovery_id)
            .ok_or_else(|| InternalError::InvalidArgument("invalid recovery id".into()))?;
        let key = VerifyingKey::recover_from_prehash(digest, &self.to_ecdsa()?, recovery_id)
            .map_err(|_| InternalError::InvalidArgument("public key recovery failed".into()))?;
        Ok(PublicKey::from(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        group::{GroupId, GroupInfo, MemberId},
        keygen::{KeyShare, KeygenParticipant},
        messages::{MessageType, SignMessageType},
        params::PreParams,
        participant::tests::{run_participants, DeliveryFilter},
    };
    use k256::SecretKey;
    use rand::{rngs::OsRng, RngCore};

    fn groups(size: usize, threshold: usize) -> Result<Vec<GroupInfo>> {
        let members: Vec<MemberId> = (0..size)
            .map(|i| MemberId::new(format!("signer-{i}").into_bytes()))
            .collect();
        members
            .iter()
            .map(|id| {
                GroupInfo::new(
                    GroupId::new(b"sign-test".to_vec()),
                    id.clone(),
                    SecretKey::random(&mut OsRng).public_key(),
                    members.clone(),
                    threshold,
                )
            })
            .collect()
    }

    fn key_shares(groups: &[GroupInfo]) -> Result<Vec<KeyShare>> {
        let mut rng = OsRng;
        let participants = groups
            .iter()
            .map(|group| {
                let params = PreParams::generate(&mut rng, group.dishonest_threshold());
                KeygenParticipant::new(&mut rng, group, params)
            })
            .collect::<Result<Vec<_>>>()?;
        let member_keys: Vec<PublicKey> =
            groups.iter().map(|g| *g.member_public_key()).collect();
        Ok(run_participants(participants, DeliveryFilter::none())?
            .into_iter()
            .map(|share| share.with_member_keys(member_keys.clone()))
            .collect())
    }

    fn signers(
        groups: &[GroupInfo],
        shares: &[KeyShare],
        digest: [u8; 32],
    ) -> Result<Vec<SignParticipant>> {
        groups
            .iter()
            .zip(shares)
            .map(|(group, share)| SignParticipant::new(group, share.clone(), digest))
            .collect()
    }

    #[test]
    fn signing_produces_valid_recoverable_signature() -> Result<()> {
        let groups = groups(3, 1)?;
        let shares = key_shares(&groups)?;
        let public_key = shares[0].group_public_key()?;

        let mut digest = [0u8; 32];
        OsRng.fill_bytes(&mut digest);

        let signatures = run_participants(signers(&groups, &shares, digest)?, DeliveryFilter::none())?;
        for signature in &signatures {
            assert_eq!(*signature, signatures[0]);
            assert!(signature.verify(&public_key, &digest));
            assert!(signature.to_ecdsa()?.normalize_s().is_none());
            assert_eq!(signature.recover(&digest)?, public_key);
        }

        let mut other_digest = digest;
        other_digest[0] ^= 0xff;
        assert!(!signatures[0].verify(&public_key, &other_digest));
        Ok(())
    }

    #[test]
    fn larger_group_signs_repeatedly() -> Result<()> {
        let groups = groups(5, 2)?;
        let shares = key_shares(&groups)?;
        let public_key = shares[0].group_public_key()?;

        for round in 0..3u8 {
            let digest = [round; 32];
            let signatures =
                run_participants(signers(&groups, &shares, digest)?, DeliveryFilter::none())?;
            assert!(signatures[0].verify(&public_key, &digest));
        }
        Ok(())
    }

    #[test]
    fn corrupted_product_aborts_signing() -> Result<()> {
        let groups = groups(3, 1)?;
        let shares = key_shares(&groups)?;
        let filter = DeliveryFilter::corrupt(MessageType::Sign(SignMessageType::R2Product));
        assert!(run_participants(signers(&groups, &shares, [7u8; 32])?, filter).is_err());
        Ok(())
    }

    #[test]
    fn corrupted_blinding_share_aborts_signing() -> Result<()> {
        let groups = groups(3, 1)?;
        let shares = key_shares(&groups)?;
        let filter = DeliveryFilter::corrupt(MessageType::Sign(SignMessageType::R1PrivateShares));
        assert!(run_participants(signers(&groups, &shares, [7u8; 32])?, filter).is_err());
        Ok(())
    }

    #[test]
    fn group_too_small_for_threshold_is_rejected() -> Result<()> {
        let groups = groups(3, 2)?;
        let shares = key_shares(&groups)?;
        assert!(SignParticipant::new(&groups[0], shares[0].clone(), [1u8; 32]).is_err());
        Ok(())
    }

    #[test]
    fn share_from_another_member_is_rejected() -> Result<()> {
        let groups = groups(3, 1)?;
        let shares = key_shares(&groups)?;
        assert!(SignParticipant::new(&groups[0], shares[1].clone(), [1u8; 32]).is_err());
        Ok(())
    }
}
