// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::Result,
    group::{GroupId, MemberId},
    messages::{KeygenMessageType, MessageType, RoundMessage},
    utils::CurvePoint,
    zkp::{
        pisch::{PiSchInput, PiSchProof},
        Proof,
    },
};
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub(crate) struct KeygenCommit {
    hash: [u8; 32],
}

impl KeygenCommit {
    pub(crate) fn from_message(message: &RoundMessage) -> Result<Self> {
        message.check_type(MessageType::Keygen(KeygenMessageType::R1CommitHash))?;
        message.body()
    }
}

/// The opening of a [`KeygenCommit`]: Feldman commitments to the sender's
/// polynomial and a proof of knowledge of its constant term.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct KeygenDecommit {
    pub group_id: GroupId,
    pub sender: MemberId,
    pub u_i: [u8; 32],
    pub coefficient_commitments: Vec<CurvePoint>,
    pub proof: PiSchProof,
}

/// Transcript binding a Schnorr proof to the group and the prover.
pub(crate) fn schnorr_transcript(group_id: &GroupId, sender: &MemberId) -> Transcript {
    let mut transcript = Transcript::new(b"keygen schnorr");
    transcript.append_message(b"group", group_id.as_bytes());
    transcript.append_message(b"sender", sender.as_bytes());
    transcript
}

impl KeygenDecommit {
    pub(crate) fn new<R: RngCore + CryptoRng>(
        rng: &mut R,
        group_id: &GroupId,
        sender: &MemberId,
        coefficient_commitments: Vec<CurvePoint>,
        proof: PiSchProof,
    ) -> Self {
        let mut u_i = [0u8; 32];
        rng.fill_bytes(u_i.as_mut_slice());
        Self {
            group_id: group_id.clone(),
            sender: sender.clone(),
            u_i,
            coefficient_commitments,
            proof,
        }
    }

    pub(crate) fn from_message(message: &RoundMessage) -> Result<Self> {
        message.check_type(MessageType::Keygen(KeygenMessageType::R2Decommit))?;
        message.body()
    }

    /// `g^{f(0)}`, the sender's contribution to the group public key.
    pub(crate) fn constant_commitment(&self) -> CurvePoint {
        self.coefficient_commitments
            .first()
            .copied()
            .unwrap_or(CurvePoint::IDENTITY)
    }

    pub(crate) fn commit(&self) -> Result<KeygenCommit> {
        let mut transcript = Transcript::new(b"KeyGenR1");
        transcript.append_message(b"decom", &serialize!(&self)?);
        let mut hash = [0u8; 32];
        transcript.challenge_bytes(b"hashing r1", &mut hash);
        Ok(KeygenCommit { hash })
    }

    /// Check the decommitment opens `com`, was produced by `sender` for
    /// `group_id`, carries `threshold + 1` commitments and a valid proof.
    pub(crate) fn verify(
        &self,
        group_id: &GroupId,
        sender: &MemberId,
        com: &KeygenCommit,
        threshold: usize,
    ) -> Result<()> {
        let mut decom = self.clone();
        decom.group_id = group_id.clone();
        decom.sender = sender.clone();
        if decom.commit()? != *com {
            return verify_err!("Decommitment Check Failed!");
        }
        if self.coefficient_commitments.len() != threshold + 1 {
            return verify_err!(format!(
                "expected {} coefficient commitments, got {}",
                threshold + 1,
                self.coefficient_commitments.len()
            ));
        }
        let constant = self.constant_commitment();
        if constant == CurvePoint::IDENTITY {
            return verify_err!("constant term commitment is the identity");
        }
        let mut transcript = schnorr_transcript(group_id, sender);
        self.proof.verify(&PiSchInput::new(&constant), &mut transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        utils::Polynomial,
        zkp::pisch::{PiSchPrecommit, PiSchSecret},
    };
    use rand::rngs::OsRng;

    fn decommit(group_id: &GroupId, sender: &MemberId, threshold: usize) -> KeygenDecommit {
        let mut rng = OsRng;
        let polynomial = Polynomial::random(&mut rng, threshold);
        let commitments = polynomial.commit();
        let proof = PiSchProof::prove_from_precommit(
            &PiSchPrecommit::generate(&mut rng),
            &PiSchInput::new(&commitments[0]),
            &PiSchSecret::new(&polynomial.constant()),
            &mut schnorr_transcript(group_id, sender),
        );
        KeygenDecommit::new(&mut rng, group_id, sender, commitments, proof)
    }

    #[test]
    fn decommitment_opens_its_commitment() -> Result<()> {
        let group_id = GroupId::new(b"G1".to_vec());
        let sender = MemberId::new(b"A".to_vec());
        let decom = decommit(&group_id, &sender, 2);
        let com = decom.commit()?;
        decom.verify(&group_id, &sender, &com, 2)
    }

    #[test]
    fn decommitment_is_bound_to_sender_and_threshold() -> Result<()> {
        let group_id = GroupId::new(b"G1".to_vec());
        let sender = MemberId::new(b"A".to_vec());
        let decom = decommit(&group_id, &sender, 2);
        let com = decom.commit()?;

        assert!(decom
            .verify(&group_id, &MemberId::new(b"B".to_vec()), &com, 2)
            .is_err());
        assert!(decom
            .verify(&GroupId::new(b"G2".to_vec()), &sender, &com, 2)
            .is_err());
        assert!(decom.verify(&group_id, &sender, &com, 1).is_err());
        Ok(())
    }

    #[test]
    fn tampered_commitments_fail() -> Result<()> {
        let group_id = GroupId::new(b"G1".to_vec());
        let sender = MemberId::new(b"A".to_vec());
        let decom = decommit(&group_id, &sender, 1);
        let com = decom.commit()?;

        let mut tampered = decom.clone();
        tampered.coefficient_commitments[1] = CurvePoint::GENERATOR;
        assert!(tampered.verify(&group_id, &sender, &com, 1).is_err());
        Ok(())
    }
}
