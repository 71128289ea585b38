// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{InternalError, Result},
    group::{GroupInfo, MemberId},
    keygen::{
        keygen_commit::{schnorr_transcript, KeygenCommit, KeygenDecommit},
        keyshare::KeyShare,
    },
    messages::{KeygenMessageType, MessageType, RoundMessage},
    params::PreParams,
    participant::{ParticipantState, ProcessOutcome, ProtocolParticipant},
    serialization,
    utils::{evaluate_commitments, index_scalar, CurvePoint, Polynomial},
    zkp::pisch::{PiSchInput, PiSchProof, PiSchSecret},
};
use k256::Scalar;
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, instrument};
use zeroize::Zeroize;

/// Body of a [`KeygenMessageType::R2PrivateShare`] message.
#[derive(Serialize, Deserialize)]
struct PrivateShare {
    #[serde(with = "serialization::scalar")]
    share: Scalar,
}

/// Body of a [`KeygenMessageType::R3Confirmation`] message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Confirmation {
    digest: [u8; 32],
}

/// Distributed key generation for one member of a group.
///
/// Every member of the group must take part:
/// 1. broadcast a hash commitment to its decommitment;
/// 2. once all commitments are in, broadcast the decommitment and send each
///    member its polynomial evaluated at that member's index;
/// 3. once all decommitments and shares are in and verified, derive the
///    group key and broadcast a digest of it. The run ends once every
///    member reported the same digest.
pub(crate) struct KeygenParticipant {
    group: GroupInfo,
    /// A list of all other participant identifiers participating in the
    /// protocol
    other_ids: Vec<MemberId>,
    index: usize,
    polynomial: Polynomial,
    decommit: KeygenDecommit,
    commits: HashMap<MemberId, KeygenCommit>,
    decommits: HashMap<MemberId, KeygenDecommit>,
    shares: HashMap<MemberId, Scalar>,
    confirmations: HashMap<MemberId, Confirmation>,
    output: Option<KeyShare>,
    state: ParticipantState,
}

impl std::fmt::Debug for KeygenParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeygenParticipant")
            .field("group_id", self.group.group_id())
            .field("id", self.group.member_id())
            .field("commits", &self.commits.len())
            .field("decommits", &self.decommits.len())
            .field("shares", &self.shares.len())
            .field("confirmations", &self.confirmations.len())
            .finish()
    }
}

impl Drop for KeygenParticipant {
    fn drop(&mut self) {
        self.shares.values_mut().for_each(Zeroize::zeroize);
    }
}

impl ProtocolParticipant for KeygenParticipant {
    type Output = KeyShare;

    fn protocol_name() -> &'static str {
        "keygen"
    }

    fn id(&self) -> &MemberId {
        self.group.member_id()
    }

    fn other_ids(&self) -> &[MemberId] {
        &self.other_ids
    }

    fn state(&mut self) -> &mut ParticipantState {
        &mut self.state
    }

    fn start<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<ProcessOutcome<KeyShare>> {
        let messages = run_only_once!(self.gen_round_one_msgs(rng))?;
        Ok(ProcessOutcome::Processed(messages))
    }

    /// Processes the incoming message. Produces a [`KeyShare`] once every
    /// member confirmed the same group key.
    #[instrument(skip_all, fields(group = %self.group.group_id(), from = %message.from()))]
    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &RoundMessage,
    ) -> Result<ProcessOutcome<KeyShare>> {
        match message.message_type() {
            MessageType::Keygen(KeygenMessageType::R1CommitHash) => {
                self.handle_round_one_msg(rng, message)
            }
            MessageType::Keygen(KeygenMessageType::R2Decommit) => {
                self.handle_round_two_decommit(rng, message)
            }
            MessageType::Keygen(KeygenMessageType::R2PrivateShare) => {
                self.handle_round_two_share(rng, message)
            }
            MessageType::Keygen(KeygenMessageType::R3Confirmation) => {
                self.handle_round_three_msg(message)
            }
            _ => bail!("Attempting to process a non-keygen message with a keygen participant"),
        }
    }
}

impl KeygenParticipant {
    pub(crate) fn new<R: RngCore + CryptoRng>(
        rng: &mut R,
        group: &GroupInfo,
        params: PreParams,
    ) -> Result<Self> {
        let id = group.member_id();
        let index = group
            .member_index(id)
            .ok_or(InternalError::InternalInvariantFailed)?;
        let (polynomial, commitments, precommit) = params.into_parts(group.dishonest_threshold())?;

        let proof = PiSchProof::prove_from_precommit(
            &precommit,
            &PiSchInput::new(&commitments[0]),
            &PiSchSecret::new(&polynomial.constant()),
            &mut schnorr_transcript(group.group_id(), id),
        );
        let decommit = KeygenDecommit::new(rng, group.group_id(), id, commitments, proof);

        Ok(Self {
            group: group.clone(),
            other_ids: group.other_member_ids(),
            index,
            polynomial,
            decommit,
            commits: HashMap::new(),
            decommits: HashMap::new(),
            shares: HashMap::new(),
            confirmations: HashMap::new(),
            output: None,
            state: ParticipantState::default(),
        })
    }

    fn group_size(&self) -> usize {
        self.group.group_size()
    }

    fn r1_done(&self) -> bool {
        self.commits.len() == self.group_size()
    }

    fn gen_round_one_msgs<R: RngCore + CryptoRng>(
        &mut self,
        _rng: &mut R,
    ) -> Result<Vec<RoundMessage>> {
        let com = self.decommit.commit()?;
        let _ = self.commits.insert(self.id().clone(), com.clone());
        let message =
            self.broadcast_message(MessageType::Keygen(KeygenMessageType::R1CommitHash), &com)?;
        Ok(vec![message])
    }

    fn handle_round_one_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &RoundMessage,
    ) -> Result<ProcessOutcome<KeyShare>> {
        if !message.is_broadcast() {
            return verify_err!("round one commitments must be broadcast");
        }
        let com = KeygenCommit::from_message(message)?;
        match self.commits.get(message.from()) {
            Some(existing) if *existing != com => {
                return verify_err!(format!("{} sent two different commitments", message.from()));
            }
            Some(_) => return Ok(ProcessOutcome::Incomplete),
            None => {
                let _ = self.commits.insert(message.from().clone(), com);
            }
        }

        if !self.r1_done() {
            return Ok(ProcessOutcome::Incomplete);
        }

        let messages = run_only_once!(self.gen_round_two_msgs(rng))?;
        // process any round 2 messages we may have received early
        let mut outcomes = Vec::new();
        for msg in self.fetch_messages(MessageType::Keygen(KeygenMessageType::R2Decommit)) {
            outcomes.push(self.handle_round_two_decommit(rng, &msg)?);
        }
        for msg in self.fetch_messages(MessageType::Keygen(KeygenMessageType::R2PrivateShare)) {
            outcomes.push(self.handle_round_two_share(rng, &msg)?);
        }
        Ok(ProcessOutcome::collect(outcomes)?.with_messages(messages))
    }

    fn gen_round_two_msgs<R: RngCore + CryptoRng>(
        &mut self,
        _rng: &mut R,
    ) -> Result<Vec<RoundMessage>> {
        let mut messages = vec![self.broadcast_message(
            MessageType::Keygen(KeygenMessageType::R2Decommit),
            &self.decommit,
        )?];

        let group = &self.group;
        let polynomial = &self.polynomial;
        let shares = self.direct_messages(
            MessageType::Keygen(KeygenMessageType::R2PrivateShare),
            |other_id| {
                let index = group
                    .member_index(other_id)
                    .ok_or(InternalError::InternalInvariantFailed)?;
                Ok(PrivateShare {
                    share: polynomial.evaluate(&index_scalar(index)),
                })
            },
        )?;
        messages.extend(shares);
        Ok(messages)
    }

    fn handle_round_two_decommit<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &RoundMessage,
    ) -> Result<ProcessOutcome<KeyShare>> {
        // We must receive all commitments in round 1 before we start processing
        // decommits in round 2.
        if !self.r1_done() {
            self.stash_message(message);
            return Ok(ProcessOutcome::Incomplete);
        }
        if !message.is_broadcast() {
            return verify_err!("round two decommitments must be broadcast");
        }
        if self.decommits.contains_key(message.from()) {
            return Ok(ProcessOutcome::Incomplete);
        }
        let decom = KeygenDecommit::from_message(message)?;
        let com = self
            .commits
            .get(message.from())
            .ok_or(InternalError::InternalInvariantFailed)?;
        decom.verify(
            self.group.group_id(),
            message.from(),
            com,
            self.group.dishonest_threshold(),
        )?;
        let _ = self.decommits.insert(message.from().clone(), decom);
        self.maybe_finish_round_two(rng)
    }

    fn handle_round_two_share<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &RoundMessage,
    ) -> Result<ProcessOutcome<KeyShare>> {
        if !self.r1_done() {
            self.stash_message(message);
            return Ok(ProcessOutcome::Incomplete);
        }
        if message.to() != Some(self.id()) {
            return verify_err!("round two shares must be addressed to this member");
        }
        if self.shares.contains_key(message.from()) {
            return Ok(ProcessOutcome::Incomplete);
        }
        let body: PrivateShare = message.body()?;
        let _ = self.shares.insert(message.from().clone(), body.share);
        self.maybe_finish_round_two(rng)
    }

    fn maybe_finish_round_two<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<ProcessOutcome<KeyShare>> {
        let others = self.other_ids.len();
        if self.decommits.len() < others || self.shares.len() < others {
            return Ok(ProcessOutcome::Incomplete);
        }
        let messages = run_only_once!(self.gen_round_three_msgs(rng))?;

        let mut outcomes = Vec::new();
        for msg in self.fetch_messages(MessageType::Keygen(KeygenMessageType::R3Confirmation)) {
            outcomes.push(self.handle_round_three_msg(&msg)?);
        }
        Ok(ProcessOutcome::collect(outcomes)?.with_messages(messages))
    }

    /// Verify every received share, derive this member's key share and
    /// broadcast a digest of the public key material.
    fn gen_round_three_msgs<R: RngCore + CryptoRng>(
        &mut self,
        _rng: &mut R,
    ) -> Result<Vec<RoundMessage>> {
        let my_x = index_scalar(self.index);
        let mut private_share = self.polynomial.evaluate(&my_x);
        for (sender, share) in &self.shares {
            let decom = self
                .decommits
                .get(sender)
                .ok_or(InternalError::InternalInvariantFailed)?;
            if evaluate_commitments(&decom.coefficient_commitments, &my_x)
                != CurvePoint::base_mul(share)
            {
                error!("Share from {sender} does not match its commitments");
                return verify_err!(format!("inconsistent share from {sender}"));
            }
            private_share += share;
        }

        // Commitments of every member, in group order.
        let mut all_commitments = Vec::with_capacity(self.group_size());
        for member in self.group.group_member_ids() {
            let decom = if member == self.id() {
                &self.decommit
            } else {
                self.decommits
                    .get(member)
                    .ok_or(InternalError::InternalInvariantFailed)?
            };
            all_commitments.push(&decom.coefficient_commitments);
        }

        let public_key: CurvePoint = all_commitments
            .iter()
            .map(|commitments| commitments[0])
            .sum();
        let verification_shares: Vec<CurvePoint> = (1..=self.group_size())
            .map(|index| {
                let x = index_scalar(index);
                all_commitments
                    .iter()
                    .map(|commitments| evaluate_commitments(commitments, &x))
                    .sum()
            })
            .collect();

        let key_share = KeyShare::new(private_share, public_key, verification_shares);
        private_share.zeroize();

        let threshold_set: Vec<usize> = (1..=self.group.dishonest_threshold() + 1).collect();
        if key_share.public_key_from_shares(&threshold_set)? != public_key {
            return verify_err!("verification shares do not interpolate to the group key");
        }

        let confirmation = confirmation_digest(&self.group, &key_share)?;
        let _ = self.confirmations.insert(self.id().clone(), confirmation);
        self.output = Some(key_share);
        debug!("Derived key share, confirming group key");

        let message = self.broadcast_message(
            MessageType::Keygen(KeygenMessageType::R3Confirmation),
            &confirmation,
        )?;
        Ok(vec![message])
    }

    fn handle_round_three_msg(&mut self, message: &RoundMessage) -> Result<ProcessOutcome<KeyShare>> {
        let Some(own) = self.confirmations.get(self.id()).copied() else {
            self.stash_message(message);
            return Ok(ProcessOutcome::Incomplete);
        };
        if !message.is_broadcast() {
            return verify_err!("round three confirmations must be broadcast");
        }
        let confirmation: Confirmation = message.body()?;
        if confirmation != own {
            error!("{} derived a different group key", message.from());
            return verify_err!(format!("{} derived a different group key", message.from()));
        }
        let _ = self
            .confirmations
            .insert(message.from().clone(), confirmation);

        if self.confirmations.len() < self.group_size() {
            return Ok(ProcessOutcome::Incomplete);
        }
        match self.output.take() {
            Some(output) => Ok(ProcessOutcome::Terminated(output)),
            None => Ok(ProcessOutcome::Incomplete),
        }
    }
}

fn confirmation_digest(group: &GroupInfo, key_share: &KeyShare) -> Result<Confirmation> {
    let mut transcript = Transcript::new(b"KeyGenR3");
    transcript.append_message(b"group", group.group_id().as_bytes());
    transcript.append_message(b"public key", &key_share.public_key().to_bytes());
    transcript.append_message(b"verification shares", &serialize!(&key_share.verification_shares())?);
    let mut digest = [0u8; 32];
    transcript.challenge_bytes(b"confirmation", &mut digest);
    Ok(Confirmation { digest })
}
