// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{InternalError, Result},
    group::{GroupInfo, MemberId},
    keygen::KeyShare,
    messages::{MessageType, RoundMessage, SignMessageType},
    participant::{ParticipantState, ProcessOutcome, ProtocolParticipant},
    serialization,
    sign::Signature,
    utils::{
        digest_to_scalar, evaluate_commitments, index_scalar, interpolate_at_zero, CurvePoint,
        Polynomial,
    },
};
use k256::Scalar;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, instrument};
use zeroize::Zeroize;

/// Body of a [`SignMessageType::R1PrivateShares`] message: the sender's
/// nonce, blinding and zero-sharing polynomials at the recipient's index.
#[derive(Clone, Serialize, Deserialize)]
struct NonceShares {
    #[serde(with = "serialization::scalar")]
    k: Scalar,
    #[serde(with = "serialization::scalar")]
    a: Scalar,
    #[serde(with = "serialization::scalar")]
    b: Scalar,
    #[serde(with = "serialization::scalar")]
    c: Scalar,
}

impl Zeroize for NonceShares {
    fn zeroize(&mut self) {
        self.k.zeroize();
        self.a.zeroize();
        self.b.zeroize();
        self.c.zeroize();
    }
}

#[derive(Serialize, Deserialize)]
struct ScalarShare {
    #[serde(with = "serialization::scalar")]
    value: Scalar,
}

/// Accumulated nonce material once round one is complete.
struct RoundOneOutput {
    k: Scalar,
    c: Scalar,
    /// `a * G`, where `a` is the joint blinding value.
    blinded_nonce_point: CurvePoint,
}

impl Drop for RoundOneOutput {
    fn drop(&mut self) {
        self.k.zeroize();
        self.c.zeroize();
    }
}

/// Threshold ECDSA signing for one member of a group.
///
/// Requires `n >= 2t + 1` and every member of the group:
/// 1. jointly share a nonce `k` and a blinding value `a` (degree `t`) and two
///    zero values `b`, `c` (degree `2t`), broadcasting commitments to `a`;
/// 2. reveal `k_i * a_i + b_i` and interpolate `mu = k * a`, which gives
///    `R = mu^-1 * (a * G) = k^-1 * G`;
/// 3. reveal `s_i = k_i * (m + r * x_i) + c_i` and interpolate `s`.
///
/// The resulting signature is checked against the group key before it is
/// returned.
pub(crate) struct SignParticipant {
    group: GroupInfo,
    other_ids: Vec<MemberId>,
    key_share: KeyShare,
    digest: [u8; 32],
    nonce_commitments: HashMap<MemberId, Vec<CurvePoint>>,
    nonce_shares: HashMap<MemberId, NonceShares>,
    round_one: Option<RoundOneOutput>,
    products: HashMap<MemberId, Scalar>,
    signature_shares: HashMap<MemberId, Scalar>,
    finished: bool,
    state: ParticipantState,
}

impl std::fmt::Debug for SignParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignParticipant")
            .field("group_id", self.group.group_id())
            .field("id", self.group.member_id())
            .field("digest", &hex::encode(self.digest))
            .field("products", &self.products.len())
            .field("signature_shares", &self.signature_shares.len())
            .finish()
    }
}

impl Drop for SignParticipant {
    fn drop(&mut self) {
        self.nonce_shares.values_mut().for_each(Zeroize::zeroize);
    }
}

impl ProtocolParticipant for SignParticipant {
    type Output = Signature;

    fn protocol_name() -> &'static str {
        "sign"
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

    fn start<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<ProcessOutcome<Signature>> {
        let messages = run_only_once!(self.gen_round_one_msgs(rng))?;
        Ok(ProcessOutcome::Processed(messages))
    }

    #[instrument(skip_all, fields(group = %self.group.group_id(), from = %message.from()))]
    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &RoundMessage,
    ) -> Result<ProcessOutcome<Signature>> {
        if self.finished {
            return Ok(ProcessOutcome::Incomplete);
        }
        match message.message_type() {
            MessageType::Sign(SignMessageType::R1NonceCommitments) => {
                self.handle_nonce_commitments(rng, message)
            }
            MessageType::Sign(SignMessageType::R1PrivateShares) => {
                self.handle_nonce_shares(rng, message)
            }
            MessageType::Sign(SignMessageType::R2Product) => self.handle_round_two_msg(rng, message),
            MessageType::Sign(SignMessageType::R3SignatureShare) => {
                self.handle_round_three_msg(message)
            }
            _ => bail!("Attempting to process a non-sign message with a sign participant"),
        }
    }
}

impl SignParticipant {
    pub(crate) fn new(group: &GroupInfo, key_share: KeyShare, digest: [u8; 32]) -> Result<Self> {
        let n = group.group_size();
        let t = group.dishonest_threshold();
        if n < 2 * t + 1 {
            return bail!("signing needs at least {} members, group has {n}", 2 * t + 1);
        }
        let index = group
            .member_index(group.member_id())
            .ok_or(InternalError::InternalInvariantFailed)?;
        key_share.validate(index, n)?;

        Ok(Self {
            group: group.clone(),
            other_ids: group.other_member_ids(),
            key_share,
            digest,
            nonce_commitments: HashMap::new(),
            nonce_shares: HashMap::new(),
            round_one: None,
            products: HashMap::new(),
            signature_shares: HashMap::new(),
            finished: false,
            state: ParticipantState::default(),
        })
    }

    fn group_size(&self) -> usize {
        self.group.group_size()
    }

    fn index_of(&self, member: &MemberId) -> Result<usize> {
        self.group
            .member_index(member)
            .ok_or(InternalError::InternalInvariantFailed)
    }

    /// Interpolate the values revealed by every member at zero.
    fn open(&self, values: &HashMap<MemberId, Scalar>) -> Result<Scalar> {
        let points = values
            .iter()
            .map(|(member, value)| Ok((index_scalar(self.index_of(member)?), *value)))
            .collect::<Result<Vec<_>>>()?;
        interpolate_at_zero(&points)
    }

    fn gen_round_one_msgs<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<Vec<RoundMessage>> {
        let t = self.group.dishonest_threshold();
        let f = Polynomial::random(rng, t);
        let g = Polynomial::random(rng, t);
        let h = Polynomial::random_without_constant(rng, 2 * t);
        let z = Polynomial::random_without_constant(rng, 2 * t);
        let evaluate = |index: usize| {
            let x = index_scalar(index);
            NonceShares {
                k: f.evaluate(&x),
                a: g.evaluate(&x),
                b: h.evaluate(&x),
                c: z.evaluate(&x),
            }
        };

        let commitments = g.commit();
        let own_index = self.index_of(self.id())?;
        let _ = self
            .nonce_commitments
            .insert(self.id().clone(), commitments.clone());
        let _ = self
            .nonce_shares
            .insert(self.id().clone(), evaluate(own_index));

        let mut messages = vec![self.broadcast_message(
            MessageType::Sign(SignMessageType::R1NonceCommitments),
            &commitments,
        )?];
        let group = &self.group;
        messages.extend(self.direct_messages(
            MessageType::Sign(SignMessageType::R1PrivateShares),
            |other_id| {
                let index = group
                    .member_index(other_id)
                    .ok_or(InternalError::InternalInvariantFailed)?;
                Ok(evaluate(index))
            },
        )?);
        Ok(messages)
    }

    fn handle_nonce_commitments<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &RoundMessage,
    ) -> Result<ProcessOutcome<Signature>> {
        if !message.is_broadcast() {
            return verify_err!("nonce commitments must be broadcast");
        }
        if self.nonce_commitments.contains_key(message.from()) {
            return Ok(ProcessOutcome::Incomplete);
        }
        let commitments: Vec<CurvePoint> = message.body()?;
        if commitments.len() != self.group.dishonest_threshold() + 1 {
            return verify_err!(format!(
                "{} committed to {} coefficients",
                message.from(),
                commitments.len()
            ));
        }
        let _ = self
            .nonce_commitments
            .insert(message.from().clone(), commitments);
        self.maybe_finish_round_one(rng)
    }

    fn handle_nonce_shares<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &RoundMessage,
    ) -> Result<ProcessOutcome<Signature>> {
        if message.to() != Some(self.id()) {
            return verify_err!("nonce shares must be addressed to this member");
        }
        if self.nonce_shares.contains_key(message.from()) {
            return Ok(ProcessOutcome::Incomplete);
        }
        let shares: NonceShares = message.body()?;
        let _ = self.nonce_shares.insert(message.from().clone(), shares);
        self.maybe_finish_round_one(rng)
    }

    fn maybe_finish_round_one<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<ProcessOutcome<Signature>> {
        let n = self.group_size();
        if self.nonce_commitments.len() < n || self.nonce_shares.len() < n {
            return Ok(ProcessOutcome::Incomplete);
        }
        let messages = run_only_once!(self.gen_round_two_msgs(rng))?;

        let mut outcomes = Vec::new();
        for msg in self.fetch_messages(MessageType::Sign(SignMessageType::R2Product)) {
            outcomes.push(self.handle_round_two_msg(rng, &msg)?);
        }
        Ok(ProcessOutcome::collect(outcomes)?.with_messages(messages))
    }

    /// Verify the blinding shares and reveal `k_i * a_i + b_i`.
    fn gen_round_two_msgs<R: RngCore + CryptoRng>(
        &mut self,
        _rng: &mut R,
    ) -> Result<Vec<RoundMessage>> {
        let my_x = index_scalar(self.index_of(self.id())?);
        let (mut k, mut a, mut b, mut c) = (Scalar::ZERO, Scalar::ZERO, Scalar::ZERO, Scalar::ZERO);
        for (sender, shares) in &self.nonce_shares {
            let commitments = self
                .nonce_commitments
                .get(sender)
                .ok_or(InternalError::InternalInvariantFailed)?;
            if evaluate_commitments(commitments, &my_x) != CurvePoint::base_mul(&shares.a) {
                error!("Blinding share from {sender} does not match its commitments");
                return verify_err!(format!("inconsistent blinding share from {sender}"));
            }
            k += shares.k;
            a += shares.a;
            b += shares.b;
            c += shares.c;
        }
        let blinded_nonce_point = self
            .nonce_commitments
            .values()
            .map(|commitments| commitments[0])
            .sum();

        let product = k * a + b;
        a.zeroize();
        b.zeroize();
        let _ = self.products.insert(self.id().clone(), product);
        self.round_one = Some(RoundOneOutput {
            k,
            c,
            blinded_nonce_point,
        });
        k.zeroize();
        c.zeroize();

        let message = self.broadcast_message(
            MessageType::Sign(SignMessageType::R2Product),
            &ScalarShare { value: product },
        )?;
        Ok(vec![message])
    }

    fn handle_round_two_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &RoundMessage,
    ) -> Result<ProcessOutcome<Signature>> {
        if self.round_one.is_none() {
            self.stash_message(message);
            return Ok(ProcessOutcome::Incomplete);
        }
        if !message.is_broadcast() {
            return verify_err!("nonce products must be broadcast");
        }
        if self.products.contains_key(message.from()) {
            return Ok(ProcessOutcome::Incomplete);
        }
        let share: ScalarShare = message.body()?;
        let _ = self.products.insert(message.from().clone(), share.value);
        if self.products.len() < self.group_size() {
            return Ok(ProcessOutcome::Incomplete);
        }

        let messages = run_only_once!(self.gen_round_three_msgs(rng))?;
        let mut outcomes = Vec::new();
        for msg in self.fetch_messages(MessageType::Sign(SignMessageType::R3SignatureShare)) {
            outcomes.push(self.handle_round_three_msg(&msg)?);
        }
        Ok(ProcessOutcome::collect(outcomes)?.with_messages(messages))
    }

    /// Open `k * a`, derive `R` and reveal this member's signature share.
    fn gen_round_three_msgs<R: RngCore + CryptoRng>(
        &mut self,
        _rng: &mut R,
    ) -> Result<Vec<RoundMessage>> {
        let mu = self.open(&self.products)?;
        let mu_inverse: Option<Scalar> = mu.invert().into();
        let Some(mu_inverse) = mu_inverse else {
            return verify_err!("nonce product opened to zero");
        };
        let round_one = self
            .round_one
            .as_ref()
            .ok_or(InternalError::InternalInvariantFailed)?;
        let nonce_point = round_one.blinded_nonce_point * &mu_inverse;
        let (r, _) = nonce_point.x_projection();
        if bool::from(r.is_zero()) {
            return verify_err!("nonce point has a zero x-coordinate");
        }

        let m = digest_to_scalar(&self.digest);
        let s_i = round_one.k * (m + r * self.key_share.private_share()) + round_one.c;
        let _ = self.signature_shares.insert(self.id().clone(), s_i);

        let message = self.broadcast_message(
            MessageType::Sign(SignMessageType::R3SignatureShare),
            &ScalarShare { value: s_i },
        )?;
        Ok(vec![message])
    }

    fn handle_round_three_msg(&mut self, message: &RoundMessage) -> Result<ProcessOutcome<Signature>> {
        if !self.signature_shares.contains_key(self.id()) {
            self.stash_message(message);
            return Ok(ProcessOutcome::Incomplete);
        }
        if !message.is_broadcast() {
            return verify_err!("signature shares must be broadcast");
        }
        if self.signature_shares.contains_key(message.from()) {
            return Ok(ProcessOutcome::Incomplete);
        }
        let share: ScalarShare = message.body()?;
        let _ = self
            .signature_shares
            .insert(message.from().clone(), share.value);
        if self.signature_shares.len() < self.group_size() {
            return Ok(ProcessOutcome::Incomplete);
        }

        let signature = self.finish()?;
        self.finished = true;
        debug!("Signature assembled and verified");
        Ok(ProcessOutcome::Terminated(signature))
    }

    fn finish(&self) -> Result<Signature> {
        let round_one = self
            .round_one
            .as_ref()
            .ok_or(InternalError::InternalInvariantFailed)?;
        let mu = self.open(&self.products)?;
        let mu_inverse: Option<Scalar> = mu.invert().into();
        let mu_inverse = mu_inverse.ok_or(InternalError::InternalInvariantFailed)?;
        let nonce_point = round_one.blinded_nonce_point * &mu_inverse;

        let s = self.open(&self.signature_shares)?;
        let signature = Signature::from_nonce_point(&nonce_point, s)?;
        let public_key = self.key_share.group_public_key()?;
        if !signature.verify(&public_key, &self.digest) {
            error!("Assembled signature does not verify under the group key");
            return verify_err!("assembled signature does not verify");
        }
        Ok(signature)
    }
}
