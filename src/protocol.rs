// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The signing engine.
//!
//! A protocol run owns one subscription to a named channel and moves through
//! its phases strictly in order:
//!
//! - group formation: `Idle -> Joining -> Announcing -> KeyGenerating`,
//!   ending in `Completed` with a new [`ThresholdSigner`] or in `Failed`;
//! - signing: `Idle -> Signing`, ending in `Completed` with a [`Signature`]
//!   or in `Failed`.
//!
//! Join and announce complete as soon as `group size - dishonest threshold`
//! members took part. Messages that belong to a later phase are kept until
//! that phase starts; messages for a phase that already completed are
//! dropped. Direct protocol messages are sealed with the pairwise key shared
//! with the recipient; a direct message for a member whose key is not known
//! yet waits until its announcement arrives.
//!
//! Each run has its own [`SessionId`] and channel. Messages stamped with
//! another session are dropped, and a run discards its inbox when it ends.
//!
//! Key generation and signing wait for every member of the group, not just a
//! quorum. One offline member blocks key generation and signing for the whole
//! group until it comes back.
//!
//! Signing runs that use the same key share may overlap. Their participant
//! steps take the share's [`ShareLock`] in turn; no lock is held while a run
//! waits on the network, so members that start requests in different orders
//! still meet.

use crate::{
    config::ProtocolConfig,
    errors::{InternalError, Result},
    group::{GroupId, GroupInfo, MemberId},
    keygen::{KeyShare, KeygenParticipant},
    messages::{
        AnnounceMessage, JoinMessage, Message, RoundMessage, SessionId, TssProtocolMessage,
    },
    net::BroadcastChannel,
    pairwise::PairwiseChannels,
    params::PreParams,
    participant::{ProcessOutcome, ProtocolParticipant},
    sign::{SignParticipant, Signature},
    signer::ThresholdSigner,
};
use k256::{PublicKey, SecretKey};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    time::{timeout, timeout_at, Instant},
};
use tracing::{debug, info, instrument, trace, warn};

/// Phase of a single protocol run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProtocolState {
    Idle,
    Joining,
    Announcing,
    KeyGenerating,
    Signing,
    Completed,
    Failed,
}

/// Name of the channel used to form `group_id`.
pub(crate) fn formation_channel(group_id: &GroupId) -> String {
    group_id.to_string()
}

/// Name of the channel used to answer signing request `request_id` for
/// `digest` with the key of `group_id`.
pub(crate) fn signing_channel(group_id: &GroupId, digest: &[u8; 32], request_id: u64) -> String {
    format!("{group_id}-{}-{request_id}", hex::encode(digest))
}

/// Serializes the participant steps of every signing run that uses one key
/// share.
#[derive(Debug, Default)]
pub(crate) struct ShareLock(Mutex<()>);

impl ShareLock {
    /// Run `step` while holding the lock.
    pub(crate) fn step<T>(&self, step: impl FnOnce() -> Result<T>) -> Result<T> {
        let _held = self.0.lock();
        step()
    }
}

fn exclusive<T>(lock: Option<&ShareLock>, step: impl FnOnce() -> Result<T>) -> Result<T> {
    match lock {
        Some(lock) => lock.step(step),
        None => step(),
    }
}

/// Check that `digest` is exactly 32 bytes.
pub(crate) fn parse_digest(digest: &[u8]) -> Result<[u8; 32]> {
    digest
        .try_into()
        .map_err(|_| InternalError::InvalidDigest(digest.len()))
}

/// Form `group` and produce this member's signer.
///
/// Consumes `params`; nothing produced by a failed run outlives it.
/// Failures are reported as [`InternalError::InsufficientAnnouncements`] or
/// [`InternalError::KeyGenerationAborted`].
#[instrument(
    skip_all,
    fields(group = %group.group_id(), member = %group.member_id()),
    err(Display)
)]
pub(crate) async fn generate_signer(
    group: &GroupInfo,
    static_key: &SecretKey,
    params: PreParams,
    channel: Arc<dyn BroadcastChannel>,
    config: &ProtocolConfig,
) -> Result<ThresholdSigner> {
    let session = SessionId::formation(group.group_id());
    let run = run_formation(group, session, static_key, params, channel, config);
    match timeout(config.formation_deadline(), run).await {
        Ok(Ok(signer)) => Ok(signer),
        Ok(Err(e @ InternalError::InsufficientAnnouncements { .. }))
        | Ok(Err(e @ InternalError::KeyGenerationAborted(_))) => Err(e),
        Ok(Err(e)) => Err(InternalError::KeyGenerationAborted(e.to_string())),
        Err(_) => Err(InternalError::KeyGenerationAborted(
            "formation deadline exceeded".into(),
        )),
    }
}

/// Sign `digest` together with the other members of the signer's group, as
/// the run answering signing request `request_id`.
///
/// A digest that is not 32 bytes is rejected before anything is sent. Run
/// failures are reported as [`InternalError::SigningAborted`].
#[instrument(
    skip_all,
    fields(
        group = %signer.group_id(),
        digest = %hex::encode(digest),
        request_id = request_id
    ),
    err(Display)
)]
pub(crate) async fn calculate_signature(
    signer: &ThresholdSigner,
    digest: &[u8],
    request_id: u64,
    static_key: &SecretKey,
    channel: Arc<dyn BroadcastChannel>,
    share_lock: &ShareLock,
    config: &ProtocolConfig,
) -> Result<Signature> {
    let digest = parse_digest(digest)?;

    let session = SessionId::signing(signer.group_id(), &digest, request_id);
    let run = run_signing(signer, digest, session, static_key, channel, share_lock, config);
    match timeout(config.signing_timeout(), run).await {
        Ok(Ok(signature)) => Ok(signature),
        Ok(Err(e @ InternalError::SigningAborted(_))) => Err(e),
        Ok(Err(e)) => Err(InternalError::SigningAborted(e.to_string())),
        Err(_) => Err(InternalError::SigningAborted(
            "signing deadline exceeded".into(),
        )),
    }
}

async fn run_formation(
    group: &GroupInfo,
    session_id: SessionId,
    static_key: &SecretKey,
    params: PreParams,
    channel: Arc<dyn BroadcastChannel>,
    config: &ProtocolConfig,
) -> Result<ThresholdSigner> {
    let mut session = Session::open(group, session_id, static_key, channel, None).await?;
    let result = session.form(params, config).await;
    session.finish(&result);
    result
}

async fn run_signing(
    signer: &ThresholdSigner,
    digest: [u8; 32],
    session_id: SessionId,
    static_key: &SecretKey,
    channel: Arc<dyn BroadcastChannel>,
    share_lock: &ShareLock,
    config: &ProtocolConfig,
) -> Result<Signature> {
    let group = signer.group_info();
    let key_share = share_lock.step(|| signer.key_share())?;
    let mut session =
        Session::open(group, session_id, static_key, channel, Some(share_lock)).await?;
    // Every member's key was fixed when the group formed.
    for (member, key) in group.group_member_ids().iter().zip(key_share.member_keys()) {
        if member != group.member_id() {
            let _ = session.record_key(member, key);
        }
    }
    let result = session.sign(key_share, digest, config).await;
    session.finish(&result);
    result
}

/// State of one protocol run on one member.
struct Session<'a> {
    group: &'a GroupInfo,
    session_id: SessionId,
    channel: Arc<dyn BroadcastChannel>,
    /// Taken around participant steps of signing runs.
    share_lock: Option<&'a ShareLock>,
    inbox: UnboundedReceiver<Vec<u8>>,
    state: ProtocolState,
    pairwise: PairwiseChannels,
    /// Static keys of the members that announced themselves.
    directory: HashMap<MemberId, PublicKey>,
    /// Messages for a later phase.
    stash: VecDeque<Message>,
    /// Stashed messages handed back to the current phase.
    replay: VecDeque<Message>,
    /// Direct messages waiting for the recipient's key.
    outgoing: Vec<RoundMessage>,
    /// Direct messages waiting for the sender's key.
    held: Vec<RoundMessage>,
    rng: OsRng,
}

impl<'a> Session<'a> {
    async fn open(
        group: &'a GroupInfo,
        session_id: SessionId,
        static_key: &SecretKey,
        channel: Arc<dyn BroadcastChannel>,
        share_lock: Option<&'a ShareLock>,
    ) -> Result<Session<'a>> {
        if static_key.public_key() != *group.member_public_key() {
            return arg_err!("static key does not match the member public key");
        }
        let inbox = channel.subscribe().await?;
        debug!("Subscribed to channel {} for {session_id:?}", channel.name());
        Ok(Self {
            group,
            session_id,
            channel,
            share_lock,
            inbox,
            state: ProtocolState::Idle,
            pairwise: PairwiseChannels::new(group.member_id(), static_key),
            directory: HashMap::from([(group.member_id().clone(), *group.member_public_key())]),
            stash: VecDeque::new(),
            replay: VecDeque::new(),
            outgoing: Vec::new(),
            held: Vec::new(),
            rng: OsRng,
        })
    }

    fn me(&self) -> &MemberId {
        self.group.member_id()
    }

    fn transition(&mut self, next: ProtocolState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
        // Unconsumed replays stay ahead of newer stashed messages.
        let stashed = std::mem::take(&mut self.stash);
        self.replay.extend(stashed);
    }

    fn finish<T>(&mut self, result: &Result<T>) {
        match result {
            Ok(_) => {
                self.transition(ProtocolState::Completed);
                info!("Protocol run completed");
            }
            Err(e) => {
                let failed_in = self.state;
                self.transition(ProtocolState::Failed);
                warn!("Protocol run failed during {failed_in:?}: {e}");
            }
        }
    }

    async fn form(&mut self, params: PreParams, config: &ProtocolConfig) -> Result<ThresholdSigner> {
        self.join(config.join_timeout).await?;
        self.announce(config.announce_timeout).await?;

        self.transition(ProtocolState::KeyGenerating);
        let mut participant = KeygenParticipant::new(&mut self.rng, self.group, params)?;
        let key_share = self.run(&mut participant, config.keygen_timeout()).await?;

        let member_keys = self
            .group
            .group_member_ids()
            .iter()
            .map(|id| {
                self.directory
                    .get(id)
                    .cloned()
                    .ok_or(InternalError::InternalInvariantFailed)
            })
            .collect::<Result<Vec<_>>>()?;
        ThresholdSigner::new(self.group.clone(), &key_share.with_member_keys(member_keys))
    }

    async fn sign(
        &mut self,
        key_share: KeyShare,
        digest: [u8; 32],
        config: &ProtocolConfig,
    ) -> Result<Signature> {
        self.transition(ProtocolState::Signing);
        let group = self.group;
        let mut participant =
            exclusive(self.share_lock, || SignParticipant::new(group, key_share, digest))?;
        self.run(&mut participant, config.signing_timeout()).await
    }

    async fn join(&mut self, phase_timeout: Duration) -> Result<()> {
        self.transition(ProtocolState::Joining);
        let join = Message::Join(JoinMessage {
            sender_id: self.me().clone(),
            session_id: self.session_id,
        });
        self.channel.send(join.to_bytes()?).await?;

        let quorum = self.group.quorum();
        let deadline = Instant::now() + phase_timeout;
        let mut joined = HashSet::from([self.me().clone()]);
        while joined.len() < quorum {
            let Some(message) = self.next_message(deadline).await? else {
                return Err(InternalError::ProtocolTimeout(format!(
                    "{} of {quorum} members joined",
                    joined.len()
                )));
            };
            // Anything a member sends shows it is taking part.
            let _ = joined.insert(message.sender_id().clone());
            if !matches!(message, Message::Join(_)) {
                self.stash.push_back(message);
            }
        }
        debug!("{} members joined", joined.len());
        Ok(())
    }

    async fn announce(&mut self, phase_timeout: Duration) -> Result<()> {
        self.transition(ProtocolState::Announcing);
        let announce = Message::Announce(AnnounceMessage {
            sender_id: self.me().clone(),
            session_id: self.session_id,
            sender_public_key: *self.group.member_public_key(),
        });
        self.channel.send(announce.to_bytes()?).await?;

        let quorum = self.group.quorum();
        let deadline = Instant::now() + phase_timeout;
        while self.directory.len() < quorum {
            let Some(message) = self.next_message(deadline).await? else {
                return Err(InternalError::InsufficientAnnouncements {
                    received: self.directory.len(),
                    required: quorum,
                });
            };
            match message {
                Message::Join(m) => trace!("Dropping late join from {}", m.sender_id),
                Message::Announce(m) => {
                    let _ = self.record_key(&m.sender_id, &m.sender_public_key);
                }
                Message::TssProtocol(_) => self.stash.push_back(message),
            }
        }
        debug!("{} members announced", self.directory.len());
        Ok(())
    }

    /// Drive `participant` until it produces its output.
    async fn run<P: ProtocolParticipant>(
        &mut self,
        participant: &mut P,
        phase_timeout: Duration,
    ) -> Result<P::Output> {
        let deadline = Instant::now() + phase_timeout;
        let rng = &mut self.rng;
        let outcome = exclusive(self.share_lock, || participant.start(rng))?;
        if let Some(output) = self.dispatch(outcome).await? {
            return Ok(output);
        }

        loop {
            let Some(message) = self.next_message(deadline).await? else {
                return Err(InternalError::ProtocolTimeout(format!(
                    "{} messages did not arrive in time",
                    P::protocol_name()
                )));
            };
            let rounds = match message {
                Message::Join(m) => {
                    trace!("Dropping late join from {}", m.sender_id);
                    continue;
                }
                Message::Announce(m) => {
                    if self.state != ProtocolState::KeyGenerating
                        || !self.record_key(&m.sender_id, &m.sender_public_key)
                    {
                        continue;
                    }
                    self.flush_outgoing(&m.sender_id).await?;
                    self.release_held(&m.sender_id)?
                }
                Message::TssProtocol(m) => match self.unwrap_round(m)? {
                    Some(round) => vec![round],
                    None => continue,
                },
            };

            for round in rounds {
                let rng = &mut self.rng;
                let outcome =
                    exclusive(self.share_lock, || participant.process_message(rng, &round))?;
                if let Some(output) = self.dispatch(outcome).await? {
                    return Ok(output);
                }
            }
        }
    }

    /// Next valid message from another member, or `None` once `deadline`
    /// passes.
    async fn next_message(&mut self, deadline: Instant) -> Result<Option<Message>> {
        if let Some(message) = self.replay.pop_front() {
            return Ok(Some(message));
        }
        loop {
            let bytes = match timeout_at(deadline, self.inbox.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => {
                    return Err(InternalError::Network(format!(
                        "channel {} closed",
                        self.channel.name()
                    )))
                }
                Ok(Some(bytes)) => bytes,
            };
            let message = match Message::from_bytes(&bytes) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropping message on {}: {e}", self.channel.name());
                    continue;
                }
            };
            let sender = message.sender_id();
            if sender == self.me() {
                continue;
            }
            if !self.group.is_member(sender) {
                warn!("Dropping {:?} message from non-member {sender}", message.kind());
                continue;
            }
            if *message.session_id() != self.session_id {
                debug!(
                    "Dropping {:?} message from {sender} for {:?}",
                    message.kind(),
                    message.session_id()
                );
                continue;
            }
            return Ok(Some(message));
        }
    }

    /// Remember `member`'s static key. Returns `true` if the key is new.
    fn record_key(&mut self, member: &MemberId, key: &PublicKey) -> bool {
        match self.directory.get(member) {
            Some(known) if known == key => false,
            Some(_) => {
                warn!("Ignoring conflicting announcement from {member}");
                false
            }
            None => {
                self.pairwise.add_peer(member, key);
                let _ = self.directory.insert(member.clone(), *key);
                true
            }
        }
    }

    /// Check the envelope of a protocol message and open its body if it was
    /// sealed. Returns `None` for messages that are dropped or held.
    fn unwrap_round(&mut self, message: TssProtocolMessage) -> Result<Option<RoundMessage>> {
        let mut round = match RoundMessage::from_bytes(&message.payload) {
            Ok(round) => round,
            Err(e) => {
                warn!("Dropping protocol message from {}: {e}", message.sender_id);
                return Ok(None);
            }
        };
        if *round.from() != message.sender_id || round.is_broadcast() != message.is_broadcast {
            warn!("Dropping protocol message with inconsistent envelope from {}", message.sender_id);
            return Ok(None);
        }
        let Some(to) = round.to() else {
            return Ok(Some(round));
        };
        if to != self.me() {
            warn!("Dropping direct message for {to} from {}", message.sender_id);
            return Ok(None);
        }
        if !self.pairwise.has_peer(round.from()) {
            trace!("Holding direct message from {} until it announces", round.from());
            self.held.push(round);
            return Ok(None);
        }
        let body = self.pairwise.open(round.from(), &round.unverified_bytes)?;
        round.replace_body(body);
        Ok(Some(round))
    }

    /// Open the direct messages that were waiting for `member`'s key.
    fn release_held(&mut self, member: &MemberId) -> Result<Vec<RoundMessage>> {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|round| round.from() == member);
        self.held = waiting;
        ready
            .into_iter()
            .map(|mut round| {
                let body = self.pairwise.open(member, &round.unverified_bytes)?;
                round.replace_body(body);
                Ok(round)
            })
            .collect()
    }

    async fn flush_outgoing(&mut self, member: &MemberId) -> Result<()> {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.outgoing)
            .into_iter()
            .partition(|round| round.to() == Some(member));
        self.outgoing = waiting;
        for round in ready {
            self.send_round(round).await?;
        }
        Ok(())
    }

    async fn dispatch<O>(&mut self, outcome: ProcessOutcome<O>) -> Result<Option<O>> {
        let (output, messages) = outcome.into_parts();
        for round in messages {
            self.send_round(round).await?;
        }
        Ok(output)
    }

    async fn send_round(&mut self, mut round: RoundMessage) -> Result<()> {
        let Some(to) = round.to().cloned() else {
            let message = Message::TssProtocol(TssProtocolMessage {
                sender_id: self.me().clone(),
                session_id: self.session_id,
                payload: round.to_bytes()?,
                is_broadcast: true,
            });
            return self.channel.send(message.to_bytes()?).await;
        };
        if !self.pairwise.has_peer(&to) {
            trace!("Deferring {:?} for {to} until it announces", round.message_type());
            self.outgoing.push(round);
            return Ok(());
        }
        let sealed = self.pairwise.seal(&mut self.rng, &to, &round.unverified_bytes)?;
        round.replace_body(sealed);
        let message = Message::TssProtocol(TssProtocolMessage {
            sender_id: self.me().clone(),
            session_id: self.session_id,
            payload: round.to_bytes()?,
            is_broadcast: false,
        });
        self.channel.send_to(&to, message.to_bytes()?).await
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        // Timed-out runs are dropped mid-phase and never reach `finish`.
        self.channel.unsubscribe();
    }
}
