// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! This module contains [`ProtocolParticipant`], the core trait for
//! implementing the multi-party sub-protocols (key generation and signing)
//! driven by the signing engine.

use crate::{
    errors::{InternalError, Result},
    group::MemberId,
    message_queue::MessageQueue,
    messages::{MessageType, RoundMessage},
};
use rand::{CryptoRng, RngCore};
use serde::Serialize;
use std::{collections::HashSet, fmt::Debug};
use tracing::error;

/// Possible outcomes from processing one or more messages.
///
/// Processing an individual message causes various outcomes in a protocol
/// execution. Depending on what other state a [`ProtocolParticipant`] has, a
/// message might be be stored for later processing or partially processed
/// without completing the protocol round. Alternately, it can trigger
/// completion of a protocol round, which may produce messages to be sent to
/// other participants, an output (if the round was the final round), or both.
pub(crate) enum ProcessOutcome<O> {
    /// The message was not fully processed; we need more inputs to continue.
    Incomplete,
    /// The message was processed successfully but the subprotocol isn't done.
    Processed(Vec<RoundMessage>),
    /// The subprotocol is done for this participant but there are still
    /// messages to send to others.
    TerminatedForThisParticipant(O, Vec<RoundMessage>),
    /// The entire subprotocol is done and there are no more messages to send.
    Terminated(O),
}

impl<O> Debug for ProcessOutcome<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let descriptor = match self {
            ProcessOutcome::Incomplete => "Incomplete",
            ProcessOutcome::Processed(_) => "Processed",
            ProcessOutcome::Terminated(_) => "Terminated",
            ProcessOutcome::TerminatedForThisParticipant(_, _) => "Terminated for this participant",
        };
        write!(f, "ProcessOutcome::{descriptor}")
    }
}

impl<O> ProcessOutcome<O> {
    /// Create a [`ProcessOutcome`] from an optional output and a set of
    /// outgoing messages.
    pub(crate) fn from(output: Option<O>, messages: Vec<RoundMessage>) -> Self {
        match (output, messages.len()) {
            (None, 0) => Self::Incomplete,
            (None, _) => Self::Processed(messages),
            (Some(o), 0) => Self::Terminated(o),
            (Some(o), _) => Self::TerminatedForThisParticipant(o, messages),
        }
    }

    /// Convert the [`ProcessOutcome`] into its constituent parts.
    pub(crate) fn into_parts(self) -> (Option<O>, Vec<RoundMessage>) {
        match self {
            Self::Incomplete => (None, Vec::new()),
            Self::Processed(msgs) => (None, msgs),
            Self::TerminatedForThisParticipant(output, msgs) => (Some(output), msgs),
            Self::Terminated(output) => (Some(output), Vec::new()),
        }
    }

    /// Collect a set of `ProcessOutcome`s into a single outcome.
    ///
    /// This collects all of the messages into a single set, and makes sure that
    /// there's no more than one output specified among all the outcomes.
    pub(crate) fn collect(outcomes: Vec<Self>) -> Result<Self> {
        Self::Incomplete.consolidate(outcomes)
    }

    /// Consolidate a set of `ProcessOutcome`s, including `self`, into a single
    /// outcome.
    pub(crate) fn consolidate(self, outcomes: Vec<Self>) -> Result<Self> {
        let (outputs, messages): (Vec<_>, Vec<_>) = std::iter::once(self)
            .chain(outcomes)
            .map(Self::into_parts)
            .unzip();

        let mut actual_outputs = outputs.into_iter().flatten();
        let output = actual_outputs.next();
        if actual_outputs.next().is_some() {
            error!("Produced more than one output in a single session.");
            Err(InternalError::InternalInvariantFailed)?
        }

        let messages = messages.into_iter().flatten().collect();

        Ok(ProcessOutcome::from(output, messages))
    }

    /// Combine a `ProcessOutcome` with an additional set of [`RoundMessage`]s.
    pub(crate) fn with_messages(self, mut messages: Vec<RoundMessage>) -> Self {
        let (output, mut original_messages) = self.into_parts();
        original_messages.append(&mut messages);
        Self::from(output, original_messages)
    }
}

/// Bookkeeping shared by every participant: early messages and the set of
/// round functions that already ran.
#[derive(Debug, Default)]
pub(crate) struct ParticipantState {
    queue: MessageQueue,
    progress: HashSet<&'static str>,
}

/// These are the methods that must be implemented for a given protocol.
pub(crate) trait ProtocolParticipant {
    /// Output type of a successful protocol execution.
    type Output;

    /// Human-readable protocol name, used in logs.
    fn protocol_name() -> &'static str;

    /// Return the participant id
    fn id(&self) -> &MemberId;

    /// Return other Participant ids apart from the current one
    fn other_ids(&self) -> &[MemberId];

    fn state(&mut self) -> &mut ParticipantState;

    /// Produce this participant's first-round messages.
    fn start<R: RngCore + CryptoRng>(&mut self, rng: &mut R)
        -> Result<ProcessOutcome<Self::Output>>;

    /// Process an incoming message.
    ///
    /// This method should parse the message, do any immediate per-message
    /// processing, and if all necessary messages have been received,
    /// compute a round of the protocol.
    /// In some cases, this method will process other stored messages that have
    /// become usable by the processing of the given message. The
    /// `ProcessOutcome` is the consolidated outputs of all processed
    /// messages.
    ///
    /// # Assumptions
    /// This method can safely assume (and thus doesn't need to check) the
    /// following:
    /// - The sender is a member of the group other than this participant.
    /// - Direct messages were addressed to this participant and their body
    ///   has already been opened.
    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &RoundMessage,
    ) -> Result<ProcessOutcome<Self::Output>>;

    /// Store [`RoundMessage`] in the message queue.
    fn stash_message(&mut self, message: &RoundMessage) {
        self.state().queue.store(message.clone());
    }

    /// Fetch (and remove) all [`RoundMessage`]s matching the given
    /// [`MessageType`].
    fn fetch_messages(&mut self, message_type: MessageType) -> Vec<RoundMessage> {
        self.state().queue.retrieve_all_of_type(message_type)
    }

    fn write_progress(&mut self, func_name: &'static str) {
        let _ = self.state().progress.insert(func_name);
    }

    fn read_progress(&mut self, func_name: &'static str) -> bool {
        self.state().progress.contains(func_name)
    }

    /// Build a message addressed to every other member.
    fn broadcast_message<T: Serialize>(
        &self,
        message_type: MessageType,
        data: &T,
    ) -> Result<RoundMessage> {
        RoundMessage::new(message_type, self.id(), None, data)
    }

    /// Build one direct message per other member, with a body computed for
    /// each recipient.
    fn direct_messages<T, F>(&self, message_type: MessageType, mut body_for: F) -> Result<Vec<RoundMessage>>
    where
        T: Serialize,
        F: FnMut(&MemberId) -> Result<T>,
    {
        self.other_ids()
            .iter()
            .map(|other_id| RoundMessage::new(message_type, self.id(), Some(other_id), &body_for(other_id)?))
            .collect()
    }
}

/// Run a round function at most once per participant; later calls yield no
/// messages.
macro_rules! run_only_once {
    ($self:ident . $func_name:ident $args:tt) => {{
        if $self.read_progress(stringify!($func_name)) {
            Ok(vec![])
        } else {
            $self.write_progress(stringify!($func_name));
            $self.$func_name$args
        }
    }};
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::messages::KeygenMessageType;
    use rand::{rngs::OsRng, Rng};

    /// Tampering applied to messages in transit by [`run_participants`].
    pub(crate) struct DeliveryFilter {
        corrupt: Option<MessageType>,
        silenced: Option<MemberId>,
    }

    impl DeliveryFilter {
        pub(crate) fn none() -> Self {
            Self {
                corrupt: None,
                silenced: None,
            }
        }

        /// Flip a bit in the body of the first message of this type.
        pub(crate) fn corrupt(message_type: MessageType) -> Self {
            Self {
                corrupt: Some(message_type),
                silenced: None,
            }
        }

        /// Drop everything sent by `member`.
        pub(crate) fn silence(member: MemberId) -> Self {
            Self {
                corrupt: None,
                silenced: Some(member),
            }
        }

        fn apply(&mut self, mut message: RoundMessage) -> Option<RoundMessage> {
            if self.silenced.as_ref() == Some(message.from()) {
                return None;
            }
            if self.corrupt == Some(message.message_type()) {
                self.corrupt = None;
                if let Some(last) = message.unverified_bytes.last_mut() {
                    *last ^= 1;
                }
            }
            Some(message)
        }
    }

    /// Run participants to completion, delivering messages in random order.
    ///
    /// Fails if any participant fails, or if messages run out before every
    /// participant produced an output.
    pub(crate) fn run_participants<P: ProtocolParticipant>(
        mut participants: Vec<P>,
        mut filter: DeliveryFilter,
    ) -> Result<Vec<P::Output>> {
        let mut rng = OsRng;
        let ids: Vec<MemberId> = participants.iter().map(|p| p.id().clone()).collect();
        let mut in_flight: Vec<(usize, RoundMessage)> = Vec::new();
        let mut outputs: Vec<Option<P::Output>> = participants.iter().map(|_| None).collect();

        let mut route = |messages: Vec<RoundMessage>, in_flight: &mut Vec<(usize, RoundMessage)>| {
            for message in messages {
                let Some(message) = filter.apply(message) else {
                    continue;
                };
                match message.to() {
                    Some(to) => {
                        if let Some(index) = ids.iter().position(|id| id == to) {
                            in_flight.push((index, message));
                        }
                    }
                    None => {
                        for (index, id) in ids.iter().enumerate() {
                            if id != message.from() {
                                in_flight.push((index, message.clone()));
                            }
                        }
                    }
                }
            }
        };

        for participant in participants.iter_mut() {
            let (_, messages) = participant.start(&mut rng)?.into_parts();
            route(messages, &mut in_flight);
        }

        while !in_flight.is_empty() {
            let (to, message) = in_flight.swap_remove(rng.gen_range(0..in_flight.len()));
            let (output, messages) = participants[to]
                .process_message(&mut rng, &message)?
                .into_parts();
            if output.is_some() {
                outputs[to] = output;
            }
            route(messages, &mut in_flight);
        }

        outputs
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| InternalError::ProtocolTimeout("messages ran out".into()))
    }

    fn message() -> Result<RoundMessage> {
        RoundMessage::new(
            MessageType::Keygen(KeygenMessageType::R1CommitHash),
            &MemberId::new(b"a".to_vec()),
            None,
            &7u8,
        )
    }

    #[test]
    fn outcome_parts_follow_output_and_messages() -> Result<()> {
        assert!(matches!(ProcessOutcome::<u8>::from(None, vec![]), ProcessOutcome::Incomplete));
        assert!(matches!(
            ProcessOutcome::<u8>::from(None, vec![message()?]),
            ProcessOutcome::Processed(_)
        ));
        assert!(matches!(ProcessOutcome::from(Some(1u8), vec![]), ProcessOutcome::Terminated(1)));
        assert!(matches!(
            ProcessOutcome::from(Some(1u8), vec![message()?]),
            ProcessOutcome::TerminatedForThisParticipant(1, _)
        ));
        Ok(())
    }

    #[test]
    fn collect_merges_messages() -> Result<()> {
        let outcome = ProcessOutcome::<u8>::collect(vec![
            ProcessOutcome::Processed(vec![message()?]),
            ProcessOutcome::Incomplete,
            ProcessOutcome::Terminated(4),
        ])?
        .with_messages(vec![message()?]);
        let (output, messages) = outcome.into_parts();
        assert_eq!(output, Some(4));
        assert_eq!(messages.len(), 2);
        Ok(())
    }

    #[test]
    fn collect_rejects_two_outputs() {
        let result = ProcessOutcome::collect(vec![
            ProcessOutcome::Terminated(1u8),
            ProcessOutcome::Terminated(2u8),
        ]);
        assert_eq!(result.err(), Some(InternalError::InternalInvariantFailed));
    }
}
