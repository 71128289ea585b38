// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Contains the functions and definitions for dealing with messages that are
//! passed between group members.
//!
//! There are two layers. [`Message`] is the envelope that travels over a
//! group channel: a join notice, an announcement carrying a static public
//! key, or an opaque [`TssProtocolMessage`]. The payload of a
//! [`TssProtocolMessage`] is a [`RoundMessage`] produced by the key
//! generation or signing participant.
//!
//! Every envelope names the [`SessionId`] of the run it belongs to, so a run
//! can drop traffic left behind by another run on the same channel.

use crate::{
    errors::{InternalError, Result},
    group::{GroupId, MemberId},
    serialization,
};
use k256::PublicKey;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Debug};
use tracing::{error, instrument, trace};

/////////////////
// Message API //
/////////////////

/// Identifies one protocol run. Every member of the run derives the same
/// value from what the chain told it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; 32]);

impl SessionId {
    /// The run that forms `group_id`. A group is formed once.
    pub fn formation(group_id: &GroupId) -> Self {
        Self::derive(b"formation", group_id, &[])
    }

    /// The run that answers signing request `request_id` for `digest`.
    pub fn signing(group_id: &GroupId, digest: &[u8; 32], request_id: u64) -> Self {
        let mut input = digest.to_vec();
        input.extend_from_slice(&request_id.to_be_bytes());
        Self::derive(b"signing", group_id, &input)
    }

    fn derive(label: &[u8], group_id: &GroupId, input: &[u8]) -> Self {
        let group = group_id.as_bytes();
        let mut hasher = Sha256::new();
        hasher.update(b"keep-ecdsa session ");
        hasher.update(label);
        hasher.update((group.len() as u64).to_be_bytes());
        hasher.update(group);
        hasher.update(input);
        Self(hasher.finalize().into())
    }
}

impl Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(&self.0[..8]))
    }
}

/// Signals that the sender intends to take part in forming the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinMessage {
    /// Member sending the message.
    pub sender_id: MemberId,
    /// Run the message belongs to.
    pub session_id: SessionId,
}

/// Publishes the sender's static public key so peers can open pairwise
/// channels with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceMessage {
    /// Member sending the message.
    pub sender_id: MemberId,
    /// Run the message belongs to.
    pub session_id: SessionId,
    /// Static public key of the sender.
    #[serde(with = "serialization::public_key")]
    pub sender_public_key: PublicKey,
}

/// Opaque payload produced by the multi-party computation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TssProtocolMessage {
    /// Member sending the message.
    pub sender_id: MemberId,
    /// Run the message belongs to.
    pub session_id: SessionId,
    /// Encoded round message.
    pub payload: Vec<u8>,
    /// `true` when the message went to every member rather than one.
    pub is_broadcast: bool,
}

impl Debug for TssProtocolMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TssProtocolMessage")
            .field("sender_id", &self.sender_id)
            .field("session_id", &self.session_id)
            .field("payload_len", &self.payload.len())
            .field("is_broadcast", &self.is_broadcast)
            .finish()
    }
}

/// A message that can be posted to (and read from) a group channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// See [`JoinMessage`].
    Join(JoinMessage),
    /// See [`AnnounceMessage`].
    Announce(AnnounceMessage),
    /// See [`TssProtocolMessage`].
    TssProtocol(TssProtocolMessage),
}

/// Discriminant of a [`Message`], used for logging and phase routing.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum MessageKind {
    /// [`Message::Join`]
    Join,
    /// [`Message::Announce`]
    Announce,
    /// [`Message::TssProtocol`]
    TssProtocol,
}

impl Message {
    /// The member that sent this message.
    pub fn sender_id(&self) -> &MemberId {
        match self {
            Message::Join(m) => &m.sender_id,
            Message::Announce(m) => &m.sender_id,
            Message::TssProtocol(m) => &m.sender_id,
        }
    }

    /// The run this message belongs to.
    pub fn session_id(&self) -> &SessionId {
        match self {
            Message::Join(m) => &m.session_id,
            Message::Announce(m) => &m.session_id,
            Message::TssProtocol(m) => &m.session_id,
        }
    }

    /// Which variant this message is.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Join(_) => MessageKind::Join,
            Message::Announce(_) => MessageKind::Announce,
            Message::TssProtocol(_) => MessageKind::TssProtocol,
        }
    }

    /// Encode the message for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serialize!(self)
    }

    /// Decode a message received from the wire.
    ///
    /// Fails with [`InternalError::MalformedMessage`] if the bytes are not a
    /// well-formed message or the sender identifier is empty.
    #[instrument(skip_all, err(Debug))]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let message: Message = decode_wire(bytes, "message")?;
        if message.sender_id().is_empty() {
            return Err(InternalError::MalformedMessage(
                "message carries an empty sender id".into(),
            ));
        }
        trace!("Decoded {:?} message from {}", message.kind(), message.sender_id());
        Ok(message)
    }
}

fn decode_wire<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    let decoded: Result<T> = deserialize!(bytes);
    decoded.map_err(|_| InternalError::MalformedMessage(format!("could not decode {what}")))
}

macro_rules! impl_wire_encoding {
    ($type:ty, $name:literal) => {
        impl $type {
            /// Encode the message for the wire.
            pub fn to_bytes(&self) -> Result<Vec<u8>> {
                serialize!(self)
            }

            /// Decode the message, failing with
            /// [`InternalError::MalformedMessage`] on bad input.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                let message: Self = decode_wire(bytes, $name)?;
                if message.sender_id.is_empty() {
                    return Err(InternalError::MalformedMessage(format!(
                        "{} carries an empty sender id",
                        $name
                    )));
                }
                Ok(message)
            }
        }
    };
}

impl_wire_encoding!(JoinMessage, "join message");
impl_wire_encoding!(AnnounceMessage, "announce message");
impl_wire_encoding!(TssProtocolMessage, "protocol message");

/// An enum consisting of all round message types
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MessageType {
    /// Keygen messages
    Keygen(KeygenMessageType),
    /// Signing messages
    Sign(SignMessageType),
}

/// An enum consisting of all keygen message types
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum KeygenMessageType {
    /// A hash commitment to the public polynomial and associated proof
    R1CommitHash,
    /// The information committed to in Round 1
    R2Decommit,
    /// The sender's polynomial evaluated at the recipient's index
    R2PrivateShare,
    /// Digest of the derived public key material
    R3Confirmation,
}

/// An enum consisting of all signing message types
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum SignMessageType {
    /// Feldman commitments to the blinding polynomial
    R1NonceCommitments,
    /// Evaluations of the nonce, blinding and zero-sharing polynomials
    R1PrivateShares,
    /// Share of the masked nonce product
    R2Product,
    /// Share of the final signature
    R3SignatureShare,
}

/// A single round message, carried in [`TssProtocolMessage::payload`].
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct RoundMessage {
    /// The type of the message
    pub(crate) message_type: MessageType,
    /// Which member this message is coming from.
    from: MemberId,
    /// Which member this message is addressed to; `None` for broadcasts.
    to: Option<MemberId>,
    /// The raw bytes for the message, which need to be verified.
    pub(crate) unverified_bytes: Vec<u8>,
}

impl Debug for RoundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundMessage")
            .field("message_type", &self.message_type)
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

impl RoundMessage {
    /// Creates a new instance of [`RoundMessage`].
    pub(crate) fn new<T>(
        message_type: MessageType,
        from: &MemberId,
        to: Option<&MemberId>,
        unverified_bytes: &T,
    ) -> Result<Self>
    where
        T: Serialize,
    {
        Ok(Self {
            message_type,
            from: from.clone(),
            to: to.cloned(),
            unverified_bytes: serialize!(unverified_bytes)?,
        })
    }

    /// The message type associated with the message.
    pub(crate) fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// The member that sent this message.
    pub(crate) fn from(&self) -> &MemberId {
        &self.from
    }

    /// The member that should receive this message, if it is direct.
    pub(crate) fn to(&self) -> Option<&MemberId> {
        self.to.as_ref()
    }

    pub(crate) fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Check if the message type is correct.
    pub(crate) fn check_type(&self, expected_type: MessageType) -> Result<()> {
        if self.message_type() != expected_type {
            error!(
                "A message was misrouted. Expected {:?}, Got {:?}",
                expected_type,
                self.message_type()
            );
            return Err(InternalError::InternalInvariantFailed);
        }
        Ok(())
    }

    /// Decode the body into the type expected for this round.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        deserialize!(&self.unverified_bytes)
            .map_err(|_| InternalError::FailedToVerify(format!("undecodable {:?} body", self.message_type)))
    }

    pub(crate) fn replace_body(&mut self, bytes: Vec<u8>) {
        self.unverified_bytes = bytes;
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        serialize!(self)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_wire(bytes, "round message")
    }
}
