// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! A list of error types which are produced while forming groups, signing,
//! and persisting signers.
use core::fmt::Debug;
use thiserror::Error;

/// The default Result type used in this crate
pub type Result<T> = std::result::Result<T, InternalError>;

/// Represents an error in the threshold-signing subsystem.
///
/// Protocol-level failures (`InsufficientAnnouncements`,
/// `KeyGenerationAborted`, `SigningAborted`) discard the run they occurred
/// in; nothing produced by that run is persisted.
#[derive(Clone, Eq, PartialEq, Error, Debug)]
pub enum InternalError {
    /// Wire bytes did not decode to any known message variant.
    #[error("Malformed message: `{0}`")]
    MalformedMessage(String),
    /// A digest of the wrong size was handed to the signing flow.
    #[error("Digest must be exactly 32 bytes, got {0}")]
    InvalidDigest(usize),
    /// Too few members announced themselves before the deadline.
    #[error("Received {received} announcements, at least {required} required")]
    InsufficientAnnouncements {
        /// Distinct members that announced, including this member.
        received: usize,
        /// Group size minus dishonest threshold.
        required: usize,
    },
    /// The key generation run failed and was discarded.
    #[error("Key generation aborted: `{0}`")]
    KeyGenerationAborted(String),
    /// The signing run failed and was discarded.
    #[error("Signing aborted: `{0}`")]
    SigningAborted(String),
    /// A persisted signer entry could not be read back.
    #[error("Corrupted registry entry: `{0}`")]
    RegistryLoadCorruption(String),
    /// A new signer could not be made durable.
    #[error("Failed to save signer: `{0}`")]
    RegistrySaveFailure(String),
    /// The operator has no positive eligible stake.
    #[error("Operator doesn't have enough stake")]
    StakeInsufficient,
    /// The chain rejected member candidate registration.
    #[error("Member candidate registration failed: `{0}`")]
    RegistrationFailed(String),
    #[error("Serialization Error")]
    Serialization,
    #[error("Failed to verify value received from a peer: `{0}`")]
    FailedToVerify(String),
    #[error("Function call contained invalid arguments: `{0}`")]
    InvalidArgument(String),
    #[error("Network error: `{0}`")]
    Network(String),
    #[error("Chain error: `{0}`")]
    Chain(String),
    #[error("Persistence error: `{0}`")]
    Persistence(String),
    #[error("Protocol phase timed out: `{0}`")]
    ProtocolTimeout(String),
    #[error("Invalid configuration: `{0}`")]
    Config(String),
    #[error("Represents some code assumption that was checked at runtime but failed to be true")]
    InternalInvariantFailed,
}

impl InternalError {
    /// Returns `true` for failures that end a single protocol run without
    /// affecting any other run or persisted state.
    pub fn is_protocol_failure(&self) -> bool {
        matches!(
            self,
            InternalError::InsufficientAnnouncements { .. }
                | InternalError::KeyGenerationAborted(_)
                | InternalError::SigningAborted(_)
                | InternalError::ProtocolTimeout(_)
        )
    }
}

macro_rules! serialize {
    ($x:expr) => {{
        crate::serialization::encode($x)
    }};
}

macro_rules! deserialize {
    ($x:expr) => {{
        crate::serialization::decode($x)
    }};
}

macro_rules! verify_err {
    ($x:expr) => {{
        Err(crate::errors::InternalError::FailedToVerify(String::from(
            $x,
        )))
    }};
}

macro_rules! bail {
    ($($arg:tt)*) => {{
        Err(crate::errors::InternalError::InvalidArgument(format!($($arg)*)))
    }};
}

macro_rules! arg_err {
    ($x:expr) => {{
        Err(crate::errors::InternalError::InvalidArgument(String::from(
            $x,
        )))
    }};
}
