// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Node configuration, read from TOML.
//!
//! ```toml
//! storage_dir = "/var/lib/keep-ecdsa"
//! sanctioned_applications = ["0x00112233445566778899aabbccddeeff00112233"]
//! registration_retry_interval_secs = 60
//!
//! [protocol]
//! join_timeout_secs = 30
//! announce_timeout_secs = 30
//! keygen_round_timeout_secs = 60
//! signing_round_timeout_secs = 60
//!
//! [pool]
//! target_size = 4
//! max_threshold = 16
//! ```

use crate::{
    chain::Address,
    errors::{InternalError, Result},
    params::PoolConfig,
};
use serde::{Deserialize, Deserializer};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Number of message rounds in both key generation and signing.
pub(crate) const PROTOCOL_ROUNDS: u32 = 3;

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

/// Phase timeouts for protocol runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolConfig {
    /// How long to wait for enough members to join.
    #[serde(rename = "join_timeout_secs", deserialize_with = "seconds")]
    pub join_timeout: Duration,
    /// How long to wait for enough members to announce their keys.
    #[serde(rename = "announce_timeout_secs", deserialize_with = "seconds")]
    pub announce_timeout: Duration,
    /// Allowance per key generation round.
    #[serde(rename = "keygen_round_timeout_secs", deserialize_with = "seconds")]
    pub keygen_round_timeout: Duration,
    /// Allowance per signing round.
    #[serde(rename = "signing_round_timeout_secs", deserialize_with = "seconds")]
    pub signing_round_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(30),
            announce_timeout: Duration::from_secs(30),
            keygen_round_timeout: Duration::from_secs(60),
            signing_round_timeout: Duration::from_secs(60),
        }
    }
}

impl ProtocolConfig {
    /// Time allowed for the key generation phase.
    pub fn keygen_timeout(&self) -> Duration {
        self.keygen_round_timeout * PROTOCOL_ROUNDS
    }

    /// Time allowed for the signing phase.
    pub fn signing_timeout(&self) -> Duration {
        self.signing_round_timeout * PROTOCOL_ROUNDS
    }

    /// Deadline for a whole group formation run.
    pub fn formation_deadline(&self) -> Duration {
        self.join_timeout + self.announce_timeout + self.keygen_timeout()
    }

    fn validate(&self) -> Result<()> {
        let timeouts = [
            ("join", self.join_timeout),
            ("announce", self.announce_timeout),
            ("keygen round", self.keygen_round_timeout),
            ("signing round", self.signing_round_timeout),
        ];
        for (name, timeout) in timeouts {
            if timeout.is_zero() {
                return Err(InternalError::Config(format!(
                    "{name} timeout must be positive"
                )));
            }
        }
        Ok(())
    }
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(60)
}

/// Everything needed to start a node.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where signers are persisted.
    pub storage_dir: PathBuf,
    /// Applications the operator registers as a member candidate for.
    #[serde(default)]
    pub sanctioned_applications: Vec<Address>,
    /// Wait between registration attempts.
    #[serde(
        rename = "registration_retry_interval_secs",
        deserialize_with = "seconds",
        default = "default_retry_interval"
    )]
    pub registration_retry_interval: Duration,
    /// Protocol phase timeouts.
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Warm-parameter pool tunables.
    #[serde(default)]
    pub pool: PoolConfig,
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| InternalError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            InternalError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject settings the node cannot run with.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.registration_retry_interval.is_zero() {
            return Err(InternalError::Config(
                "registration retry interval must be positive".into(),
            ));
        }
        if self.pool.target_size == 0 {
            return Err(InternalError::Config(
                "pre-parameter pool target size must be positive".into(),
            ));
        }
        self.protocol.validate()
    }
}
