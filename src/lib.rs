// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! A threshold ECDSA keep node.
//!
//! Operators selected into a signing group jointly generate a secp256k1 key
//! whose private part no single member ever holds. Each member keeps a
//! [`ThresholdSigner`]: its share of the key together with the group it
//! belongs to. When the chain asks the group for a signature, the members
//! run an interactive protocol that produces an ordinary ECDSA signature,
//! verifiable against the group public key like any other.
//!
//! The crate is organized in layers:
//! - the key generation and signing protocols proper, each a state machine
//!   that turns incoming round messages into outgoing ones;
//! - the signing engine, which runs those protocols over a
//!   [`BroadcastChannel`](net::BroadcastChannel): members join, announce
//!   their static keys, and only then exchange protocol messages, with
//!   member-to-member messages encrypted under pairwise keys;
//! - the [`SignerRegistry`], persisting every signer through a
//!   [`PersistenceHandle`](persistence::PersistenceHandle);
//! - the [`Client`], which reacts to chain events through a
//!   [`ChainHandle`](chain::ChainHandle) and keeps the operator registered
//!   as a member candidate.
//!
//! The chain, the network and storage are traits; [`net::local`] and
//! [`persistence::DiskPersistence`] provide in-process and on-disk
//! implementations.

#![warn(missing_docs)]

#[macro_use]
pub mod errors;

#[macro_use]
mod participant;

pub mod chain;
pub mod client;
pub mod config;
pub mod group;
pub mod messages;
pub mod net;
pub mod node;
pub mod params;
pub mod persistence;
pub mod registry;
pub mod signer;

mod keygen;
mod message_queue;
mod pairwise;
mod protocol;
mod serialization;
mod sign;
mod utils;
mod zkp;

#[cfg(test)]
mod test_utils;

pub use chain::{Address, ChainHandle};
pub use client::Client;
pub use config::{Config, ProtocolConfig};
pub use errors::{InternalError, Result};
pub use group::{GroupId, GroupInfo, MemberId};
pub use node::Node;
pub use params::PoolConfig;
pub use registry::SignerRegistry;
pub use sign::Signature;
pub use signer::{ThresholdKey, ThresholdSigner};
