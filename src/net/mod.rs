// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The contract this crate requires from the peer-to-peer transport.
//!
//! Protocol runs talk over named channels. A channel carries encoded
//! [`Message`](crate::Message)s as opaque bytes; decoding and validation are
//! left to the signing engine.

pub mod local;

use crate::{errors::Result, group::MemberId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// A named channel shared by the members of one protocol run.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    /// The channel name.
    fn name(&self) -> &str;

    /// Deliver `payload` to every other member on the channel.
    async fn send(&self, payload: Vec<u8>) -> Result<()>;

    /// Deliver `payload` to `recipient` only.
    ///
    /// Fails with [`InternalError::Network`](crate::errors::InternalError)
    /// if the recipient cannot be reached.
    async fn send_to(&self, recipient: &MemberId, payload: Vec<u8>) -> Result<()>;

    /// Start receiving payloads sent to this member on the channel.
    ///
    /// Payloads that arrived before the first subscription are delivered
    /// first. Subscribing again replaces the previous receiver.
    async fn subscribe(&self) -> Result<UnboundedReceiver<Vec<u8>>>;

    /// Stop receiving on the channel and discard whatever is still queued
    /// for this member.
    fn unsubscribe(&self);
}

/// Hands out channels for the local member.
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    /// Open (or join) the channel called `name`.
    async fn channel_for(&self, name: &str) -> Result<Arc<dyn BroadcastChannel>>;
}
