// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The contract this crate requires from the blockchain client.
//!
//! The chain collaborator watches the group factory and the deployed group
//! contracts, answers stake and registration queries, and submits results.
//! Events are delivered through handlers registered with
//! [`ChainHandle::on_group_created`] and
//! [`ChainHandle::on_signature_requested`]; each registration returns a
//! [`Subscription`] that stops delivery when released.

use crate::{
    errors::{InternalError, Result},
    group::{GroupId, MemberId},
    sign::Signature,
};
use async_trait::async_trait;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};

/// A 20-byte on-chain account or contract address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; 20]);

impl Address {
    /// Wrap raw address bytes.
    pub const fn new(bytes: [u8; 20]) -> Self {
        Address(bytes)
    }

    /// The raw address bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = InternalError;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(digits)
            .map_err(|e| InternalError::InvalidArgument(format!("invalid address {s}: {e}")))?;
        let bytes: [u8; 20] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            InternalError::InvalidArgument(format!(
                "address must be 20 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Address(bytes))
    }
}

impl TryFrom<String> for Address {
    type Error = InternalError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

/// Emitted when the factory creates a new group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCreatedEvent {
    /// Identifier of the new group.
    pub group_id: GroupId,
    /// Ordered member list; order fixes each member's protocol index.
    pub members: Vec<MemberId>,
}

impl GroupCreatedEvent {
    /// Whether `member` was selected into the group.
    pub fn is_member(&self, member: &MemberId) -> bool {
        self.members.contains(member)
    }
}

/// Emitted when a group contract asks its members to sign a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRequestedEvent {
    /// Group whose key should sign.
    pub group_id: GroupId,
    /// The digest to sign. Anything but 32 bytes is rejected by the signer.
    pub digest: Vec<u8>,
    /// Identifies this request on chain, for example its log position.
    /// Every member sees the same value, so a retried request for the same
    /// digest gets a fresh run.
    pub request_id: u64,
}

/// Callback invoked for every [`GroupCreatedEvent`].
pub type GroupCreatedHandler = Arc<dyn Fn(GroupCreatedEvent) + Send + Sync>;

/// Callback invoked for every [`SignatureRequestedEvent`] of one group.
pub type SignatureRequestedHandler = Arc<dyn Fn(SignatureRequestedEvent) + Send + Sync>;

/// Handle to a registered event handler.
///
/// Releasing the handle, either through [`Subscription::unsubscribe`] or by
/// dropping it, stops delivery to the handler.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Create a handle that runs `cancel` once when released.
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop delivering events to the handler.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Everything the node needs from the chain.
#[async_trait]
pub trait ChainHandle: Send + Sync {
    /// The operator's own address; doubles as its member identifier.
    fn address(&self) -> Address;

    /// Watch for newly created groups.
    async fn on_group_created(&self, handler: GroupCreatedHandler) -> Result<Subscription>;

    /// Watch for signing requests addressed to `group_id`.
    async fn on_signature_requested(
        &self,
        group_id: &GroupId,
        handler: SignatureRequestedHandler,
    ) -> Result<Subscription>;

    /// The operator's stake currently eligible for group selection.
    async fn eligible_stake(&self) -> Result<BigInt>;

    /// Whether the operator is already a member candidate for `application`.
    async fn is_registered(&self, application: &Address) -> Result<bool>;

    /// Register the operator as a member candidate for `application`.
    async fn register_as_member_candidate(&self, application: &Address) -> Result<()>;

    /// Publish the group's public key as the 64-byte `X || Y` encoding.
    async fn submit_group_public_key(&self, group_id: &GroupId, public_key: [u8; 64])
        -> Result<()>;

    /// Publish a completed signature.
    async fn submit_signature(&self, group_id: &GroupId, signature: &Signature) -> Result<()>;

    /// Whether `group_id` is still waiting for a signature over `digest`.
    async fn is_awaiting_signature(&self, group_id: &GroupId, digest: &[u8; 32]) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn address_parses_with_and_without_prefix() -> Result<()> {
        let text = "0x00112233445566778899aabbccddeeff00112233";
        let address: Address = text.parse()?;
        assert_eq!(address.to_string(), text);
        assert_eq!(text[2..].parse::<Address>()?, address);
        assert_eq!(address.as_bytes()[1], 0x11);
        Ok(())
    }

    #[test]
    fn address_rejects_bad_input() {
        assert!("0x1234".parse::<Address>().is_err());
        assert!("not an address".parse::<Address>().is_err());
    }

    #[test]
    fn address_becomes_member_and_group_id() {
        let address = Address::new([7u8; 20]);
        assert_eq!(MemberId::from(address).as_bytes(), &[7u8; 20]);
        assert_eq!(GroupId::from(address).as_bytes(), &[7u8; 20]);
    }

    #[test]
    fn subscription_cancels_exactly_once() {
        let cancelled = Arc::new(AtomicUsize::new(0));

        let counter = cancelled.clone();
        let subscription = Subscription::new(move || {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });
        subscription.unsubscribe();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);

        let counter = cancelled.clone();
        drop(Subscription::new(move || {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(cancelled.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn group_created_event_membership() {
        let event = GroupCreatedEvent {
            group_id: GroupId::new(b"G1".to_vec()),
            members: vec![MemberId::new(b"A".to_vec()), MemberId::new(b"C".to_vec())],
        };
        assert!(event.is_member(&MemberId::new(b"A".to_vec())));
        assert!(!event.is_member(&MemberId::new(b"B".to_vec())));
    }
}
