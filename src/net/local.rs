// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! In-process transport connecting any number of members.
//!
//! Useful for development setups that run a whole group inside one process,
//! and for tests. Payloads for a member with no live subscription to a
//! channel are buffered until it subscribes.

use super::{BroadcastChannel, NetworkProvider};
use crate::{
    errors::{InternalError, Result},
    group::MemberId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

enum Inbox {
    Buffered(Vec<Vec<u8>>),
    Open(UnboundedSender<Vec<u8>>),
}

#[derive(Default)]
struct Hub {
    members: HashSet<MemberId>,
    inboxes: HashMap<(String, MemberId), Inbox>,
}

impl Hub {
    fn deliver(&mut self, channel: &str, to: &MemberId, payload: Vec<u8>) {
        let inbox = self
            .inboxes
            .entry((channel.to_string(), to.clone()))
            .or_insert_with(|| Inbox::Buffered(Vec::new()));
        match inbox {
            Inbox::Buffered(pending) => pending.push(payload),
            Inbox::Open(sender) => {
                if let Err(mpsc::error::SendError(payload)) = sender.send(payload) {
                    trace!("Receiver for {to} on {channel} is gone, buffering");
                    *inbox = Inbox::Buffered(vec![payload]);
                }
            }
        }
    }
}

/// A shared in-process network. Cloning yields another handle to the same
/// network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("members", &self.hub.lock().members.len())
            .finish()
    }
}

impl LocalNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `member` and return its provider.
    pub fn provider(&self, member: MemberId) -> LocalProvider {
        let _ = self.hub.lock().members.insert(member.clone());
        LocalProvider {
            member,
            network: self.clone(),
        }
    }

    /// Disconnect `member`. Pending payloads for it are discarded and later
    /// sends to it fail.
    pub fn disconnect(&self, member: &MemberId) {
        let mut hub = self.hub.lock();
        let _ = hub.members.remove(member);
        hub.inboxes.retain(|(_, owner), _| owner != member);
        debug!("Disconnected {member} from local network");
    }
}

/// Network access for one member of a [`LocalNetwork`].
#[derive(Clone, Debug)]
pub struct LocalProvider {
    member: MemberId,
    network: LocalNetwork,
}

#[async_trait]
impl NetworkProvider for LocalProvider {
    async fn channel_for(&self, name: &str) -> Result<Arc<dyn BroadcastChannel>> {
        Ok(Arc::new(LocalChannel {
            name: name.to_string(),
            member: self.member.clone(),
            network: self.network.clone(),
        }))
    }
}

struct LocalChannel {
    name: String,
    member: MemberId,
    network: LocalNetwork,
}

impl LocalChannel {
    fn ensure_connected(&self, hub: &Hub) -> Result<()> {
        if hub.members.contains(&self.member) {
            Ok(())
        } else {
            Err(InternalError::Network(format!(
                "{} is not connected to the local network",
                self.member
            )))
        }
    }
}

#[async_trait]
impl BroadcastChannel for LocalChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: Vec<u8>) -> Result<()> {
        let mut hub = self.network.hub.lock();
        self.ensure_connected(&hub)?;
        let recipients: Vec<MemberId> = hub
            .members
            .iter()
            .filter(|member| **member != self.member)
            .cloned()
            .collect();
        for recipient in recipients {
            hub.deliver(&self.name, &recipient, payload.clone());
        }
        Ok(())
    }

    async fn send_to(&self, recipient: &MemberId, payload: Vec<u8>) -> Result<()> {
        let mut hub = self.network.hub.lock();
        self.ensure_connected(&hub)?;
        if !hub.members.contains(recipient) {
            return Err(InternalError::Network(format!(
                "{recipient} is not reachable on channel {}",
                self.name
            )));
        }
        hub.deliver(&self.name, recipient, payload);
        Ok(())
    }

    async fn subscribe(&self) -> Result<UnboundedReceiver<Vec<u8>>> {
        let mut hub = self.network.hub.lock();
        self.ensure_connected(&hub)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let key = (self.name.clone(), self.member.clone());
        if let Some(Inbox::Buffered(pending)) = hub.inboxes.remove(&key) {
            trace!(
                "Replaying {} buffered payloads on {} for {}",
                pending.len(),
                self.name,
                self.member
            );
            for payload in pending {
                // The receiver is still in scope, so this cannot fail.
                let _ = sender.send(payload);
            }
        }
        let _ = hub.inboxes.insert(key, Inbox::Open(sender));
        Ok(receiver)
    }

    fn unsubscribe(&self) {
        let key = (self.name.clone(), self.member.clone());
        if let Some(Inbox::Buffered(pending)) = self.network.hub.lock().inboxes.remove(&key) {
            trace!(
                "Discarding {} payloads on {} for {}",
                pending.len(),
                self.name,
                self.member
            );
        }
    }
}
