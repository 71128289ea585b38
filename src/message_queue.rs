// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Round messages that arrived before their participant could use them.
//!
//! Participants park early messages in a [`MessageQueue`] keyed by
//! [`MessageType`] and drain them once the matching round starts.

#[cfg(test)]
use crate::group::MemberId;
use crate::messages::{MessageType, RoundMessage};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub(crate) struct MessageQueue(HashMap<MessageType, Vec<RoundMessage>>);

impl MessageQueue {
    pub(crate) fn store(&mut self, message: RoundMessage) {
        self.0
            .entry(message.message_type())
            .or_default()
            .push(message);
    }

    /// Remove and return every message of `message_type`, oldest first.
    pub(crate) fn retrieve_all_of_type(&mut self, message_type: MessageType) -> Vec<RoundMessage> {
        self.take(message_type, |_| true)
    }

    /// Remove and return the messages of `message_type` sent by `sender`.
    #[cfg(test)]
    pub(crate) fn retrieve(
        &mut self,
        message_type: MessageType,
        sender: &MemberId,
    ) -> Vec<RoundMessage> {
        self.take(message_type, |message| message.from() == sender)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    fn take(
        &mut self,
        message_type: MessageType,
        wanted: impl Fn(&RoundMessage) -> bool,
    ) -> Vec<RoundMessage> {
        let Some(queued) = self.0.remove(&message_type) else {
            return Vec::new();
        };
        let (taken, kept): (Vec<_>, Vec<_>) = queued.into_iter().partition(|m| wanted(m));
        if !kept.is_empty() {
            let _ = self.0.insert(message_type, kept);
        }
        taken
    }
}
