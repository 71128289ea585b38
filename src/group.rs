// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Group and member identities, and the immutable description of a signing
//! group as seen by one of its members.

use crate::{
    chain::Address,
    errors::{InternalError, Result},
    serialization,
};
use k256::PublicKey;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt};

/// Identifies a member of a signing group. Usually an operator address.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(Vec<u8>);

impl MemberId {
    /// Wrap raw identifier bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        MemberId(bytes.into())
    }

    /// The raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the identifier carries no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Address> for MemberId {
    fn from(address: Address) -> Self {
        MemberId(address.as_bytes().to_vec())
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId({self})")
    }
}

/// Identifies a signing group. Usually the address of the group's on-chain
/// contract.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(Vec<u8>);

impl GroupId {
    /// Wrap raw identifier bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        GroupId(bytes.into())
    }

    /// The raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex of the identifier, without a prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parse the output of [`GroupId::to_hex`].
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded)
            .map_err(|e| InternalError::InvalidArgument(format!("invalid group id: {e}")))?;
        if bytes.is_empty() {
            return arg_err!("group id must not be empty");
        }
        Ok(GroupId(bytes))
    }
}

impl From<Address> for GroupId {
    fn from(address: Address) -> Self {
        GroupId(address.as_bytes().to_vec())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({self})")
    }
}

/// Everything a member knows about the signing group it belongs to.
///
/// A `GroupInfo` can only be built through [`GroupInfo::new`] (or by decoding
/// one), which guarantees:
/// - member identifiers are non-empty and pairwise distinct,
/// - this member appears in the member list,
/// - `dishonest_threshold < group size`.
///
/// A member's protocol index is its 1-based position in the member list.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawGroupInfo", into = "RawGroupInfo")]
pub struct GroupInfo {
    group_id: GroupId,
    member_id: MemberId,
    member_public_key: PublicKey,
    group_member_ids: Vec<MemberId>,
    dishonest_threshold: usize,
}

#[derive(Clone, Serialize, Deserialize)]
struct RawGroupInfo {
    group_id: GroupId,
    member_id: MemberId,
    #[serde(with = "serialization::public_key")]
    member_public_key: PublicKey,
    group_member_ids: Vec<MemberId>,
    dishonest_threshold: usize,
}

impl TryFrom<RawGroupInfo> for GroupInfo {
    type Error = InternalError;

    fn try_from(raw: RawGroupInfo) -> Result<Self> {
        GroupInfo::new(
            raw.group_id,
            raw.member_id,
            raw.member_public_key,
            raw.group_member_ids,
            raw.dishonest_threshold,
        )
    }
}

impl From<GroupInfo> for RawGroupInfo {
    fn from(info: GroupInfo) -> Self {
        RawGroupInfo {
            group_id: info.group_id,
            member_id: info.member_id,
            member_public_key: info.member_public_key,
            group_member_ids: info.group_member_ids,
            dishonest_threshold: info.dishonest_threshold,
        }
    }
}

impl GroupInfo {
    /// Build a validated group description.
    pub fn new(
        group_id: GroupId,
        member_id: MemberId,
        member_public_key: PublicKey,
        group_member_ids: Vec<MemberId>,
        dishonest_threshold: usize,
    ) -> Result<Self> {
        if group_id.as_bytes().is_empty() {
            return arg_err!("group id must not be empty");
        }
        let mut seen = HashSet::new();
        for id in &group_member_ids {
            if id.is_empty() {
                return arg_err!("member ids must not be empty");
            }
            if !seen.insert(id) {
                return bail!("member {id} appears more than once in group {group_id}");
            }
        }
        if !seen.contains(&member_id) {
            return bail!("member {member_id} is not part of group {group_id}");
        }
        if dishonest_threshold >= group_member_ids.len() {
            return bail!(
                "dishonest threshold {dishonest_threshold} must be smaller than group size {}",
                group_member_ids.len()
            );
        }

        Ok(Self {
            group_id,
            member_id,
            member_public_key,
            group_member_ids,
            dishonest_threshold,
        })
    }

    /// The group this description belongs to.
    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// The member holding this description.
    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    /// The static public key this member announces to its peers.
    pub fn member_public_key(&self) -> &PublicKey {
        &self.member_public_key
    }

    /// All members of the group, in protocol order.
    pub fn group_member_ids(&self) -> &[MemberId] {
        &self.group_member_ids
    }

    /// Maximum number of members that may misbehave.
    pub fn dishonest_threshold(&self) -> usize {
        self.dishonest_threshold
    }

    /// Number of members in the group.
    pub fn group_size(&self) -> usize {
        self.group_member_ids.len()
    }

    /// Number of members that must take part before a formation phase can
    /// move on.
    pub fn quorum(&self) -> usize {
        self.group_size() - self.dishonest_threshold
    }

    /// Whether `id` is part of the group.
    pub fn is_member(&self, id: &MemberId) -> bool {
        self.group_member_ids.contains(id)
    }

    /// 1-based protocol index of `id`, if it is a member.
    pub fn member_index(&self, id: &MemberId) -> Option<usize> {
        self.group_member_ids
            .iter()
            .position(|member| member == id)
            .map(|position| position + 1)
    }

    /// Every member except this one.
    pub fn other_member_ids(&self) -> Vec<MemberId> {
        self.group_member_ids
            .iter()
            .filter(|id| **id != self.member_id)
            .cloned()
            .collect()
    }
}

impl fmt::Debug for GroupInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupInfo")
            .field("group_id", &self.group_id)
            .field("member_id", &self.member_id)
            .field("group_member_ids", &self.group_member_ids)
            .field("dishonest_threshold", &self.dishonest_threshold)
            .finish()
    }
}
