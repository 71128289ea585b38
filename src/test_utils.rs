// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Shared fixtures for unit and integration tests: deterministic operators,
//! pre-formed groups, an in-memory store, and a scriptable chain.

use crate::{
    chain::{
        Address, ChainHandle, GroupCreatedEvent, GroupCreatedHandler, SignatureRequestedEvent,
        SignatureRequestedHandler, Subscription,
    },
    errors::{InternalError, Result},
    group::{GroupId, GroupInfo, MemberId},
    keygen::KeygenParticipant,
    params::PreParams,
    participant::tests::{run_participants, DeliveryFilter},
    persistence::{DataDescriptor, PersistenceHandle},
    sign::Signature,
    signer::ThresholdSigner,
};
use async_trait::async_trait;
use k256::{PublicKey, SecretKey};
use num_bigint::BigInt;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Weak},
};
use tracing_subscriber::EnvFilter;

/// Install a log subscriber controlled by `RUST_LOG`. Safe to call from every
/// test.
pub(crate) fn init_testing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .without_time()
        .compact()
        .try_init();
}

/// A fresh static key and an address derived from `name`.
pub(crate) fn operator(name: &str) -> (Address, SecretKey) {
    let hash = Sha256::digest(name.as_bytes());
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[..20]);
    (Address::new(address), SecretKey::random(&mut OsRng))
}

/// One `GroupInfo` per name, each with a fresh static key. Member ids are the
/// name bytes.
pub(crate) fn group_members(
    group_id: &[u8],
    names: &[&str],
    threshold: usize,
) -> Result<Vec<(GroupInfo, SecretKey)>> {
    let members: Vec<MemberId> = names.iter().map(|name| MemberId::new(name.as_bytes())).collect();
    members
        .iter()
        .map(|id| {
            let key = SecretKey::random(&mut OsRng);
            let group = GroupInfo::new(
                GroupId::new(group_id.to_vec()),
                id.clone(),
                key.public_key(),
                members.clone(),
                threshold,
            )?;
            Ok((group, key))
        })
        .collect()
}

/// Signers for a group formed in memory, without any networking.
pub(crate) fn formed_group(
    group_id: &[u8],
    names: &[&str],
    threshold: usize,
) -> Result<Vec<(SecretKey, ThresholdSigner)>> {
    let members = group_members(group_id, names, threshold)?;
    let mut rng = OsRng;
    let participants = members
        .iter()
        .map(|(group, _)| {
            let params = PreParams::generate(&mut rng, threshold);
            KeygenParticipant::new(&mut rng, group, params)
        })
        .collect::<Result<Vec<_>>>()?;
    let member_keys: Vec<PublicKey> = members.iter().map(|(_, key)| key.public_key()).collect();
    let shares = run_participants(participants, DeliveryFilter::none())?;

    members
        .into_iter()
        .zip(shares)
        .map(|((group, key), share)| {
            let signer = ThresholdSigner::new(group, &share.with_member_keys(member_keys.clone()))?;
            Ok((key, signer))
        })
        .collect()
}

#[derive(Default)]
struct Records {
    entries: BTreeMap<(String, String), Option<Vec<u8>>>,
    fail_saves: bool,
    fail_reads: bool,
}

/// Storage kept in memory, with switches to make it fail.
#[derive(Default)]
pub(crate) struct MemoryPersistence {
    records: Mutex<Records>,
}

impl MemoryPersistence {
    pub(crate) fn insert(&self, directory: &str, name: &str, data: Vec<u8>) {
        let _ = self
            .records
            .lock()
            .entries
            .insert((directory.into(), name.into()), Some(data));
    }

    /// Add an entry whose content cannot be read.
    pub(crate) fn insert_unreadable(&self, directory: &str, name: &str) {
        let _ = self
            .records
            .lock()
            .entries
            .insert((directory.into(), name.into()), None);
    }

    pub(crate) fn get(&self, directory: &str, name: &str) -> Option<Vec<u8>> {
        self.records
            .lock()
            .entries
            .get(&(directory.to_string(), name.to_string()))
            .cloned()
            .flatten()
    }

    /// Every `(directory, name)` pair, sorted.
    pub(crate) fn names(&self) -> Vec<(String, String)> {
        self.records.lock().entries.keys().cloned().collect()
    }

    pub(crate) fn fail_saves(&self, fail: bool) {
        self.records.lock().fail_saves = fail;
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.records.lock().fail_reads = fail;
    }
}

#[async_trait]
impl PersistenceHandle for MemoryPersistence {
    async fn save(&self, data: &[u8], directory: &str, name: &str) -> Result<()> {
        let mut records = self.records.lock();
        if records.fail_saves {
            return Err(InternalError::Persistence("disk full".into()));
        }
        let _ = records
            .entries
            .insert((directory.into(), name.into()), Some(data.to_vec()));
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<DataDescriptor>> {
        let records = self.records.lock();
        if records.fail_reads {
            return Err(InternalError::Persistence("storage unavailable".into()));
        }
        Ok(records
            .entries
            .iter()
            .map(|((directory, name), content)| DataDescriptor {
                directory: directory.clone(),
                name: name.clone(),
                content: content
                    .clone()
                    .ok_or_else(|| InternalError::Persistence(format!("cannot read {name}"))),
            })
            .collect())
    }
}

struct World {
    next_handler: u64,
    group_handlers: HashMap<u64, GroupCreatedHandler>,
    sign_handlers: HashMap<u64, (Address, GroupId, SignatureRequestedHandler)>,
    stake_script: VecDeque<BigInt>,
    stake: BigInt,
    stake_reads: usize,
    registered: HashSet<(Address, Address)>,
    registration_attempts: usize,
    public_keys: Vec<(Address, GroupId, [u8; 64])>,
    signatures: Vec<(Address, GroupId, Signature)>,
    awaiting: bool,
    next_request: u64,
}

/// An in-memory chain shared by any number of operators.
#[derive(Clone)]
pub(crate) struct MockChain {
    world: Arc<Mutex<World>>,
}

impl MockChain {
    /// A chain where every operator has stake and every request is awaited.
    pub(crate) fn new() -> Self {
        Self {
            world: Arc::new(Mutex::new(World {
                next_handler: 0,
                group_handlers: HashMap::new(),
                sign_handlers: HashMap::new(),
                stake_script: VecDeque::new(),
                stake: BigInt::from(1),
                stake_reads: 0,
                registered: HashSet::new(),
                registration_attempts: 0,
                public_keys: Vec::new(),
                signatures: Vec::new(),
                awaiting: true,
                next_request: 0,
            })),
        }
    }

    /// The chain as seen by the operator at `address`.
    pub(crate) fn for_operator(&self, address: Address) -> MockChainHandle {
        MockChainHandle {
            address,
            world: self.world.clone(),
        }
    }

    /// Return these stakes from successive reads, then keep returning the
    /// last one.
    pub(crate) fn script_stake(&self, stakes: impl IntoIterator<Item = BigInt>) {
        let mut world = self.world.lock();
        world.stake_script = stakes.into_iter().collect();
        if let Some(last) = world.stake_script.back() {
            world.stake = last.clone();
        }
    }

    pub(crate) fn stake_reads(&self) -> usize {
        self.world.lock().stake_reads
    }

    pub(crate) fn mark_registered(&self, operator: Address, application: Address) {
        let _ = self.world.lock().registered.insert((operator, application));
    }

    pub(crate) fn is_registered(&self, operator: Address, application: Address) -> bool {
        self.world.lock().registered.contains(&(operator, application))
    }

    pub(crate) fn registration_attempts(&self) -> usize {
        self.world.lock().registration_attempts
    }

    pub(crate) fn set_awaiting(&self, awaiting: bool) {
        self.world.lock().awaiting = awaiting;
    }

    /// Deliver a group-created event to every subscribed operator.
    pub(crate) fn emit_group_created(&self, group_id: GroupId, members: Vec<MemberId>) {
        let handlers: Vec<GroupCreatedHandler> =
            self.world.lock().group_handlers.values().cloned().collect();
        for handler in handlers {
            handler(GroupCreatedEvent {
                group_id: group_id.clone(),
                members: members.clone(),
            });
        }
    }

    /// Deliver a signature request to every operator watching `group_id`.
    /// Returns the request id the operators saw.
    pub(crate) fn request_signature(&self, group_id: &GroupId, digest: Vec<u8>) -> u64 {
        let (request_id, handlers) = {
            let mut world = self.world.lock();
            world.next_request += 1;
            let handlers: Vec<SignatureRequestedHandler> = world
                .sign_handlers
                .values()
                .filter(|(_, watched, _)| watched == group_id)
                .map(|(_, _, handler)| handler.clone())
                .collect();
            (world.next_request, handlers)
        };
        for handler in handlers {
            handler(SignatureRequestedEvent {
                group_id: group_id.clone(),
                digest: digest.clone(),
                request_id,
            });
        }
        request_id
    }

    /// Groups whose signing requests `operator` is watching, sorted.
    pub(crate) fn sign_subscriptions(&self, operator: Address) -> Vec<GroupId> {
        let mut groups: Vec<GroupId> = self
            .world
            .lock()
            .sign_handlers
            .values()
            .filter(|(address, _, _)| *address == operator)
            .map(|(_, group_id, _)| group_id.clone())
            .collect();
        groups.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
        groups
    }

    pub(crate) fn group_subscriptions(&self) -> usize {
        self.world.lock().group_handlers.len()
    }

    pub(crate) fn submitted_public_keys(&self) -> Vec<(Address, GroupId, [u8; 64])> {
        self.world.lock().public_keys.clone()
    }

    pub(crate) fn submitted_signatures(&self) -> Vec<(Address, GroupId, Signature)> {
        self.world.lock().signatures.clone()
    }
}

/// One operator's connection to a [`MockChain`].
pub(crate) struct MockChainHandle {
    address: Address,
    world: Arc<Mutex<World>>,
}

fn cancel_handler(world: Weak<Mutex<World>>, id: u64) -> Subscription {
    Subscription::new(move || {
        if let Some(world) = world.upgrade() {
            let mut world = world.lock();
            let _ = world.group_handlers.remove(&id);
            let _ = world.sign_handlers.remove(&id);
        }
    })
}

#[async_trait]
impl ChainHandle for MockChainHandle {
    fn address(&self) -> Address {
        self.address
    }

    async fn on_group_created(&self, handler: GroupCreatedHandler) -> Result<Subscription> {
        let mut world = self.world.lock();
        let id = world.next_handler;
        world.next_handler += 1;
        let _ = world.group_handlers.insert(id, handler);
        Ok(cancel_handler(Arc::downgrade(&self.world), id))
    }

    async fn on_signature_requested(
        &self,
        group_id: &GroupId,
        handler: SignatureRequestedHandler,
    ) -> Result<Subscription> {
        let mut world = self.world.lock();
        let id = world.next_handler;
        world.next_handler += 1;
        let _ = world
            .sign_handlers
            .insert(id, (self.address, group_id.clone(), handler));
        Ok(cancel_handler(Arc::downgrade(&self.world), id))
    }

    async fn eligible_stake(&self) -> Result<BigInt> {
        let mut world = self.world.lock();
        world.stake_reads += 1;
        Ok(match world.stake_script.pop_front() {
            Some(stake) => stake,
            None => world.stake.clone(),
        })
    }

    async fn is_registered(&self, application: &Address) -> Result<bool> {
        Ok(self
            .world
            .lock()
            .registered
            .contains(&(self.address, *application)))
    }

    async fn register_as_member_candidate(&self, application: &Address) -> Result<()> {
        let mut world = self.world.lock();
        world.registration_attempts += 1;
        let _ = world.registered.insert((self.address, *application));
        Ok(())
    }

    async fn submit_group_public_key(&self, group_id: &GroupId, public_key: [u8; 64]) -> Result<()> {
        self.world
            .lock()
            .public_keys
            .push((self.address, group_id.clone(), public_key));
        Ok(())
    }

    async fn submit_signature(&self, group_id: &GroupId, signature: &Signature) -> Result<()> {
        self.world
            .lock()
            .signatures
            .push((self.address, group_id.clone(), *signature));
        Ok(())
    }

    async fn is_awaiting_signature(&self, _group_id: &GroupId, _digest: &[u8; 32]) -> Result<bool> {
        Ok(self.world.lock().awaiting)
    }
}
