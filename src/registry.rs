// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Durable map from group identifier to the signers this node holds for it.
//!
//! Each signer is stored as its own record in the directory named after the
//! hex group identifier, under the name `membership_<n>`; `n` increases per
//! group and is never reused, even for records that failed to load.

use crate::{
    errors::{InternalError, Result},
    group::GroupId,
    persistence::PersistenceHandle,
    signer::ThresholdSigner,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

const RECORD_PREFIX: &str = "membership_";

#[derive(Default)]
struct RegistryState {
    signers: HashMap<GroupId, Vec<Arc<ThresholdSigner>>>,
    next_sequence: HashMap<GroupId, u64>,
}

impl RegistryState {
    fn reserve_sequence(&mut self, group_id: &GroupId, sequence: u64) {
        let next = self.next_sequence.entry(group_id.clone()).or_insert(0);
        *next = (*next).max(sequence + 1);
    }
}

/// The signers held by this node, grouped by group identifier.
pub struct SignerRegistry {
    persistence: Arc<dyn PersistenceHandle>,
    state: RwLock<RegistryState>,
}

impl std::fmt::Debug for SignerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerRegistry").finish_non_exhaustive()
    }
}

fn parse_sequence(name: &str) -> Option<u64> {
    name.strip_prefix(RECORD_PREFIX)?.parse().ok()
}

impl SignerRegistry {
    /// Create an empty registry backed by `persistence`.
    pub fn new(persistence: Arc<dyn PersistenceHandle>) -> Self {
        Self {
            persistence,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Replace the in-memory contents with everything in storage.
    ///
    /// Entries that cannot be read or decoded are logged and skipped. Only a
    /// failure to list storage at all is returned. Returns the number of
    /// signers loaded.
    #[instrument(skip_all, err(Display))]
    pub async fn load(&self) -> Result<usize> {
        let descriptors = self.persistence.read_all().await?;
        let mut loaded = RegistryState::default();
        let mut count = 0;

        for descriptor in descriptors {
            let location = format!("{}/{}", descriptor.directory, descriptor.name);
            let group_id = match GroupId::from_hex(&descriptor.directory) {
                Ok(group_id) => group_id,
                Err(e) => {
                    warn!("{}", InternalError::RegistryLoadCorruption(format!("{location}: {e}")));
                    continue;
                }
            };
            if let Some(sequence) = parse_sequence(&descriptor.name) {
                loaded.reserve_sequence(&group_id, sequence);
            }

            let signer = descriptor
                .content
                .and_then(|bytes| ThresholdSigner::from_bytes(&bytes))
                .and_then(|signer| {
                    if *signer.group_id() == group_id {
                        Ok(signer)
                    } else {
                        Err(InternalError::MalformedMessage(format!(
                            "record belongs to group {}",
                            signer.group_id()
                        )))
                    }
                });
            match signer {
                Ok(signer) => {
                    debug!("Loaded signer for group {group_id} from {location}");
                    loaded
                        .signers
                        .entry(group_id)
                        .or_default()
                        .push(Arc::new(signer));
                    count += 1;
                }
                Err(e) => {
                    warn!("{}", InternalError::RegistryLoadCorruption(format!("{location}: {e}")))
                }
            }
        }

        *self.state.write().await = loaded;
        info!("Loaded {count} signers");
        Ok(count)
    }

    /// Durably store a new signer for `group_id` and add it to the registry.
    ///
    /// The signer is only added once storage confirmed the write; a failure
    /// is reported as [`InternalError::RegistrySaveFailure`] and leaves the
    /// registry unchanged.
    #[instrument(skip_all, fields(group = %group_id), err(Display))]
    pub async fn save(
        &self,
        group_id: &GroupId,
        signer: ThresholdSigner,
    ) -> Result<Arc<ThresholdSigner>> {
        if signer.group_id() != group_id {
            return Err(InternalError::RegistrySaveFailure(format!(
                "signer belongs to group {}",
                signer.group_id()
            )));
        }
        let bytes = signer
            .to_bytes()
            .map_err(|e| InternalError::RegistrySaveFailure(e.to_string()))?;

        let mut state = self.state.write().await;
        let sequence = state.next_sequence.get(group_id).copied().unwrap_or(0);
        let name = format!("{RECORD_PREFIX}{sequence}");
        self.persistence
            .save(&bytes, &group_id.to_hex(), &name)
            .await
            .map_err(|e| InternalError::RegistrySaveFailure(e.to_string()))?;

        state.reserve_sequence(group_id, sequence);
        let signer = Arc::new(signer);
        state
            .signers
            .entry(group_id.clone())
            .or_default()
            .push(signer.clone());
        info!("Saved signer as {name}");
        Ok(signer)
    }

    /// Call `visitor` once per group with all of its signers.
    ///
    /// Holds the registry read lock for the duration of the walk, so
    /// concurrent saves wait until it finishes.
    pub async fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&GroupId, &[Arc<ThresholdSigner>]),
    {
        let state = self.state.read().await;
        for (group_id, signers) in &state.signers {
            visitor(group_id, signers);
        }
    }

    /// The signers held for `group_id`.
    pub async fn signers(&self, group_id: &GroupId) -> Vec<Arc<ThresholdSigner>> {
        self.state
            .read()
            .await
            .signers
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any signer is held for `group_id`.
    pub async fn contains(&self, group_id: &GroupId) -> bool {
        self.state.read().await.signers.contains_key(group_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        persistence::DiskPersistence,
        test_utils::{formed_group, MemoryPersistence},
    };
    use std::collections::HashSet;

    fn signer_for(group: &[u8]) -> Result<ThresholdSigner> {
        let mut signers = formed_group(group, &["A", "B", "C"], 1)?;
        Ok(signers.remove(1).1)
    }

    async fn groups(registry: &SignerRegistry) -> HashSet<(GroupId, usize)> {
        let mut seen = HashSet::new();
        registry
            .for_each(|group_id, signers| {
                let _ = seen.insert((group_id.clone(), signers.len()));
            })
            .await;
        seen
    }

    #[tokio::test]
    async fn saved_signers_survive_a_restart() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = Arc::new(DiskPersistence::open(dir.path()).await?);
        let g1 = signer_for(b"G1")?;
        let g2 = signer_for(b"G2")?;

        let registry = SignerRegistry::new(storage.clone());
        let _ = registry.save(g1.group_id(), g1.clone()).await?;
        let _ = registry.save(g2.group_id(), g2.clone()).await?;

        let restarted = SignerRegistry::new(storage);
        assert_eq!(restarted.load().await?, 2);
        assert_eq!(
            groups(&restarted).await,
            HashSet::from([(g1.group_id().clone(), 1), (g2.group_id().clone(), 1)])
        );
        assert_eq!(*restarted.signers(g1.group_id()).await[0], g1);
        assert_eq!(*restarted.signers(g2.group_id()).await[0], g2);
        Ok(())
    }

    #[tokio::test]
    async fn a_group_may_hold_several_signers() -> Result<()> {
        let storage = Arc::new(MemoryPersistence::default());
        let registry = SignerRegistry::new(storage.clone());
        let first = signer_for(b"G1")?;
        let second = signer_for(b"G1")?;

        let _ = registry.save(first.group_id(), first.clone()).await?;
        let _ = registry.save(second.group_id(), second.clone()).await?;
        assert_eq!(registry.signers(first.group_id()).await.len(), 2);
        assert_eq!(
            storage.names(),
            vec![
                (first.group_id().to_hex(), "membership_0".to_string()),
                (first.group_id().to_hex(), "membership_1".to_string()),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_entries_are_skipped_and_never_overwritten() -> Result<()> {
        let storage = Arc::new(MemoryPersistence::default());
        let good = signer_for(b"G1")?;
        let dir = good.group_id().to_hex();
        storage.insert(&dir, "membership_0", good.to_bytes()?);
        storage.insert(&dir, "membership_1", b"not a signer".to_vec());
        storage.insert("not-hex", "membership_0", good.to_bytes()?);
        storage.insert_unreadable(&dir, "membership_2");
        // a record filed under the wrong group
        storage.insert(&GroupId::new(b"G9".to_vec()).to_hex(), "membership_0", good.to_bytes()?);

        let registry = SignerRegistry::new(storage.clone());
        assert_eq!(registry.load().await?, 1);
        assert!(!registry.contains(&GroupId::new(b"G9".to_vec())).await);

        let _ = registry.save(good.group_id(), good.clone()).await?;
        assert_eq!(storage.get(&dir, "membership_1"), Some(b"not a signer".to_vec()));
        assert!(storage.get(&dir, "membership_3").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn failed_save_leaves_registry_unchanged() -> Result<()> {
        let storage = Arc::new(MemoryPersistence::default());
        storage.fail_saves(true);
        let registry = SignerRegistry::new(storage.clone());
        let signer = signer_for(b"G1")?;

        let result = registry.save(signer.group_id(), signer.clone()).await;
        assert!(matches!(result, Err(InternalError::RegistrySaveFailure(_))));
        assert!(!registry.contains(signer.group_id()).await);

        storage.fail_saves(false);
        let _ = registry.save(signer.group_id(), signer.clone()).await?;
        assert!(registry.contains(signer.group_id()).await);
        Ok(())
    }

    #[tokio::test]
    async fn signer_must_match_the_group() -> Result<()> {
        let registry = SignerRegistry::new(Arc::new(MemoryPersistence::default()));
        let signer = signer_for(b"G1")?;
        let result = registry.save(&GroupId::new(b"G2".to_vec()), signer).await;
        assert!(matches!(result, Err(InternalError::RegistrySaveFailure(_))));
        Ok(())
    }

    #[tokio::test]
    async fn listing_failure_is_reported() {
        let storage = Arc::new(MemoryPersistence::default());
        storage.fail_reads(true);
        let registry = SignerRegistry::new(storage);
        assert!(registry.load().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn saves_do_not_disturb_iteration() -> Result<()> {
        let registry = Arc::new(SignerRegistry::new(Arc::new(MemoryPersistence::default())));
        let signers: Vec<ThresholdSigner> = (0..4u8)
            .map(|i| signer_for(&[b'G', i]))
            .collect::<Result<_>>()?;

        let writers: Vec<_> = signers
            .into_iter()
            .map(|signer| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.save(&signer.group_id().clone(), signer).await })
            })
            .collect();
        for _ in 0..8 {
            registry
                .for_each(|_, signers| assert_eq!(signers.len(), 1))
                .await;
            tokio::task::yield_now().await;
        }
        for writer in writers {
            let _ = writer
                .await
                .map_err(|_| InternalError::InternalInvariantFailed)??;
        }
        assert_eq!(groups(&registry).await.len(), 4);
        Ok(())
    }
}
