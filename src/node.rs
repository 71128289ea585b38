// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! A node's entry points into the signing engine.
//!
//! [`Node`] owns what protocol runs share: the operator's static key, the
//! warm parameter pool, the phase timeouts, and one share lock per signer.

use crate::{
    chain::ChainHandle,
    config::ProtocolConfig,
    errors::Result,
    group::{GroupId, GroupInfo, MemberId},
    net::NetworkProvider,
    params::{PoolConfig, PreParamsPool},
    protocol::{self, formation_channel, parse_digest, signing_channel, ShareLock},
    sign::Signature,
    signer::ThresholdSigner,
};
use k256::SecretKey;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tracing::{info, instrument};

type SignerKey = (GroupId, MemberId);

/// Runs group formation and signing on behalf of one operator.
pub struct Node {
    chain: Arc<dyn ChainHandle>,
    network: Arc<dyn NetworkProvider>,
    static_key: SecretKey,
    protocol: ProtocolConfig,
    pool: PreParamsPool,
    share_locks: Mutex<HashMap<SignerKey, Arc<ShareLock>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.chain.address())
            .field("protocol", &self.protocol)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Create a node for the operator holding `static_key`.
    pub fn new(
        chain: Arc<dyn ChainHandle>,
        network: Arc<dyn NetworkProvider>,
        static_key: SecretKey,
        protocol: ProtocolConfig,
        pool: PoolConfig,
    ) -> Result<Self> {
        Ok(Self {
            chain,
            network,
            static_key,
            protocol,
            pool: PreParamsPool::new(pool)?,
            share_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Start filling the warm parameter pool in the background.
    pub fn initialize_pre_params_pool(&self) {
        self.pool.start_refill();
    }

    /// This operator's member identifier.
    pub fn member_id(&self) -> MemberId {
        MemberId::from(self.chain.address())
    }

    /// Form the group `group_id` with `members` and return this member's
    /// signer.
    ///
    /// The dishonest threshold is the largest one signing supports for the
    /// group size.
    #[instrument(skip_all, fields(group = %group_id))]
    pub async fn generate_signer_for_group(
        &self,
        group_id: &GroupId,
        members: &[MemberId],
    ) -> Result<ThresholdSigner> {
        let threshold = members.len().saturating_sub(1) / 2;
        let group = GroupInfo::new(
            group_id.clone(),
            self.member_id(),
            self.static_key.public_key(),
            members.to_vec(),
            threshold,
        )?;
        let params = self.pool.take(threshold).await;
        let channel = self
            .network
            .channel_for(&formation_channel(group_id))
            .await?;
        let signer =
            protocol::generate_signer(&group, &self.static_key, params, channel, &self.protocol)
                .await?;
        info!(
            "Formed group with {} members, dishonest threshold {threshold}",
            members.len()
        );
        Ok(signer)
    }

    /// Answer signing request `request_id` for `digest` with `signer` and
    /// submit the result to the chain.
    ///
    /// Every member must pass the same `request_id` for a request. Runs for
    /// the same signer take its share lock for each local step and release
    /// it while waiting on peers; runs for different signers never contend.
    #[instrument(
        skip_all,
        fields(
            group = %signer.group_id(),
            digest = %hex::encode(digest),
            request_id = request_id
        )
    )]
    pub async fn calculate_signature(
        &self,
        signer: &ThresholdSigner,
        digest: &[u8],
        request_id: u64,
    ) -> Result<Signature> {
        let digest = parse_digest(digest)?;
        let share_lock = self
            .share_locks
            .lock()
            .entry((signer.group_id().clone(), signer.member_id().clone()))
            .or_default()
            .clone();

        let channel = self
            .network
            .channel_for(&signing_channel(signer.group_id(), &digest, request_id))
            .await?;
        let signature = protocol::calculate_signature(
            signer,
            &digest,
            request_id,
            &self.static_key,
            channel,
            &share_lock,
            &self.protocol,
        )
        .await?;
        info!("Calculated signature");

        self.chain
            .submit_signature(signer.group_id(), &signature)
            .await?;
        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::InternalError,
        net::local::LocalNetwork,
        test_utils::{init_testing, operator, MockChain},
    };
    use futures::future::join_all;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    fn test_config() -> ProtocolConfig {
        ProtocolConfig {
            join_timeout: Duration::from_secs(10),
            announce_timeout: Duration::from_secs(10),
            keygen_round_timeout: Duration::from_secs(10),
            signing_round_timeout: Duration::from_secs(10),
        }
    }

    /// Have `member` answer request `request_id` after `delay`.
    fn signing(
        nodes: &[Arc<Node>],
        signers: &[ThresholdSigner],
        member: usize,
        digest: [u8; 32],
        request_id: u64,
        delay: Duration,
    ) -> JoinHandle<Result<Signature>> {
        let node = nodes[member].clone();
        let signer = signers[member].clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            node.calculate_signature(&signer, &digest, request_id).await
        })
    }

    fn nodes(chain: &MockChain, network: &LocalNetwork, names: &[&str]) -> Result<Vec<Arc<Node>>> {
        names
            .iter()
            .map(|name| {
                let (address, key) = operator(name);
                let provider = network.provider(MemberId::from(address));
                Ok(Arc::new(Node::new(
                    Arc::new(chain.for_operator(address)),
                    Arc::new(provider),
                    key,
                    test_config(),
                    PoolConfig {
                        target_size: 1,
                        max_threshold: 2,
                    },
                )?))
            })
            .collect()
    }

    async fn form(nodes: &[Arc<Node>], group_id: &GroupId) -> Result<Vec<ThresholdSigner>> {
        let members: Vec<MemberId> = nodes.iter().map(|node| node.member_id()).collect();
        let runs = nodes.iter().map(|node| {
            let node = node.clone();
            let members = members.clone();
            let group_id = group_id.clone();
            tokio::spawn(async move { node.generate_signer_for_group(&group_id, &members).await })
        });
        join_all(runs)
            .await
            .into_iter()
            .map(|joined| joined.map_err(|_| InternalError::InternalInvariantFailed)?)
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn threshold_follows_group_size() -> Result<()> {
        init_testing();
        let chain = MockChain::new();
        let network = LocalNetwork::new();
        let nodes = nodes(&chain, &network, &["A", "B", "C", "D", "E"])?;
        let signers = form(&nodes, &GroupId::new(b"G1".to_vec())).await?;
        for signer in &signers {
            assert_eq!(signer.group_info().dishonest_threshold(), 2);
            assert_eq!(signer.group_info().group_size(), 5);
        }
        Ok(())
    }

    #[tokio::test]
    async fn bad_digest_is_rejected_before_any_run() -> Result<()> {
        let chain = MockChain::new();
        let network = LocalNetwork::new();
        let nodes = nodes(&chain, &network, &["A"])?;
        let signer = crate::test_utils::formed_group(b"G1", &["A", "B", "C"], 1)?
            .remove(0)
            .1;
        let result = nodes[0].calculate_signature(&signer, &[0u8; 33], 1).await;
        assert_eq!(result.err(), Some(InternalError::InvalidDigest(33)));
        assert!(chain.submitted_signatures().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn members_taking_requests_in_different_orders_sign_both() -> Result<()> {
        init_testing();
        let chain = MockChain::new();
        let network = LocalNetwork::new();
        let nodes = nodes(&chain, &network, &["A", "B", "C"])?;
        let signers = form(&nodes, &GroupId::new(b"G1".to_vec())).await?;
        let (first, second) = ([1u8; 32], [2u8; 32]);

        // B starts on the second request while A and C start on the first.
        let later = Duration::from_millis(150);
        let requests = vec![
            (second, signing(&nodes, &signers, 1, second, 2, Duration::ZERO)),
            (first, signing(&nodes, &signers, 0, first, 1, Duration::ZERO)),
            (first, signing(&nodes, &signers, 2, first, 1, Duration::ZERO)),
            (second, signing(&nodes, &signers, 0, second, 2, later)),
            (first, signing(&nodes, &signers, 1, first, 1, later)),
            (second, signing(&nodes, &signers, 2, second, 2, later)),
        ];

        let public_key = signers[0].public_key()?;
        for (digest, request) in requests {
            let signature = request
                .await
                .map_err(|_| InternalError::InternalInvariantFailed)??;
            assert!(signature.verify(&public_key, &digest));
        }
        assert_eq!(chain.submitted_signatures().len(), 6);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_digest_twice_runs_as_two_requests() -> Result<()> {
        init_testing();
        let chain = MockChain::new();
        let network = LocalNetwork::new();
        let nodes = nodes(&chain, &network, &["A", "B", "C"])?;
        let signers = form(&nodes, &GroupId::new(b"G2".to_vec())).await?;
        let digest = [5u8; 32];

        let mut requests = Vec::new();
        for request_id in [1, 2] {
            for member in 0..3 {
                let request = signing(&nodes, &signers, member, digest, request_id, Duration::ZERO);
                requests.push(request);
            }
        }
        let public_key = signers[0].public_key()?;
        for signature in join_all(requests).await {
            let signature = signature.map_err(|_| InternalError::InternalInvariantFailed)??;
            assert!(signature.verify(&public_key, &digest));
        }
        assert_eq!(nodes[0].share_locks.lock().len(), 1);
        Ok(())
    }
}
