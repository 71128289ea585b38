// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The node orchestrator: wires chain events to the signing engine and the
//! signer registry.
//!
//! [`Client::initialize`] restores every persisted signer and listens for
//! signing requests on its group, watches for new groups this operator was
//! selected into, and keeps trying to register the operator as a member
//! candidate for each sanctioned application. [`Client::start`] does the same
//! with signers stored under the configured storage directory.

use crate::{
    chain::{
        Address, ChainHandle, GroupCreatedEvent, SignatureRequestedEvent, Subscription,
    },
    config::Config,
    errors::{InternalError, Result},
    net::NetworkProvider,
    node::Node,
    persistence::{DiskPersistence, PersistenceHandle},
    protocol::parse_digest,
    registry::SignerRegistry,
    signer::ThresholdSigner,
};
use k256::SecretKey;
use num_bigint::Sign;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, warn};

struct Inner {
    chain: Arc<dyn ChainHandle>,
    node: Node,
    registry: SignerRegistry,
    runtime: Handle,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// A running node. Dropping it stops event handling and registration.
pub struct Client {
    inner: Arc<Inner>,
    registrations: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("node", &self.inner.node)
            .field("subscriptions", &self.inner.subscriptions.lock().len())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Start the node with signers persisted under `config.storage_dir`.
    pub async fn start(
        chain: Arc<dyn ChainHandle>,
        network: Arc<dyn NetworkProvider>,
        static_key: SecretKey,
        config: &Config,
    ) -> Result<Self> {
        config.validate()?;
        let storage = DiskPersistence::open(&config.storage_dir).await?;
        Self::initialize(chain, network, Arc::new(storage), static_key, config).await
    }

    /// Start the node.
    ///
    /// Must be called from within a tokio runtime; event handlers spawn their
    /// work onto it. Fails with [`InternalError::Config`] before anything
    /// starts if `config` is unusable.
    #[instrument(skip_all, fields(operator = %chain.address()), err(Display))]
    pub async fn initialize(
        chain: Arc<dyn ChainHandle>,
        network: Arc<dyn NetworkProvider>,
        persistence: Arc<dyn PersistenceHandle>,
        static_key: SecretKey,
        config: &Config,
    ) -> Result<Self> {
        config.validate()?;
        let node = Node::new(
            chain.clone(),
            network,
            static_key,
            config.protocol,
            config.pool,
        )?;
        node.initialize_pre_params_pool();

        let inner = Arc::new(Inner {
            chain: chain.clone(),
            node,
            registry: SignerRegistry::new(persistence),
            runtime: Handle::current(),
            subscriptions: Mutex::new(Vec::new()),
        });
        let mut client = Client {
            inner: inner.clone(),
            registrations: Vec::new(),
        };

        // Resume every group formed before the restart.
        let _ = inner.registry.load().await?;
        let mut known = Vec::new();
        inner
            .registry
            .for_each(|group_id, signers| {
                known.extend(signers.iter().map(|signer| (group_id.clone(), signer.clone())));
            })
            .await;
        for (group_id, signer) in known {
            register_for_sign_events(&inner, signer).await?;
            debug!("Signer registered for events from group {group_id}");
        }

        let handler_inner = inner.clone();
        let subscription = chain
            .on_group_created(Arc::new(move |event: GroupCreatedEvent| {
                let inner = handler_inner.clone();
                let _ = handler_inner
                    .runtime
                    .spawn(async move { handle_group_created(inner, event).await });
            }))
            .await?;
        inner.subscriptions.lock().push(subscription);

        client.registrations = config
            .sanctioned_applications
            .iter()
            .map(|application| {
                tokio::spawn(register_for_application(
                    chain.clone(),
                    *application,
                    config.registration_retry_interval,
                ))
            })
            .collect();
        Ok(client)
    }

    /// The node's signer registry.
    pub fn registry(&self) -> &SignerRegistry {
        &self.inner.registry
    }

    /// The node driving protocol runs.
    pub fn node(&self) -> &Node {
        &self.inner.node
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for registration in &self.registrations {
            registration.abort();
        }
        // Handlers hold the client state; releasing them breaks the cycle.
        let subscriptions = std::mem::take(&mut *self.inner.subscriptions.lock());
        drop(subscriptions);
    }
}

#[instrument(skip_all, fields(group = %event.group_id))]
async fn handle_group_created(inner: Arc<Inner>, event: GroupCreatedEvent) {
    info!("New group created with {} members", event.members.len());
    if !event.is_member(&inner.node.member_id()) {
        debug!("Not a member of the group, ignoring");
        return;
    }

    let signer = match inner
        .node
        .generate_signer_for_group(&event.group_id, &event.members)
        .await
    {
        Ok(signer) => signer,
        Err(e) if e.is_protocol_failure() => {
            warn!("Signer generation failed: {e}");
            return;
        }
        Err(e) => {
            error!("Signer generation failed: {e}");
            return;
        }
    };
    info!("Initialized signer for group");

    let signer = match inner.registry.save(&event.group_id, signer).await {
        Ok(signer) => signer,
        Err(e) => {
            error!("Failed to register threshold signer: {e}");
            return;
        }
    };

    match signer.public_key_bytes() {
        Ok(public_key) => {
            if let Err(e) = inner
                .chain
                .submit_group_public_key(&event.group_id, public_key)
                .await
            {
                error!("Failed to submit group public key: {e}");
            }
        }
        Err(e) => error!("Failed to encode group public key: {e}"),
    }

    if let Err(e) = register_for_sign_events(&inner, signer).await {
        error!("Failed to watch signing requests: {e}");
    }
}

async fn register_for_sign_events(inner: &Arc<Inner>, signer: Arc<ThresholdSigner>) -> Result<()> {
    let group_id = signer.group_id().clone();
    let handler_inner = inner.clone();
    let subscription = inner
        .chain
        .on_signature_requested(
            &group_id,
            Arc::new(move |event: SignatureRequestedEvent| {
                let inner = handler_inner.clone();
                let signer = signer.clone();
                let _ = handler_inner
                    .runtime
                    .spawn(async move { handle_signature_requested(inner, signer, event).await });
            }),
        )
        .await?;
    inner.subscriptions.lock().push(subscription);
    Ok(())
}

#[instrument(
    skip_all,
    fields(
        group = %event.group_id,
        digest = %hex::encode(&event.digest),
        request_id = event.request_id
    )
)]
async fn handle_signature_requested(
    inner: Arc<Inner>,
    signer: Arc<ThresholdSigner>,
    event: SignatureRequestedEvent,
) {
    info!("New signature requested");
    let digest = match parse_digest(&event.digest) {
        Ok(digest) => digest,
        Err(e) => {
            error!("Rejecting signature request: {e}");
            return;
        }
    };

    match inner.chain.is_awaiting_signature(&event.group_id, &digest).await {
        Ok(true) => {}
        Ok(false) => {
            debug!("Group is not awaiting a signature for this digest, skipping");
            return;
        }
        Err(e) => {
            error!("Failed to check if signature is awaited: {e}");
            return;
        }
    }

    match inner
        .node
        .calculate_signature(&signer, &digest, event.request_id)
        .await
    {
        Ok(_) => info!("Submitted signature"),
        Err(e) if e.is_protocol_failure() => warn!("Signature calculation failed: {e}"),
        Err(e) => error!("Signature calculation failed: {e}"),
    }
}

/// Register the operator as a member candidate for `application`, retrying
/// every `retry_interval` until it succeeds.
///
/// Returns immediately if the operator is already registered or the
/// registration status cannot be read.
#[instrument(skip(chain, retry_interval))]
pub(crate) async fn register_for_application(
    chain: Arc<dyn ChainHandle>,
    application: Address,
    retry_interval: Duration,
) {
    match chain.is_registered(&application).await {
        Ok(true) => {
            debug!("Already registered as member candidate");
            return;
        }
        Ok(false) => {}
        Err(e) => {
            error!("Failed to check if member is registered: {e}");
            return;
        }
    }

    // The first tick completes immediately.
    let mut ticker = interval(retry_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let _ = ticker.tick().await;
        match register_as_member_candidate(chain.as_ref(), &application).await {
            Ok(()) => {
                debug!("Registered as member candidate");
                return;
            }
            Err(e) => warn!("Failed to register as member candidate: {e}"),
        }
    }
}

/// Register for `application` if the operator has positive eligible stake.
pub(crate) async fn register_as_member_candidate(
    chain: &dyn ChainHandle,
    application: &Address,
) -> Result<()> {
    let stake = chain.eligible_stake().await.map_err(|e| {
        InternalError::RegistrationFailed(format!("failed to read stake for {application}: {e}"))
    })?;
    if stake.sign() != Sign::Plus {
        return Err(InternalError::StakeInsufficient);
    }
    chain
        .register_as_member_candidate(application)
        .await
        .map_err(|e| InternalError::RegistrationFailed(format!("{application}: {e}")))
}
