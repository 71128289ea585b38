// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Precomputed key generation parameters and the warm pool that holds them.
//!
//! A [`PreParams`] is independent of any group: it is a random polynomial of
//! the largest supported degree, its Feldman commitments, and a Schnorr
//! commitment for the proof of knowledge of its constant term. A key
//! generation run for dishonest threshold `t` keeps the first `t + 1`
//! coefficients.
//!
//! [`PreParamsPool`] is a bounded producer/consumer queue. A background task
//! keeps it topped up to [`PoolConfig::target_size`]; withdrawals never block
//! on the producer and fall back to inline generation when the pool is empty.

use crate::{
    errors::{InternalError, Result},
    utils::{CurvePoint, Polynomial},
    zkp::pisch::PiSchPrecommit,
};
use rand::{rngs::OsRng, CryptoRng, RngCore};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, trace};

/// Tunables for the warm parameter pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of parameter sets the background producer keeps ready.
    pub target_size: usize,
    /// Largest dishonest threshold a pooled parameter set can serve.
    pub max_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_size: 4,
            max_threshold: 16,
        }
    }
}

/// One group-independent set of key generation parameters.
pub struct PreParams {
    polynomial: Polynomial,
    commitments: Vec<CurvePoint>,
    schnorr_precommit: PiSchPrecommit,
}

impl std::fmt::Debug for PreParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreParams")
            .field("max_threshold", &self.max_threshold())
            .finish_non_exhaustive()
    }
}

impl PreParams {
    /// Generate a parameter set able to serve any threshold up to
    /// `max_threshold`.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R, max_threshold: usize) -> Self {
        let polynomial = Polynomial::random(rng, max_threshold);
        let commitments = polynomial.commit();
        let schnorr_precommit = PiSchPrecommit::generate(rng);
        Self {
            polynomial,
            commitments,
            schnorr_precommit,
        }
    }

    /// Largest dishonest threshold this set can serve.
    pub fn max_threshold(&self) -> usize {
        self.polynomial.degree()
    }

    /// Commitment to the secret this parameter set contributes.
    pub(crate) fn constant_commitment(&self) -> CurvePoint {
        self.commitments
            .first()
            .copied()
            .unwrap_or(CurvePoint::IDENTITY)
    }

    /// Split into the degree-`threshold` polynomial, its commitments and the
    /// Schnorr commitment.
    pub(crate) fn into_parts(
        self,
        threshold: usize,
    ) -> Result<(Polynomial, Vec<CurvePoint>, PiSchPrecommit)> {
        if threshold > self.max_threshold() {
            return bail!(
                "parameter set serves thresholds up to {}, {threshold} requested",
                self.max_threshold()
            );
        }
        let polynomial = self.polynomial.truncate(threshold + 1);
        let commitments = self.commitments[..=threshold].to_vec();
        Ok((polynomial, commitments, self.schnorr_precommit))
    }
}

/// Shared pool of [`PreParams`], drawn down by key generation runs.
#[derive(Debug)]
pub struct PreParamsPool {
    config: PoolConfig,
    sender: mpsc::Sender<PreParams>,
    receiver: Mutex<mpsc::Receiver<PreParams>>,
    refilling: AtomicBool,
}

impl PreParamsPool {
    /// Create an empty pool. Nothing is generated until
    /// [`PreParamsPool::start_refill`] is called.
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.target_size == 0 {
            return Err(InternalError::Config(
                "pre-parameter pool target size must be positive".into(),
            ));
        }
        let (sender, receiver) = mpsc::channel(config.target_size);
        Ok(Self {
            config,
            sender,
            receiver: Mutex::new(receiver),
            refilling: AtomicBool::new(false),
        })
    }

    /// The pool's tunables.
    pub fn config(&self) -> PoolConfig {
        self.config
    }

    /// Start the background producer. Calling it again has no effect.
    ///
    /// The producer blocks whenever the pool holds `target_size` entries and
    /// exits once the pool is dropped. Must be called from within a tokio
    /// runtime.
    #[instrument(skip_all)]
    pub fn start_refill(&self) {
        if self.refilling.swap(true, Ordering::SeqCst) {
            return;
        }
        let sender = self.sender.clone();
        let max_threshold = self.config.max_threshold;
        info!(
            "Starting pre-parameter producer, target {} entries",
            self.config.target_size
        );
        let _ = tokio::task::spawn_blocking(move || {
            let mut rng = OsRng;
            loop {
                let params = PreParams::generate(&mut rng, max_threshold);
                if sender.blocking_send(params).is_err() {
                    debug!("Pre-parameter pool closed, stopping producer");
                    break;
                }
                trace!("Added a parameter set to the pool");
            }
        });
    }

    /// Withdraw one parameter set able to serve `threshold`.
    ///
    /// Each pooled entry is handed out at most once. When the pool is empty,
    /// or the pooled entries are too small, a fresh set is generated inline.
    pub async fn take(&self, threshold: usize) -> PreParams {
        let pooled = {
            let mut receiver = self.receiver.lock().await;
            receiver.try_recv().ok()
        };
        match pooled {
            Some(params) if params.max_threshold() >= threshold => {
                trace!("Using pooled parameters");
                params
            }
            _ => {
                debug!("Pre-parameter pool empty, generating parameters inline");
                PreParams::generate(&mut OsRng, threshold.max(self.config.max_threshold))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::evaluate_commitments;
    use std::time::Duration;

    #[test]
    fn truncated_parameters_stay_consistent() -> Result<()> {
        let params = PreParams::generate(&mut OsRng, 5);
        assert_eq!(params.max_threshold(), 5);
        let constant = params.constant_commitment();

        let (polynomial, commitments, _) = params.into_parts(2)?;
        assert_eq!(polynomial.degree(), 2);
        assert_eq!(commitments.len(), 3);
        assert_eq!(commitments[0], constant);

        let x = crate::utils::index_scalar(3);
        assert_eq!(
            evaluate_commitments(&commitments, &x),
            CurvePoint::base_mul(&polynomial.evaluate(&x))
        );
        Ok(())
    }

    #[test]
    fn oversized_threshold_is_rejected() {
        let params = PreParams::generate(&mut OsRng, 1);
        assert!(params.into_parts(2).is_err());
    }

    #[test]
    fn zero_target_size_is_rejected() {
        let config = PoolConfig {
            target_size: 0,
            ..PoolConfig::default()
        };
        assert!(PreParamsPool::new(config).is_err());
    }

    #[tokio::test]
    async fn empty_pool_generates_inline() -> Result<()> {
        let pool = PreParamsPool::new(PoolConfig {
            target_size: 2,
            max_threshold: 3,
        })?;
        let params = pool.take(5).await;
        assert!(params.max_threshold() >= 5);
        Ok(())
    }

    #[tokio::test]
    async fn withdrawals_never_share_parameters() -> Result<()> {
        let pool = PreParamsPool::new(PoolConfig {
            target_size: 2,
            max_threshold: 2,
        })?;
        pool.start_refill();
        pool.start_refill();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut seen = Vec::new();
        for _ in 0..6 {
            let params = pool.take(1).await;
            let constant = params.constant_commitment();
            assert!(!seen.contains(&constant));
            seen.push(constant);
        }
        Ok(())
    }
}
