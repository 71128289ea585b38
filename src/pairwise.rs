// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Authenticated encryption of direct protocol messages.
//!
//! Each pair of members derives a symmetric key from an ECDH exchange
//! between their static keys. Sealed payloads are `nonce || ciphertext`,
//! with the sender and recipient identifiers bound in as associated data so
//! a payload cannot be replayed in the other direction or to another member.

use crate::{
    errors::{InternalError, Result},
    group::MemberId,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use k256::{ecdh::diffie_hellman, PublicKey, SecretKey};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::warn;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

/// Symmetric keys shared with every peer whose static key is known.
pub(crate) struct PairwiseChannels {
    me: MemberId,
    static_key: SecretKey,
    keys: HashMap<MemberId, Zeroizing<[u8; 32]>>,
}

impl std::fmt::Debug for PairwiseChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairwiseChannels")
            .field("me", &self.me)
            .field("peers", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PairwiseChannels {
    pub(crate) fn new(me: &MemberId, static_key: &SecretKey) -> Self {
        Self {
            me: me.clone(),
            static_key: static_key.clone(),
            keys: HashMap::new(),
        }
    }

    /// Derive the key shared with `peer`. Replaces any earlier key for it.
    pub(crate) fn add_peer(&mut self, peer: &MemberId, peer_key: &PublicKey) {
        let shared = diffie_hellman(self.static_key.to_nonzero_scalar(), peer_key.as_affine());
        let (low, high) = if self.me <= *peer {
            (&self.me, peer)
        } else {
            (peer, &self.me)
        };

        let mut hasher = Sha256::new();
        hasher.update(b"keep-ecdsa pairwise channel");
        hasher.update(shared.raw_secret_bytes());
        hasher.update((low.as_bytes().len() as u64).to_be_bytes());
        hasher.update(low.as_bytes());
        hasher.update(high.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&hasher.finalize());
        let _ = self.keys.insert(peer.clone(), key);
    }

    pub(crate) fn has_peer(&self, peer: &MemberId) -> bool {
        self.keys.contains_key(peer)
    }

    fn cipher(&self, peer: &MemberId) -> Result<ChaCha20Poly1305> {
        let key = self.keys.get(peer).ok_or_else(|| {
            InternalError::InvalidArgument(format!("no pairwise key for {peer}"))
        })?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(key.as_slice())))
    }

    /// Encrypt `plaintext` for `to`.
    pub(crate) fn seal<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        to: &MemberId,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let cipher = self.cipher(to)?;
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        let aad = associated_data(&self.me, to);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| InternalError::InternalInvariantFailed)?;
        Ok([nonce.as_slice(), &ciphertext].concat())
    }

    /// Decrypt a payload that `from` sealed for this member.
    pub(crate) fn open(&self, from: &MemberId, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return verify_err!(format!("sealed payload from {from} is truncated"));
        }
        let cipher = self.cipher(from)?;
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let aad = associated_data(from, &self.me);
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                warn!("Failed to open payload from {from}");
                InternalError::FailedToVerify(format!("payload from {from} failed authentication"))
            })
    }
}

fn associated_data(from: &MemberId, to: &MemberId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + from.as_bytes().len() + to.as_bytes().len());
    aad.extend_from_slice(&(from.as_bytes().len() as u64).to_be_bytes());
    aad.extend_from_slice(from.as_bytes());
    aad.extend_from_slice(&(to.as_bytes().len() as u64).to_be_bytes());
    aad.extend_from_slice(to.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    struct Peer {
        id: MemberId,
        key: SecretKey,
    }

    fn peer(name: &str) -> Peer {
        Peer {
            id: MemberId::new(name.as_bytes()),
            key: SecretKey::random(&mut OsRng),
        }
    }

    fn channels(me: &Peer, peers: &[&Peer]) -> PairwiseChannels {
        let mut channels = PairwiseChannels::new(&me.id, &me.key);
        for p in peers {
            channels.add_peer(&p.id, &p.key.public_key());
        }
        channels
    }

    #[test]
    fn sealed_payload_opens_for_recipient_only() -> Result<()> {
        let (a, b, c) = (peer("a"), peer("b"), peer("c"));
        let at_a = channels(&a, &[&b, &c]);
        let at_b = channels(&b, &[&a, &c]);
        let at_c = channels(&c, &[&a, &b]);

        let sealed = at_a.seal(&mut OsRng, &b.id, b"share for b")?;
        assert_eq!(at_b.open(&a.id, &sealed)?, b"share for b".to_vec());
        assert!(at_c.open(&a.id, &sealed).is_err());
        Ok(())
    }

    #[test]
    fn payload_is_bound_to_direction() -> Result<()> {
        let (a, b) = (peer("a"), peer("b"));
        let at_a = channels(&a, &[&b]);
        let at_b = channels(&b, &[&a]);

        let sealed = at_a.seal(&mut OsRng, &b.id, b"hello")?;
        // reflecting a's own payload back at it must fail
        assert!(at_a.open(&b.id, &sealed).is_err());
        assert!(at_b.open(&a.id, &sealed).is_ok());
        Ok(())
    }

    #[test]
    fn tampering_and_truncation_are_detected() -> Result<()> {
        let (a, b) = (peer("a"), peer("b"));
        let at_a = channels(&a, &[&b]);
        let at_b = channels(&b, &[&a]);

        let mut sealed = at_a.seal(&mut OsRng, &b.id, b"hello")?;
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(at_b.open(&a.id, &sealed).is_err());
        assert!(at_b.open(&a.id, &sealed[..4]).is_err());
        Ok(())
    }

    #[test]
    fn unknown_peer_is_rejected() {
        let (a, b) = (peer("a"), peer("b"));
        let at_a = channels(&a, &[]);
        assert!(!at_a.has_peer(&b.id));
        assert!(at_a.seal(&mut OsRng, &b.id, b"x").is_err());
    }
}
