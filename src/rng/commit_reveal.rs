//! Commit-reveal protocol
//!
//! Per round: `uncommitted -> committed -> revealed -> verified`.
//!
//! `commit` draws a fresh seed, publishes `sha256(hex(seed) ++ round_id)` and
//! seals the seed in storage. `reveal` releases exactly the sealed seed once
//! the minimum delay has elapsed since the commitment. `verify` is the pure
//! check an auditor re-runs from the published values.

use crate::{
    audit::{AuditLog, AuditOperation},
    clock::Clock,
    errors::{EngineError, EngineResult, ProtocolError, StorageError},
    rng::secure::SecureRandomSource,
    storage::Repository,
};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Published binding to a round's seed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Commitment {
    pub round_id: u64,
    pub commit_hash: String,
    pub created_at: u64,
    pub protocol_version: String,
}

/// Disclosed seed behind a commitment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reveal {
    pub round_id: u64,
    /// Hex-encoded seed
    pub operator_seed: String,
    pub revealed_at: u64,
    /// Set once a hash check against the commitment succeeded
    pub verified: bool,
    /// Set once the seed produced the round's draw order
    pub consumed: bool,
}

impl Reveal {
    /// Flags only move from false to true.
    pub fn merge_flags(&mut self, other: &Reveal) {
        self.verified |= other.verified;
        self.consumed |= other.consumed;
    }

    pub fn seed_bytes(&self) -> EngineResult<Vec<u8>> {
        hex::decode(&self.operator_seed).map_err(|e| {
            StorageError::CorruptedData(format!("reveal:{} seed is not hex: {}", self.round_id, e)).into()
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Uncommitted,
    Committed,
    Revealed,
    Verified,
}

/// `sha256(hex(seed) ++ decimal(round_id))`, hex encoded
pub fn commit_hash(seed: &[u8], round_id: u64) -> String {
    hash_hex_seed(&hex::encode(seed), round_id)
}

fn hash_hex_seed(seed_hex: &str, round_id: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed_hex.to_ascii_lowercase().as_bytes());
    hasher.update(round_id.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// True iff `expected == sha256(seed_hex ++ round_id)`
pub fn verify_commitment(seed_hex: &str, round_id: u64, expected_commit_hash: &str) -> bool {
    hash_hex_seed(seed_hex, round_id).eq_ignore_ascii_case(expected_commit_hash.trim())
}

pub struct CommitRevealProtocol {
    repo: Arc<dyn Repository>,
    audit: AuditLog,
    random: SecureRandomSource,
    clock: Arc<dyn Clock>,
    minimum_reveal_delay_ms: u64,
    seed_bytes: usize,
    /// Commitments are immutable, so cached entries never go stale.
    commitments: Mutex<LruCache<u64, Commitment>>,
}

impl CommitRevealProtocol {
    pub fn new(
        repo: Arc<dyn Repository>,
        audit: AuditLog,
        random: SecureRandomSource,
        clock: Arc<dyn Clock>,
        minimum_reveal_delay_ms: u64,
        seed_bytes: usize,
        cache_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            repo,
            audit,
            random,
            clock,
            minimum_reveal_delay_ms,
            seed_bytes,
            commitments: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn minimum_reveal_delay_ms(&self) -> u64 {
        self.minimum_reveal_delay_ms
    }

    /// Fix the round's seed before any outcome depends on it
    pub async fn commit(&self, round_id: u64) -> EngineResult<Commitment> {
        if self.commitment(round_id).await?.is_some() {
            return Err(ProtocolError::DuplicateCommit { round_id }.into());
        }

        let seed = self.random.bytes_for(Some(round_id), self.seed_bytes, "commit_seed").await?;
        let commitment = Commitment {
            round_id,
            commit_hash: commit_hash(&seed, round_id),
            created_at: self.clock.now_ms(),
            protocol_version: self.audit.protocol_version().to_string(),
        };

        match self.repo.insert_commitment(&commitment, &seed).await {
            Ok(()) => {}
            Err(EngineError::Storage(StorageError::AlreadyExists(_))) => {
                return Err(ProtocolError::DuplicateCommit { round_id }.into());
            }
            Err(e) => return Err(e),
        }

        self.audit
            .append(
                AuditOperation::Commit,
                Some(round_id),
                json!({
                    "commit_hash": commitment.commit_hash,
                    "seed": "[redacted]",
                    "seed_bytes": self.seed_bytes,
                }),
            )
            .await?;
        self.cache(&commitment);

        tracing::info!(round_id, commit_hash = %commitment.commit_hash, "Round seed committed");
        Ok(commitment)
    }

    /// Release the committed seed. Refused with `RevealTooEarly` until the
    /// minimum delay has passed; that refusal is the designed retry path.
    pub async fn reveal(&self, round_id: u64) -> EngineResult<Reveal> {
        let commitment = self
            .commitment(round_id)
            .await?
            .ok_or(ProtocolError::NoCommit { round_id })?;

        if self.repo.get_reveal(round_id).await?.is_some() {
            return Err(ProtocolError::AlreadyRevealed { round_id }.into());
        }

        let now = self.clock.now_ms();
        let elapsed = now.saturating_sub(commitment.created_at);
        if elapsed < self.minimum_reveal_delay_ms {
            let remaining_ms = self.minimum_reveal_delay_ms - elapsed;
            tracing::debug!(round_id, remaining_ms, "Reveal refused before minimum delay");
            return Err(ProtocolError::RevealTooEarly { round_id, remaining_ms }.into());
        }

        let seed = self
            .repo
            .get_sealed_seed(round_id)
            .await?
            .ok_or(ProtocolError::SeedUnavailable { round_id })?;
        if commit_hash(&seed, round_id) != commitment.commit_hash {
            tracing::error!(round_id, "Sealed seed does not match the published commitment");
            return Err(ProtocolError::IntegrityViolation { violations: 1 }.into());
        }

        let reveal = Reveal {
            round_id,
            operator_seed: hex::encode(&seed),
            revealed_at: now,
            verified: false,
            consumed: false,
        };
        match self.repo.insert_reveal(&reveal).await {
            Ok(()) => {}
            Err(EngineError::Storage(StorageError::AlreadyExists(_))) => {
                return Err(ProtocolError::AlreadyRevealed { round_id }.into());
            }
            Err(e) => return Err(e),
        }

        self.audit
            .append(
                AuditOperation::Reveal,
                Some(round_id),
                json!({
                    "seed": reveal.operator_seed,
                    "commit_hash": commitment.commit_hash,
                    "delay_ms": elapsed,
                }),
            )
            .await?;

        tracing::info!(round_id, delay_ms = elapsed, "Round seed revealed");
        Ok(reveal)
    }

    /// Recompute the commitment hash for `seed_hex` and compare. A match
    /// against this round's stored reveal marks it verified.
    pub async fn verify(&self, round_id: u64, seed_hex: &str, expected_commit_hash: &str) -> EngineResult<bool> {
        let valid = verify_commitment(seed_hex, round_id, expected_commit_hash);

        self.audit
            .append(
                AuditOperation::Verify,
                Some(round_id),
                json!({
                    "seed": seed_hex,
                    "expected_commit_hash": expected_commit_hash,
                    "computed_commit_hash": hash_hex_seed(seed_hex, round_id),
                    "valid": valid,
                }),
            )
            .await?;

        if valid {
            let commitment = self.commitment(round_id).await?;
            let reveal = self.repo.get_reveal(round_id).await?;
            if let (Some(commitment), Some(mut reveal)) = (commitment, reveal) {
                if !reveal.verified
                    && commitment.commit_hash.eq_ignore_ascii_case(expected_commit_hash.trim())
                    && reveal.operator_seed.eq_ignore_ascii_case(seed_hex)
                {
                    reveal.verified = true;
                    self.repo.update_reveal(&reveal).await?;
                    tracing::info!(round_id, "Reveal verified against commitment");
                }
            }
        } else {
            tracing::warn!(round_id, "Commitment verification failed");
        }

        Ok(valid)
    }

    pub async fn commitment(&self, round_id: u64) -> EngineResult<Option<Commitment>> {
        if let Some(hit) = self.cached(round_id) {
            return Ok(Some(hit));
        }
        let stored = self.repo.get_commitment(round_id).await?;
        if let Some(commitment) = &stored {
            self.cache(commitment);
        }
        Ok(stored)
    }

    pub async fn reveal_for(&self, round_id: u64) -> EngineResult<Option<Reveal>> {
        self.repo.get_reveal(round_id).await
    }

    pub async fn state(&self, round_id: u64) -> EngineResult<CommitState> {
        if self.commitment(round_id).await?.is_none() {
            return Ok(CommitState::Uncommitted);
        }
        Ok(match self.repo.get_reveal(round_id).await? {
            None => CommitState::Committed,
            Some(reveal) if reveal.verified => CommitState::Verified,
            Some(_) => CommitState::Revealed,
        })
    }

    fn cached(&self, round_id: u64) -> Option<Commitment> {
        self.commitments.lock().ok()?.get(&round_id).cloned()
    }

    fn cache(&self, commitment: &Commitment) {
        if let Ok(mut cache) = self.commitments.lock() {
            cache.put(commitment.round_id, commitment.clone());
        }
    }
}
