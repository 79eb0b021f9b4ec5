//! Draw order generation
//!
//! The order is a Fisher-Yates permutation of `1..=domain_size` driven by a
//! SHA-256 counter stream keyed on the revealed seed and the round id. It is
//! computed once per round from the unconsumed reveal, and anyone holding
//! the published seed can recompute it with [`DrawOrderGenerator::recompute`].

use crate::{
    audit::{AuditLog, AuditOperation},
    clock::Clock,
    errors::{EngineError, EngineResult, ProtocolError, StorageError},
    game::types::Symbol,
    storage::Repository,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

const STREAM_DOMAIN: &[u8] = b"certdraw/draw-order/v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DrawOrder {
    pub round_id: u64,
    pub symbols: Vec<Symbol>,
    /// Truncated `sha256(seed)`, never the seed itself
    pub seed_fingerprint: String,
    pub generated_at: u64,
}

impl DrawOrder {
    /// Length equals the domain, values distinct and exactly `1..=domain_size`
    pub fn is_permutation_of(&self, domain_size: u32) -> bool {
        if self.symbols.len() != domain_size as usize {
            return false;
        }
        let mut seen = HashSet::with_capacity(self.symbols.len());
        self.symbols
            .iter()
            .all(|&s| (1..=domain_size).contains(&s) && seen.insert(s))
    }

    pub fn symbol_at(&self, position: usize) -> Option<Symbol> {
        self.symbols.get(position).copied()
    }
}

/// Leading `len` hex characters of `sha256(seed)`
pub fn seed_fingerprint(seed: &[u8], len: usize) -> String {
    let mut digest = hex::encode(Sha256::digest(seed));
    digest.truncate(len);
    digest
}

/// Deterministic byte stream: `sha256(domain ++ seed ++ round_id ++ counter)`
struct SeedStream<'a> {
    seed: &'a [u8],
    round_id: u64,
    counter: u64,
    block: [u8; 32],
    offset: usize,
}

impl<'a> SeedStream<'a> {
    fn new(seed: &'a [u8], round_id: u64) -> Self {
        Self {
            seed,
            round_id,
            counter: 0,
            block: [0u8; 32],
            offset: 32,
        }
    }

    fn next_u64(&mut self) -> u64 {
        if self.offset + 8 > self.block.len() {
            let mut hasher = Sha256::new();
            hasher.update(STREAM_DOMAIN);
            hasher.update(self.seed);
            hasher.update(self.round_id.to_be_bytes());
            hasher.update(self.counter.to_be_bytes());
            self.block.copy_from_slice(&hasher.finalize());
            self.counter += 1;
            self.offset = 0;
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.block[self.offset..self.offset + 8]);
        self.offset += 8;
        u64::from_be_bytes(word)
    }

    /// Unbiased integer in `0..bound`
    fn below(&mut self, bound: u64) -> u64 {
        let zone = u64::MAX - (u64::MAX % bound);
        loop {
            let v = self.next_u64();
            if v < zone {
                return v % bound;
            }
        }
    }
}

pub struct DrawOrderGenerator {
    repo: Arc<dyn Repository>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    fingerprint_len: usize,
}

impl DrawOrderGenerator {
    pub fn new(repo: Arc<dyn Repository>, audit: AuditLog, clock: Arc<dyn Clock>, fingerprint_len: usize) -> Self {
        Self {
            repo,
            audit,
            clock,
            fingerprint_len,
        }
    }

    /// Permutation of `1..=domain_size` for `seed` and `round_id`
    pub fn recompute(seed: &[u8], round_id: u64, domain_size: u32) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = (1..=domain_size).collect();
        let mut stream = SeedStream::new(seed, round_id);
        for i in (1..symbols.len()).rev() {
            let j = stream.below(i as u64 + 1) as usize;
            symbols.swap(i, j);
        }
        symbols
    }

    /// Produce the round's draw order from its unconsumed reveal and mark
    /// the reveal consumed. Fails with `SeedUnavailable` when there is no
    /// reveal or it already produced an order.
    pub async fn generate(&self, round_id: u64, domain_size: u32) -> EngineResult<DrawOrder> {
        let mut reveal = match self.repo.get_reveal(round_id).await? {
            Some(reveal) if !reveal.consumed => reveal,
            _ => return Err(ProtocolError::SeedUnavailable { round_id }.into()),
        };
        let seed = reveal.seed_bytes()?;

        let order = DrawOrder {
            round_id,
            symbols: Self::recompute(&seed, round_id, domain_size),
            seed_fingerprint: seed_fingerprint(&seed, self.fingerprint_len),
            generated_at: self.clock.now_ms(),
        };
        if !order.is_permutation_of(domain_size) {
            tracing::error!(round_id, domain_size, "Generated draw order is not a permutation");
            return Err(StorageError::CorruptedData(format!("draw order for round {} is not a permutation", round_id)).into());
        }

        match self.repo.insert_draw_order(&order).await {
            Ok(()) => {}
            Err(EngineError::Storage(StorageError::AlreadyExists(_))) => {
                return Err(ProtocolError::SeedUnavailable { round_id }.into());
            }
            Err(e) => return Err(e),
        }
        reveal.consumed = true;
        self.repo.update_reveal(&reveal).await?;

        self.audit
            .append(
                AuditOperation::Generate,
                Some(round_id),
                json!({
                    "kind": "draw_order",
                    "domain_size": domain_size,
                    "seed_fingerprint": order.seed_fingerprint,
                }),
            )
            .await?;

        tracing::info!(round_id, domain_size, fingerprint = %order.seed_fingerprint, "Draw order generated");
        Ok(order)
    }

    pub async fn existing(&self, round_id: u64) -> EngineResult<Option<DrawOrder>> {
        self.repo.get_draw_order(round_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rng::commit_reveal::Reveal;
    use crate::storage::MemoryRepository;

    fn generator() -> (DrawOrderGenerator, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(50));
        let audit = AuditLog::new(repo.clone(), clock.clone(), "v-test");
        (DrawOrderGenerator::new(repo.clone(), audit, clock, 16), repo)
    }

    fn reveal(round_id: u64, seed: &[u8]) -> Reveal {
        Reveal {
            round_id,
            operator_seed: hex::encode(seed),
            revealed_at: 10,
            verified: false,
            consumed: false,
        }
    }

    #[test]
    fn test_recompute_is_a_permutation_for_many_seeds() {
        for domain in [1u32, 2, 9, 26, 75] {
            for n in 0u8..20 {
                let symbols = DrawOrderGenerator::recompute(&[n; 32], n as u64, domain);
                let order = DrawOrder {
                    round_id: 0,
                    symbols,
                    seed_fingerprint: String::new(),
                    generated_at: 0,
                };
                assert!(order.is_permutation_of(domain), "domain {} seed {}", domain, n);
            }
        }
    }

    #[test]
    fn test_recompute_is_deterministic_and_seed_bound() {
        let a = DrawOrderGenerator::recompute(b"seed-a", 1, 75);
        assert_eq!(a, DrawOrderGenerator::recompute(b"seed-a", 1, 75));
        assert_ne!(a, DrawOrderGenerator::recompute(b"seed-b", 1, 75));
        assert_ne!(a, DrawOrderGenerator::recompute(b"seed-a", 2, 75));
    }

    #[test]
    fn test_permutation_check_rejects_bad_orders() {
        let mut order = DrawOrder {
            round_id: 1,
            symbols: vec![1, 2, 2],
            seed_fingerprint: String::new(),
            generated_at: 0,
        };
        assert!(!order.is_permutation_of(3));
        order.symbols = vec![1, 2, 4];
        assert!(!order.is_permutation_of(3));
        order.symbols = vec![3, 1, 2];
        assert!(order.is_permutation_of(3));
        assert!(!order.is_permutation_of(4));
    }

    #[test]
    fn test_fingerprint_is_truncated_digest() {
        let fp = seed_fingerprint(b"abc", 16);
        assert_eq!(fp.len(), 16);
        assert!(hex::encode(Sha256::digest(b"abc")).starts_with(&fp));
    }

    #[tokio::test]
    async fn test_generate_requires_unconsumed_reveal() {
        let (generator, repo) = generator();
        let err = generator.generate(1, 9).await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(ProtocolError::SeedUnavailable { round_id: 1 })));

        let seed = [7u8; 32];
        repo.insert_reveal(&reveal(1, &seed)).await.unwrap();
        let order = generator.generate(1, 9).await.unwrap();
        assert_eq!(order.symbols, DrawOrderGenerator::recompute(&seed, 1, 9));
        assert!(repo.get_reveal(1).await.unwrap().unwrap().consumed);

        // The seed is spent; a second order is never produced.
        let err = generator.generate(1, 9).await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(ProtocolError::SeedUnavailable { .. })));
        assert_eq!(generator.existing(1).await.unwrap(), Some(order));
    }

    #[tokio::test]
    async fn test_generate_audit_entry_carries_fingerprint_only() {
        let (generator, repo) = generator();
        let seed = [9u8; 32];
        repo.insert_reveal(&reveal(4, &seed)).await.unwrap();
        generator.generate(4, 26).await.unwrap();

        let entries = repo.audit_entries_for_round(4).await.unwrap();
        assert_eq!(entries.len(), 1);
        let details = entries[0].details.to_string();
        assert!(details.contains(&seed_fingerprint(&seed, 16)));
        assert!(!details.contains(&hex::encode(seed)));
    }
}
