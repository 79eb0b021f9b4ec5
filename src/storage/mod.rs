//! Persistence collaborator
//!
//! The engine reaches storage only through [`Repository`]. Rounds, cards and
//! scheduler state are written with conditional (versioned) writes: the
//! `version` carried by the value is the version the writer read, and the
//! store bumps it on success or fails with [`StorageError::Conflict`].
//! Opening a round and adding a card are conditional on the round row too,
//! so they serialize against the lifecycle writes on that round.
//! Commitments, reveals and draw orders are insert-if-absent.

pub mod memory;
pub mod rocks;

use crate::{
    audit::AuditEntry,
    errors::{EngineResult, StorageError},
    game::types::{Card, Round},
    rng::{commit_reveal::Commitment, commit_reveal::Reveal, draw_order::DrawOrder},
    scheduler::SchedulerState,
    stats::TestRecord,
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

pub use memory::MemoryRepository;
pub use rocks::RocksRepository;

#[async_trait]
pub trait Repository: Send + Sync {
    /// The round currently owned by the lifecycle machine
    async fn get_current_round(&self) -> EngineResult<Option<Round>>;

    async fn get_round(&self, round_id: u64) -> EngineResult<Option<Round>>;

    /// Store `round` under the next round id and make it current. `replacing`
    /// is the current round as the caller read it (`None` on a fresh store);
    /// if the pointer or that round's version moved, nothing is written.
    async fn open_round(&self, round: Round, replacing: Option<&Round>) -> EngineResult<Round>;

    /// Conditional write of a round
    async fn upsert_round(&self, round: &Round) -> EngineResult<()> {
        self.commit_round_update(round, &[]).await
    }

    /// Conditional write of a round together with cards, all-or-nothing
    async fn commit_round_update(&self, round: &Round, cards: &[Card]) -> EngineResult<()>;

    /// Add a card to its round. Requires the round to still be at
    /// `round_version` and bumps it, so a concurrent lifecycle write that read
    /// the round before the card existed fails instead.
    async fn insert_card(&self, card: &Card, round_version: u64) -> EngineResult<()>;

    /// Conditional write of a single card
    async fn update_card(&self, card: &Card) -> EngineResult<()>;

    async fn get_card(&self, card_id: &str) -> EngineResult<Option<Card>>;

    /// Cards of a round in purchase order
    async fn cards_for_round(&self, round_id: u64) -> EngineResult<Vec<Card>>;

    /// Persist a commitment and its sealed seed. Fails if one exists.
    async fn insert_commitment(&self, commitment: &Commitment, sealed_seed: &[u8]) -> EngineResult<()>;

    async fn get_commitment(&self, round_id: u64) -> EngineResult<Option<Commitment>>;

    /// The committed seed. Only the reveal path reads this.
    async fn get_sealed_seed(&self, round_id: u64) -> EngineResult<Option<Vec<u8>>>;

    async fn insert_reveal(&self, reveal: &Reveal) -> EngineResult<()>;

    async fn get_reveal(&self, round_id: u64) -> EngineResult<Option<Reveal>>;

    /// Merge monotonic reveal flags (`verified`, `consumed`)
    async fn update_reveal(&self, reveal: &Reveal) -> EngineResult<()>;

    async fn insert_draw_order(&self, order: &DrawOrder) -> EngineResult<()>;

    async fn get_draw_order(&self, round_id: u64) -> EngineResult<Option<DrawOrder>>;

    async fn append_audit_entry(&self, entry: &AuditEntry) -> EngineResult<()>;

    /// Every audit entry in append order
    async fn audit_entries(&self) -> EngineResult<Vec<AuditEntry>>;

    async fn audit_entries_for_round(&self, round_id: u64) -> EngineResult<Vec<AuditEntry>>;

    async fn store_test_result(&self, record: &TestRecord) -> EngineResult<()>;

    /// Newest first
    async fn recent_test_results(&self, limit: usize) -> EngineResult<Vec<TestRecord>>;

    async fn get_scheduler_state(&self) -> EngineResult<Option<SchedulerState>>;

    /// Conditional write; a missing row counts as version 0
    async fn put_scheduler_state(&self, state: &SchedulerState) -> EngineResult<()>;
}

pub(crate) fn encode<T: Serialize>(value: &T) -> EngineResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StorageError::WriteFailed(e.to_string()).into())
}

pub(crate) fn decode<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> EngineResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| StorageError::CorruptedData(format!("Failed to decode {}: {}", what, e)).into())
}

/// Conflict raised when the current-round pointer moved under a writer
pub(crate) fn check_current(expected: Option<&Round>, actual: Option<(u64, u64)>) -> EngineResult<()> {
    match (expected, actual) {
        (None, None) => Ok(()),
        (Some(expected), Some((id, version))) if expected.id == id => {
            check_version(format!("round:{}", id), expected.version, version)
        }
        (expected, actual) => Err(StorageError::Conflict {
            entity: "round:current".to_string(),
            expected: expected.map(|r| r.id).unwrap_or(0),
            actual: actual.map(|(id, _)| id).unwrap_or(0),
        }
        .into()),
    }
}

pub(crate) fn check_version(entity: String, expected: u64, actual: u64) -> EngineResult<()> {
    if expected != actual {
        return Err(StorageError::Conflict {
            entity,
            expected,
            actual,
        }
        .into());
    }
    Ok(())
}
