//! In-process repository for tests and `--in-memory` deployments

use super::{check_current, check_version, Repository};
use crate::{
    audit::AuditEntry,
    errors::{EngineResult, StorageError},
    game::types::{Card, Round},
    rng::{commit_reveal::Commitment, commit_reveal::Reveal, draw_order::DrawOrder},
    scheduler::SchedulerState,
    stats::TestRecord,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct MemoryState {
    rounds: HashMap<u64, Round>,
    current_round: Option<u64>,
    last_round_id: u64,
    cards: HashMap<String, Card>,
    card_order: Vec<String>,
    commitments: HashMap<u64, (Commitment, Vec<u8>)>,
    reveals: HashMap<u64, Reveal>,
    draw_orders: HashMap<u64, DrawOrder>,
    audit: Vec<AuditEntry>,
    test_results: Vec<TestRecord>,
    scheduler: Option<SchedulerState>,
}

/// Mutex-guarded maps. The lock is never held across an await point.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::ReadFailed("memory repository lock poisoned".to_string()).into())
    }

    /// Test hook: overwrite a stored audit entry in place, bypassing the
    /// append-only API, to simulate tampering with the backing store.
    pub fn tamper_audit_entry<F: FnOnce(&mut AuditEntry)>(&self, index: usize, f: F) -> bool {
        match self.state.lock() {
            Ok(mut state) => match state.audit.get_mut(index) {
                Some(entry) => {
                    f(entry);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_current_round(&self) -> EngineResult<Option<Round>> {
        let state = self.lock()?;
        Ok(state
            .current_round
            .and_then(|id| state.rounds.get(&id).cloned()))
    }

    async fn get_round(&self, round_id: u64) -> EngineResult<Option<Round>> {
        Ok(self.lock()?.rounds.get(&round_id).cloned())
    }

    async fn open_round(&self, mut round: Round, replacing: Option<&Round>) -> EngineResult<Round> {
        let mut state = self.lock()?;
        let current = state
            .current_round
            .and_then(|id| state.rounds.get(&id))
            .map(|r| (r.id, r.version));
        check_current(replacing, current)?;

        round.id = state.last_round_id + 1;
        state.last_round_id = round.id;
        state.rounds.insert(round.id, round.clone());
        state.current_round = Some(round.id);
        Ok(round)
    }

    async fn commit_round_update(&self, round: &Round, cards: &[Card]) -> EngineResult<()> {
        let mut state = self.lock()?;

        let stored = state
            .rounds
            .get(&round.id)
            .ok_or_else(|| StorageError::ReadFailed(format!("round:{} not found", round.id)))?;
        check_version(format!("round:{}", round.id), round.version, stored.version)?;
        for card in cards {
            let stored = state
                .cards
                .get(&card.id)
                .ok_or_else(|| StorageError::ReadFailed(format!("card:{} not found", card.id)))?;
            check_version(format!("card:{}", card.id), card.version, stored.version)?;
        }

        let mut next = round.clone();
        next.version += 1;
        state.rounds.insert(next.id, next);
        for card in cards {
            let mut next = card.clone();
            next.version += 1;
            state.cards.insert(next.id.clone(), next);
        }
        Ok(())
    }

    async fn insert_card(&self, card: &Card, round_version: u64) -> EngineResult<()> {
        let mut state = self.lock()?;
        if state.cards.contains_key(&card.id) {
            return Err(StorageError::AlreadyExists(format!("card:{}", card.id)).into());
        }
        let round = state
            .rounds
            .get_mut(&card.round_id)
            .ok_or_else(|| StorageError::ReadFailed(format!("round:{} not found", card.round_id)))?;
        check_version(format!("round:{}", round.id), round_version, round.version)?;
        round.version += 1;

        state.cards.insert(card.id.clone(), card.clone());
        state.card_order.push(card.id.clone());
        Ok(())
    }

    async fn update_card(&self, card: &Card) -> EngineResult<()> {
        let mut state = self.lock()?;
        let stored = state
            .cards
            .get(&card.id)
            .ok_or_else(|| StorageError::ReadFailed(format!("card:{} not found", card.id)))?;
        check_version(format!("card:{}", card.id), card.version, stored.version)?;

        let mut next = card.clone();
        next.version += 1;
        state.cards.insert(next.id.clone(), next);
        Ok(())
    }

    async fn get_card(&self, card_id: &str) -> EngineResult<Option<Card>> {
        Ok(self.lock()?.cards.get(card_id).cloned())
    }

    async fn cards_for_round(&self, round_id: u64) -> EngineResult<Vec<Card>> {
        let state = self.lock()?;
        Ok(state
            .card_order
            .iter()
            .filter_map(|id| state.cards.get(id))
            .filter(|card| card.round_id == round_id)
            .cloned()
            .collect())
    }

    async fn insert_commitment(&self, commitment: &Commitment, sealed_seed: &[u8]) -> EngineResult<()> {
        let mut state = self.lock()?;
        if state.commitments.contains_key(&commitment.round_id) {
            return Err(StorageError::AlreadyExists(format!("commitment:{}", commitment.round_id)).into());
        }
        state
            .commitments
            .insert(commitment.round_id, (commitment.clone(), sealed_seed.to_vec()));
        Ok(())
    }

    async fn get_commitment(&self, round_id: u64) -> EngineResult<Option<Commitment>> {
        Ok(self.lock()?.commitments.get(&round_id).map(|(c, _)| c.clone()))
    }

    async fn get_sealed_seed(&self, round_id: u64) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.lock()?.commitments.get(&round_id).map(|(_, seed)| seed.clone()))
    }

    async fn insert_reveal(&self, reveal: &Reveal) -> EngineResult<()> {
        let mut state = self.lock()?;
        if state.reveals.contains_key(&reveal.round_id) {
            return Err(StorageError::AlreadyExists(format!("reveal:{}", reveal.round_id)).into());
        }
        state.reveals.insert(reveal.round_id, reveal.clone());
        Ok(())
    }

    async fn get_reveal(&self, round_id: u64) -> EngineResult<Option<Reveal>> {
        Ok(self.lock()?.reveals.get(&round_id).cloned())
    }

    async fn update_reveal(&self, reveal: &Reveal) -> EngineResult<()> {
        let mut state = self.lock()?;
        let stored = state
            .reveals
            .get_mut(&reveal.round_id)
            .ok_or_else(|| StorageError::ReadFailed(format!("reveal:{} not found", reveal.round_id)))?;
        stored.merge_flags(reveal);
        Ok(())
    }

    async fn insert_draw_order(&self, order: &DrawOrder) -> EngineResult<()> {
        let mut state = self.lock()?;
        if state.draw_orders.contains_key(&order.round_id) {
            return Err(StorageError::AlreadyExists(format!("draw_order:{}", order.round_id)).into());
        }
        state.draw_orders.insert(order.round_id, order.clone());
        Ok(())
    }

    async fn get_draw_order(&self, round_id: u64) -> EngineResult<Option<DrawOrder>> {
        Ok(self.lock()?.draw_orders.get(&round_id).cloned())
    }

    async fn append_audit_entry(&self, entry: &AuditEntry) -> EngineResult<()> {
        self.lock()?.audit.push(entry.clone());
        Ok(())
    }

    async fn audit_entries(&self) -> EngineResult<Vec<AuditEntry>> {
        Ok(self.lock()?.audit.clone())
    }

    async fn audit_entries_for_round(&self, round_id: u64) -> EngineResult<Vec<AuditEntry>> {
        Ok(self
            .lock()?
            .audit
            .iter()
            .filter(|e| e.round_id == Some(round_id))
            .cloned()
            .collect())
    }

    async fn store_test_result(&self, record: &TestRecord) -> EngineResult<()> {
        self.lock()?.test_results.push(record.clone());
        Ok(())
    }

    async fn recent_test_results(&self, limit: usize) -> EngineResult<Vec<TestRecord>> {
        Ok(self
            .lock()?
            .test_results
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_scheduler_state(&self) -> EngineResult<Option<SchedulerState>> {
        Ok(self.lock()?.scheduler.clone())
    }

    async fn put_scheduler_state(&self, scheduler: &SchedulerState) -> EngineResult<()> {
        let mut state = self.lock()?;
        let actual = state.scheduler.as_ref().map(|s| s.version).unwrap_or(0);
        check_version("scheduler".to_string(), scheduler.version, actual)?;

        let mut next = scheduler.clone();
        next.version += 1;
        state.scheduler = Some(next);
        Ok(())
    }
}
