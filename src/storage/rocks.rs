//! RocksDB-backed repository
//!
//! Values are JSON. Multi-row updates go through a single `WriteBatch`, and
//! every read-check-write sequence runs under a short in-process write lock
//! that is never held across an await point.

use super::{check_current, check_version, decode, encode, Repository};
use crate::{
    audit::AuditEntry,
    config::StorageConfig,
    errors::{EngineResult, StorageError},
    game::types::{Card, Round},
    rng::{commit_reveal::Commitment, commit_reveal::Reveal, draw_order::DrawOrder},
    scheduler::SchedulerState,
    stats::TestRecord,
};
use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const CURRENT_ROUND_KEY: &[u8] = b"round:current";
const LAST_ROUND_ID_KEY: &[u8] = b"round:last_id";
const SEQUENCE_KEY: &[u8] = b"meta:sequence";
const SCHEDULER_KEY: &[u8] = b"scheduler:state";
const AUDIT_ENTRY_PREFIX: &str = "audit:entry:";
const AUDIT_ROUND_PREFIX: &str = "audit:round:";
const CARD_ROUND_PREFIX: &str = "card:round:";
const TEST_RESULT_PREFIX: &str = "stats:result:";

fn round_key(round_id: u64) -> Vec<u8> {
    format!("round:id:{:020}", round_id).into_bytes()
}

fn card_key(card_id: &str) -> Vec<u8> {
    format!("card:id:{}", card_id).into_bytes()
}

fn card_round_key(round_id: u64, seq: u64) -> Vec<u8> {
    format!("{}{:020}:{:020}", CARD_ROUND_PREFIX, round_id, seq).into_bytes()
}

fn commitment_key(round_id: u64) -> Vec<u8> {
    format!("commit:{:020}", round_id).into_bytes()
}

fn sealed_seed_key(round_id: u64) -> Vec<u8> {
    format!("seed:sealed:{:020}", round_id).into_bytes()
}

fn reveal_key(round_id: u64) -> Vec<u8> {
    format!("reveal:{:020}", round_id).into_bytes()
}

fn draw_order_key(round_id: u64) -> Vec<u8> {
    format!("draw:{:020}", round_id).into_bytes()
}

fn audit_entry_key(seq: u64) -> Vec<u8> {
    format!("{}{:020}", AUDIT_ENTRY_PREFIX, seq).into_bytes()
}

fn audit_round_key(round_id: u64, seq: u64) -> Vec<u8> {
    format!("{}{:020}:{:020}", AUDIT_ROUND_PREFIX, round_id, seq).into_bytes()
}

fn test_result_key(seq: u64) -> Vec<u8> {
    format!("{}{:020}", TEST_RESULT_PREFIX, seq).into_bytes()
}

fn parse_u64_le(bytes: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_le_bytes(arr))
}

#[derive(Clone)]
pub struct RocksRepository {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksRepository {
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        Self::open_with_config(path, &StorageConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: &StorageConfig) -> EngineResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)
            .map_err(|e| StorageError::ReadFailed(format!("Database open failed: {}", e)))?;
        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| StorageError::WriteFailed("write lock poisoned".to_string()).into())
    }

    fn get_raw(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|e| StorageError::ReadFailed(e.to_string()).into())
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, what: &str, key: &[u8]) -> EngineResult<Option<T>> {
        match self.get_raw(key)? {
            Some(bytes) => Ok(Some(decode(what, &bytes)?)),
            None => Ok(None),
        }
    }

    fn write(&self, batch: WriteBatch) -> EngineResult<()> {
        self.db
            .write(batch)
            .map_err(|e| StorageError::WriteFailed(e.to_string()).into())
    }

    /// Allocate the next sequence number into `batch`. Caller holds the write lock.
    fn next_sequence(&self, batch: &mut WriteBatch) -> EngineResult<u64> {
        let last = self
            .get_raw(SEQUENCE_KEY)?
            .and_then(|b| parse_u64_le(&b))
            .unwrap_or(0);
        let next = last + 1;
        batch.put(SEQUENCE_KEY, next.to_le_bytes());
        Ok(next)
    }

    fn insert_absent(&self, what: String, key: Vec<u8>, value: Vec<u8>) -> EngineResult<()> {
        let _guard = self.lock()?;
        if self.get_raw(&key)?.is_some() {
            return Err(StorageError::AlreadyExists(what).into());
        }
        let mut batch = WriteBatch::default();
        batch.put(key, value);
        self.write(batch)
    }

    /// Values under `prefix` in key order
    fn scan_prefix(&self, prefix: &[u8]) -> EngineResult<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let mut rows = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key, value));
        }
        Ok(rows)
    }
}

#[async_trait]
impl Repository for RocksRepository {
    async fn get_current_round(&self) -> EngineResult<Option<Round>> {
        match self.get_raw(CURRENT_ROUND_KEY)?.and_then(|b| parse_u64_le(&b)) {
            Some(id) => self.get_round(id).await,
            None => Ok(None),
        }
    }

    async fn get_round(&self, round_id: u64) -> EngineResult<Option<Round>> {
        self.get_json("round", &round_key(round_id))
    }

    async fn open_round(&self, mut round: Round, replacing: Option<&Round>) -> EngineResult<Round> {
        let _guard = self.lock()?;
        let current = match self.get_raw(CURRENT_ROUND_KEY)?.and_then(|b| parse_u64_le(&b)) {
            Some(id) => self
                .get_json::<Round>("round", &round_key(id))?
                .map(|r| (r.id, r.version)),
            None => None,
        };
        check_current(replacing, current)?;

        let last = self
            .get_raw(LAST_ROUND_ID_KEY)?
            .and_then(|b| parse_u64_le(&b))
            .unwrap_or(0);
        round.id = last + 1;

        let mut batch = WriteBatch::default();
        batch.put(round_key(round.id), encode(&round)?);
        batch.put(CURRENT_ROUND_KEY, round.id.to_le_bytes());
        batch.put(LAST_ROUND_ID_KEY, round.id.to_le_bytes());
        self.write(batch)?;
        Ok(round)
    }

    async fn commit_round_update(&self, round: &Round, cards: &[Card]) -> EngineResult<()> {
        let _guard = self.lock()?;

        let stored: Round = self
            .get_json("round", &round_key(round.id))?
            .ok_or_else(|| StorageError::ReadFailed(format!("round:{} not found", round.id)))?;
        check_version(format!("round:{}", round.id), round.version, stored.version)?;

        let mut batch = WriteBatch::default();
        for card in cards {
            let stored: Card = self
                .get_json("card", &card_key(&card.id))?
                .ok_or_else(|| StorageError::ReadFailed(format!("card:{} not found", card.id)))?;
            check_version(format!("card:{}", card.id), card.version, stored.version)?;

            let mut next = card.clone();
            next.version += 1;
            batch.put(card_key(&next.id), encode(&next)?);
        }

        let mut next = round.clone();
        next.version += 1;
        batch.put(round_key(next.id), encode(&next)?);
        self.write(batch)
    }

    async fn insert_card(&self, card: &Card, round_version: u64) -> EngineResult<()> {
        let _guard = self.lock()?;
        let key = card_key(&card.id);
        if self.get_raw(&key)?.is_some() {
            return Err(StorageError::AlreadyExists(format!("card:{}", card.id)).into());
        }
        let mut round: Round = self
            .get_json("round", &round_key(card.round_id))?
            .ok_or_else(|| StorageError::ReadFailed(format!("round:{} not found", card.round_id)))?;
        check_version(format!("round:{}", round.id), round_version, round.version)?;
        round.version += 1;

        let mut batch = WriteBatch::default();
        let seq = self.next_sequence(&mut batch)?;
        batch.put(card_round_key(card.round_id, seq), card.id.as_bytes());
        batch.put(key, encode(card)?);
        batch.put(round_key(round.id), encode(&round)?);
        self.write(batch)
    }

    async fn update_card(&self, card: &Card) -> EngineResult<()> {
        let _guard = self.lock()?;
        let stored: Card = self
            .get_json("card", &card_key(&card.id))?
            .ok_or_else(|| StorageError::ReadFailed(format!("card:{} not found", card.id)))?;
        check_version(format!("card:{}", card.id), card.version, stored.version)?;

        let mut next = card.clone();
        next.version += 1;
        let mut batch = WriteBatch::default();
        batch.put(card_key(&next.id), encode(&next)?);
        self.write(batch)
    }

    async fn get_card(&self, card_id: &str) -> EngineResult<Option<Card>> {
        self.get_json("card", &card_key(card_id))
    }

    async fn cards_for_round(&self, round_id: u64) -> EngineResult<Vec<Card>> {
        let prefix = format!("{}{:020}:", CARD_ROUND_PREFIX, round_id);
        let mut cards = Vec::new();
        for (_key, value) in self.scan_prefix(prefix.as_bytes())? {
            let card_id = String::from_utf8_lossy(&value).to_string();
            if let Some(card) = self.get_card(&card_id).await? {
                cards.push(card);
            }
        }
        Ok(cards)
    }

    async fn insert_commitment(&self, commitment: &Commitment, sealed_seed: &[u8]) -> EngineResult<()> {
        let _guard = self.lock()?;
        let key = commitment_key(commitment.round_id);
        if self.get_raw(&key)?.is_some() {
            return Err(StorageError::AlreadyExists(format!("commitment:{}", commitment.round_id)).into());
        }

        let mut batch = WriteBatch::default();
        batch.put(key, encode(commitment)?);
        batch.put(sealed_seed_key(commitment.round_id), sealed_seed);
        self.write(batch)
    }

    async fn get_commitment(&self, round_id: u64) -> EngineResult<Option<Commitment>> {
        self.get_json("commitment", &commitment_key(round_id))
    }

    async fn get_sealed_seed(&self, round_id: u64) -> EngineResult<Option<Vec<u8>>> {
        self.get_raw(&sealed_seed_key(round_id))
    }

    async fn insert_reveal(&self, reveal: &Reveal) -> EngineResult<()> {
        self.insert_absent(
            format!("reveal:{}", reveal.round_id),
            reveal_key(reveal.round_id),
            encode(reveal)?,
        )
    }

    async fn get_reveal(&self, round_id: u64) -> EngineResult<Option<Reveal>> {
        self.get_json("reveal", &reveal_key(round_id))
    }

    async fn update_reveal(&self, reveal: &Reveal) -> EngineResult<()> {
        let _guard = self.lock()?;
        let mut stored: Reveal = self
            .get_json("reveal", &reveal_key(reveal.round_id))?
            .ok_or_else(|| StorageError::ReadFailed(format!("reveal:{} not found", reveal.round_id)))?;
        stored.merge_flags(reveal);

        let mut batch = WriteBatch::default();
        batch.put(reveal_key(reveal.round_id), encode(&stored)?);
        self.write(batch)
    }

    async fn insert_draw_order(&self, order: &DrawOrder) -> EngineResult<()> {
        self.insert_absent(
            format!("draw_order:{}", order.round_id),
            draw_order_key(order.round_id),
            encode(order)?,
        )
    }

    async fn get_draw_order(&self, round_id: u64) -> EngineResult<Option<DrawOrder>> {
        self.get_json("draw order", &draw_order_key(round_id))
    }

    async fn append_audit_entry(&self, entry: &AuditEntry) -> EngineResult<()> {
        let _guard = self.lock()?;
        let mut batch = WriteBatch::default();
        let seq = self.next_sequence(&mut batch)?;
        batch.put(audit_entry_key(seq), encode(entry)?);
        if let Some(round_id) = entry.round_id {
            batch.put(audit_round_key(round_id, seq), seq.to_le_bytes());
        }
        self.write(batch)
    }

    async fn audit_entries(&self) -> EngineResult<Vec<AuditEntry>> {
        self.scan_prefix(AUDIT_ENTRY_PREFIX.as_bytes())?
            .into_iter()
            .map(|(_, value)| decode("audit entry", &value))
            .collect()
    }

    async fn audit_entries_for_round(&self, round_id: u64) -> EngineResult<Vec<AuditEntry>> {
        let prefix = format!("{}{:020}:", AUDIT_ROUND_PREFIX, round_id);
        let mut entries = Vec::new();
        for (_key, value) in self.scan_prefix(prefix.as_bytes())? {
            let seq = parse_u64_le(&value)
                .ok_or_else(|| StorageError::CorruptedData("Invalid audit index value".to_string()))?;
            if let Some(entry) = self.get_json("audit entry", &audit_entry_key(seq))? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn store_test_result(&self, record: &TestRecord) -> EngineResult<()> {
        let _guard = self.lock()?;
        let mut batch = WriteBatch::default();
        let seq = self.next_sequence(&mut batch)?;
        batch.put(test_result_key(seq), encode(record)?);
        self.write(batch)
    }

    async fn recent_test_results(&self, limit: usize) -> EngineResult<Vec<TestRecord>> {
        let upper = format!("{}~", TEST_RESULT_PREFIX);
        let mut records = Vec::new();
        for item in self.db.iterator(IteratorMode::From(upper.as_bytes(), Direction::Reverse)) {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(TEST_RESULT_PREFIX.as_bytes()) || records.len() >= limit {
                break;
            }
            records.push(decode("test result", &value)?);
        }
        Ok(records)
    }

    async fn get_scheduler_state(&self) -> EngineResult<Option<SchedulerState>> {
        self.get_json("scheduler state", SCHEDULER_KEY)
    }

    async fn put_scheduler_state(&self, state: &SchedulerState) -> EngineResult<()> {
        let _guard = self.lock()?;
        let actual = self
            .get_json::<SchedulerState>("scheduler state", SCHEDULER_KEY)?
            .map(|s| s.version)
            .unwrap_or(0);
        check_version("scheduler".to_string(), state.version, actual)?;

        let mut next = state.clone();
        next.version += 1;
        let mut batch = WriteBatch::default();
        batch.put(SCHEDULER_KEY, encode(&next)?);
        self.write(batch)
    }
}
