//! Tamper-evident audit log
//!
//! Every protocol operation (commit, reveal, generate, verify) appends one
//! self-hashed [`AuditEntry`]. The integrity hash covers a canonical JSON
//! serialization of every other field, with object keys sorted recursively,
//! so recomputing it from stored fields must reproduce the stored value.
//! Entries are never mutated or deleted through this API.

use crate::{
    clock::Clock,
    errors::{EngineResult, ProtocolError},
    storage::Repository,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Audited protocol operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AuditOperation {
    Commit,
    Reveal,
    Generate,
    Verify,
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOperation::Commit => write!(f, "commit"),
            AuditOperation::Reveal => write!(f, "reveal"),
            AuditOperation::Generate => write!(f, "generate"),
            AuditOperation::Verify => write!(f, "verify"),
        }
    }
}

/// One immutable, self-hashed audit record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: String,
    /// `None` for system-scope operations
    pub round_id: Option<u64>,
    pub operation: AuditOperation,
    pub timestamp: u64,
    pub protocol_version: String,
    pub details: Value,
    pub integrity_hash: String,
}

impl AuditEntry {
    /// Build an entry and compute its integrity hash
    pub fn seal(
        id: String,
        round_id: Option<u64>,
        operation: AuditOperation,
        timestamp: u64,
        protocol_version: &str,
        details: Value,
    ) -> Self {
        let mut entry = Self {
            id,
            round_id,
            operation,
            timestamp,
            protocol_version: protocol_version.to_string(),
            details,
            integrity_hash: String::new(),
        };
        entry.integrity_hash = entry.compute_hash();
        entry
    }

    /// Canonical serialization of every field except the hash
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut fields = serde_json::Map::new();
        fields.insert("details".into(), self.details.clone());
        fields.insert("id".into(), Value::String(self.id.clone()));
        fields.insert("operation".into(), Value::String(self.operation.to_string()));
        fields.insert("protocol_version".into(), Value::String(self.protocol_version.clone()));
        fields.insert(
            "round_id".into(),
            self.round_id.map(Value::from).unwrap_or(Value::Null),
        );
        fields.insert("timestamp".into(), Value::from(self.timestamp));

        let mut out = String::new();
        write_canonical(&Value::Object(fields), &mut out);
        out.into_bytes()
    }

    pub fn compute_hash(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_bytes()))
    }

    pub fn is_intact(&self) -> bool {
        self.compute_hash() == self.integrity_hash
    }
}

/// Serialize JSON with object keys sorted at every depth, independent of
/// how the `serde_json` map type orders keys in this build.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, value)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// A stored entry whose hash no longer matches its fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityViolation {
    pub entry_id: String,
    pub round_id: Option<u64>,
    pub stored_hash: String,
    pub computed_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub valid: bool,
    pub entries_checked: usize,
    pub violations: Vec<IntegrityViolation>,
}

impl IntegrityReport {
    fn from_entries(entries: &[AuditEntry]) -> Self {
        let violations: Vec<IntegrityViolation> = entries
            .iter()
            .filter_map(|entry| {
                let computed = entry.compute_hash();
                (computed != entry.integrity_hash).then(|| IntegrityViolation {
                    entry_id: entry.id.clone(),
                    round_id: entry.round_id,
                    stored_hash: entry.integrity_hash.clone(),
                    computed_hash: computed,
                })
            })
            .collect();

        Self {
            valid: violations.is_empty(),
            entries_checked: entries.len(),
            violations,
        }
    }

    /// Refuse certification claims when any entry was tampered with
    pub fn certify(&self) -> Result<(), ProtocolError> {
        if self.valid {
            Ok(())
        } else {
            Err(ProtocolError::IntegrityViolation {
                violations: self.violations.len(),
            })
        }
    }
}

/// Aggregate counts for the audit system view
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditStats {
    pub total_entries: usize,
    pub system_entries: usize,
    pub rounds_covered: usize,
    pub by_operation: BTreeMap<AuditOperation, usize>,
    pub first_timestamp: Option<u64>,
    pub last_timestamp: Option<u64>,
}

/// Append-only audit log backed by the repository
#[derive(Clone)]
pub struct AuditLog {
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    protocol_version: String,
}

impl AuditLog {
    pub fn new(repo: Arc<dyn Repository>, clock: Arc<dyn Clock>, protocol_version: impl Into<String>) -> Self {
        Self {
            repo,
            clock,
            protocol_version: protocol_version.into(),
        }
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    pub async fn append(
        &self,
        operation: AuditOperation,
        round_id: Option<u64>,
        details: Value,
    ) -> EngineResult<AuditEntry> {
        let entry = AuditEntry::seal(
            Uuid::new_v4().to_string(),
            round_id,
            operation,
            self.clock.now_ms(),
            &self.protocol_version,
            details,
        );
        self.repo.append_audit_entry(&entry).await?;
        tracing::debug!(
            entry_id = %entry.id,
            round_id = ?round_id,
            operation = %operation,
            "Audit entry appended"
        );
        Ok(entry)
    }

    /// Recompute every stored hash and report mismatches
    pub async fn verify_integrity(&self) -> EngineResult<IntegrityReport> {
        let entries = self.repo.audit_entries().await?;
        let report = IntegrityReport::from_entries(&entries);
        if !report.valid {
            tracing::error!(
                violations = report.violations.len(),
                checked = report.entries_checked,
                "Audit log integrity violated"
            );
        }
        Ok(report)
    }

    pub async fn verify_round_integrity(&self, round_id: u64) -> EngineResult<IntegrityReport> {
        let entries = self.repo.audit_entries_for_round(round_id).await?;
        let report = IntegrityReport::from_entries(&entries);
        if !report.valid {
            tracing::error!(round_id, violations = report.violations.len(), "Round audit trail tampered");
        }
        Ok(report)
    }

    /// Entries of one round in timestamp order (append order breaks ties)
    pub async fn trail_for(&self, round_id: u64) -> EngineResult<Vec<AuditEntry>> {
        let mut entries = self.repo.audit_entries_for_round(round_id).await?;
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    pub async fn stats(&self) -> EngineResult<AuditStats> {
        let entries = self.repo.audit_entries().await?;
        let mut stats = AuditStats {
            total_entries: entries.len(),
            ..Default::default()
        };
        let mut rounds = std::collections::BTreeSet::new();
        for entry in &entries {
            *stats.by_operation.entry(entry.operation).or_insert(0) += 1;
            match entry.round_id {
                Some(id) => {
                    rounds.insert(id);
                }
                None => stats.system_entries += 1,
            }
            stats.first_timestamp = Some(stats.first_timestamp.map_or(entry.timestamp, |t| t.min(entry.timestamp)));
            stats.last_timestamp = Some(stats.last_timestamp.map_or(entry.timestamp, |t| t.max(entry.timestamp)));
        }
        stats.rounds_covered = rounds.len();
        Ok(stats)
    }
}
