//! Error types for the certified draw engine
//!
//! Every error carries a [`Severity`] so callers can tell "retry later"
//! apart from "structural bug" without matching on individual variants.

use crate::game::types::Phase;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Root error type for all engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Round error: {0}")]
    Round(#[from] RoundError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

/// Commit-reveal, entropy and audit failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Commitment already exists for round {round_id}")]
    DuplicateCommit { round_id: u64 },

    #[error("No commitment exists for round {round_id}")]
    NoCommit { round_id: u64 },

    #[error("Reveal for round {round_id} refused: {remaining_ms}ms of the minimum delay remain")]
    RevealTooEarly { round_id: u64, remaining_ms: u64 },

    #[error("Seed for round {round_id} has already been revealed")]
    AlreadyRevealed { round_id: u64 },

    #[error("No unconsumed revealed seed available for round {round_id}")]
    SeedUnavailable { round_id: u64 },

    #[error("Entropy source unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("Invalid sampling range [{min}, {max}]")]
    InvalidRange { min: u64, max: u64 },

    #[error("Audit log integrity violated: {violations} tampered entries")]
    IntegrityViolation { violations: usize },
}

/// Round lifecycle failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoundError {
    #[error("Operation '{operation}' is not legal in phase {phase}")]
    InvalidPhaseTransition { operation: &'static str, phase: Phase },

    #[error("Symbol {symbol} was already called in round {round_id}")]
    AlreadyCalled { round_id: u64, symbol: u32 },

    #[error("Draw order for round {round_id} is exhausted")]
    DomainExhausted { round_id: u64 },

    #[error("No current round")]
    NoCurrentRound,

    #[error("Card not found: {0}")]
    CardNotFound(String),

    #[error("Invalid card: {0}")]
    InvalidCard(String),

    #[error("Card {0} cannot take a shield")]
    ShieldUnavailable(String),

    #[error("Purchases are closed for round {round_id}")]
    PurchaseWindowClosed { round_id: u64 },
}

/// Persistence collaborator failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("Concurrent modification of {entity}: expected version {expected}, found {actual}")]
    Conflict { entity: String, expected: u64, actual: u64 },

    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

/// Configuration loading and validation failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue { field: String, value: String, reason: String },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),
}

/// How a caller should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Legitimate refusal; the same call may succeed later.
    Retryable,
    /// The request was rejected and nothing was applied.
    Rejected,
    /// A consistency invariant was broken. Must trip alerting.
    Structural,
    /// The process cannot continue safely.
    Fatal,
}

impl EngineError {
    pub fn severity(&self) -> Severity {
        match self {
            EngineError::Protocol(e) => match e {
                ProtocolError::RevealTooEarly { .. } => Severity::Retryable,
                ProtocolError::DuplicateCommit { .. }
                | ProtocolError::NoCommit { .. }
                | ProtocolError::AlreadyRevealed { .. }
                | ProtocolError::SeedUnavailable { .. }
                | ProtocolError::InvalidRange { .. } => Severity::Rejected,
                ProtocolError::IntegrityViolation { .. } => Severity::Structural,
                ProtocolError::EntropyUnavailable(_) => Severity::Fatal,
            },
            EngineError::Round(e) => match e {
                RoundError::AlreadyCalled { .. } => Severity::Structural,
                _ => Severity::Rejected,
            },
            EngineError::Storage(e) => match e {
                StorageError::Conflict { .. } => Severity::Retryable,
                StorageError::AlreadyExists(_) => Severity::Rejected,
                StorageError::CorruptedData(_) => Severity::Structural,
                StorageError::ReadFailed(_) | StorageError::WriteFailed(_) => Severity::Retryable,
            },
            EngineError::Configuration(_) => Severity::Fatal,
        }
    }

    /// Stable machine-readable code used by the HTTP surface
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Protocol(e) => match e {
                ProtocolError::DuplicateCommit { .. } => "DUPLICATE_COMMIT",
                ProtocolError::NoCommit { .. } => "NO_COMMIT",
                ProtocolError::RevealTooEarly { .. } => "REVEAL_TOO_EARLY",
                ProtocolError::AlreadyRevealed { .. } => "ALREADY_REVEALED",
                ProtocolError::SeedUnavailable { .. } => "SEED_UNAVAILABLE",
                ProtocolError::EntropyUnavailable(_) => "ENTROPY_UNAVAILABLE",
                ProtocolError::InvalidRange { .. } => "INVALID_RANGE",
                ProtocolError::IntegrityViolation { .. } => "INTEGRITY_VIOLATION",
            },
            EngineError::Round(e) => match e {
                RoundError::InvalidPhaseTransition { .. } => "INVALID_PHASE_TRANSITION",
                RoundError::AlreadyCalled { .. } => "ALREADY_CALLED",
                RoundError::DomainExhausted { .. } => "DOMAIN_EXHAUSTED",
                RoundError::NoCurrentRound => "NO_CURRENT_ROUND",
                RoundError::CardNotFound(_) => "CARD_NOT_FOUND",
                RoundError::InvalidCard(_) => "INVALID_CARD",
                RoundError::ShieldUnavailable(_) => "SHIELD_UNAVAILABLE",
                RoundError::PurchaseWindowClosed { .. } => "PURCHASE_WINDOW_CLOSED",
            },
            EngineError::Storage(StorageError::Conflict { .. }) => "CONCURRENT_MODIFICATION",
            EngineError::Storage(_) => "STORAGE_ERROR",
            EngineError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    /// Lost a conditional write to a concurrent writer
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Storage(StorageError::Conflict { .. }))
    }

    /// True for errors that must trip alerting rather than be swallowed
    pub fn is_alerting(&self) -> bool {
        matches!(self.severity(), Severity::Structural | Severity::Fatal)
    }
}

impl From<rocksdb::Error> for EngineError {
    fn from(e: rocksdb::Error) -> Self {
        EngineError::Storage(StorageError::WriteFailed(e.to_string()))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::CorruptedData(e.to_string())
    }
}

// Convenience type alias for Results
pub type EngineResult<T> = Result<T, EngineError>;

/// Trip wire for runtime failures the process must not outlive, such as the
/// entropy source going away. Once tripped it stays tripped; the server
/// watches it and shuts down.
#[derive(Clone)]
pub struct FatalLatch {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl FatalLatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Record the first fatal reason; later trips keep the original
    pub fn trip(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            tracing::error!(%reason, "Fatal condition; engine halting");
            *current = Some(reason);
            true
        });
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    pub fn is_tripped(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Resolves with the reason once the latch trips
    pub async fn tripped(&self) -> String {
        let mut rx = self.tx.subscribe();
        let tripped = rx
            .wait_for(|reason| reason.is_some())
            .await
            .map(|reason| (*reason).clone().unwrap_or_default());
        match tripped {
            Ok(reason) => reason,
            // The sender lives in `self`, so this cannot close while awaited.
            Err(_) => std::future::pending().await,
        }
    }
}

impl Default for FatalLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[tokio::test]
    async fn test_fatal_latch_keeps_first_reason() {
        let latch = FatalLatch::new();
        assert!(!latch.is_tripped());

        let waiter = latch.clone();
        let handle = tokio::spawn(async move { waiter.tripped().await });
        latch.trip("entropy gone");
        latch.trip("second");

        assert_eq!(handle.await.unwrap(), "entropy gone");
        assert_eq!(latch.reason().as_deref(), Some("entropy gone"));
        // Already tripped: resolves immediately.
        assert_eq!(latch.tripped().await, "entropy gone");
    }

    #[test]
    fn test_error_display() {
        let err: EngineError = ProtocolError::RevealTooEarly { round_id: 4, remaining_ms: 250 }.into();

        assert!(err.to_string().contains("Protocol error"));
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_severity_separates_retry_from_bugs() {
        let retry: EngineError = ProtocolError::RevealTooEarly { round_id: 1, remaining_ms: 10 }.into();
        let bug: EngineError = RoundError::AlreadyCalled { round_id: 1, symbol: 7 }.into();
        let tamper: EngineError = ProtocolError::IntegrityViolation { violations: 2 }.into();
        let entropy: EngineError = ProtocolError::EntropyUnavailable("getrandom".into()).into();

        assert_eq!(retry.severity(), Severity::Retryable);
        assert!(!retry.is_alerting());
        assert_eq!(bug.severity(), Severity::Structural);
        assert!(bug.is_alerting());
        assert_eq!(tamper.severity(), Severity::Structural);
        assert_eq!(entropy.severity(), Severity::Fatal);
    }

    #[test]
    fn test_conflict_is_retryable() {
        let err: EngineError = StorageError::Conflict {
            entity: "round:1".into(),
            expected: 3,
            actual: 4,
        }
        .into();

        assert_eq!(err.severity(), Severity::Retryable);
        assert_eq!(err.code(), "CONCURRENT_MODIFICATION");
    }

    #[test]
    fn test_error_source() {
        let err: EngineError = RoundError::NoCurrentRound.into();
        assert!(err.source().is_some());
        assert_eq!(err.code(), "NO_CURRENT_ROUND");
    }
}
