//! Certdraw - certified draw engine for live symbol-matching rounds
//!
//! The operator commits to a secret seed before a round opens, reveals it
//! once the round goes live, and every symbol is called from a draw order
//! derived deterministically from that seed. Each step is written to a
//! tamper-evident audit log so an outside auditor can re-derive and verify
//! the round.

pub mod api;
pub mod audit;
pub mod clock;
pub mod config;
pub mod engine;
pub mod errors;
pub mod game;
pub mod rng;
pub mod scheduler;
pub mod stats;
pub mod storage;

pub use audit::{AuditEntry, AuditLog, AuditOperation, IntegrityReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{DrawEngine, RoundVerification};
pub use errors::{EngineError, EngineResult, Severity};
pub use scheduler::{SchedulerCycle, SchedulerPhase, SchedulerState, TickOutcome};
