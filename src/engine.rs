//! Engine assembly
//!
//! Wires the repository, clock and entropy source into every component so
//! binaries, the HTTP surface and tests build the engine one way.

use crate::{
    audit::{AuditEntry, AuditLog, AuditStats, IntegrityReport},
    clock::{Clock, SystemClock},
    config::EngineConfig,
    errors::{EngineResult, FatalLatch, RoundError},
    game::{Card, CardLayout, Round, RoundLifecycleMachine},
    rng::{
        verify_commitment, CommitRevealProtocol, Commitment, DrawOrderGenerator, EntropySource, OsEntropy, Reveal,
        SecureRandomSource,
    },
    scheduler::SchedulerCycle,
    stats::{SampleExporter, StatisticalTestBattery},
    storage::{MemoryRepository, Repository, RocksRepository},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Static protocol description for the audit system view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub protocol_version: String,
    pub hash_algorithm: String,
    pub commitment_scheme: String,
    pub draw_order_algorithm: String,
    pub minimum_reveal_delay_ms: u64,
    pub entropy_source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemAuditView {
    pub system_info: SystemInfo,
    pub system_stats: AuditStats,
    pub integrity_check: IntegrityReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundAuditView {
    pub round_id: u64,
    pub audit_trail: Vec<AuditEntry>,
    pub integrity: IntegrityReport,
}

/// Independent re-check of one round from its published values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundVerification {
    pub round_id: u64,
    pub commitment: Option<Commitment>,
    pub reveal: Option<Reveal>,
    /// Revealed seed hashes to the commitment
    pub commitment_valid: bool,
    /// Stored draw order equals the one recomputed from the seed
    pub draw_order_matches: Option<bool>,
    /// Called symbols are a prefix of the draw order
    pub calls_follow_order: Option<bool>,
    pub audit_integrity: IntegrityReport,
    pub certified: bool,
}

pub struct DrawEngine {
    config: EngineConfig,
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    protocol: Arc<CommitRevealProtocol>,
    machine: Arc<RoundLifecycleMachine>,
    scheduler: Arc<SchedulerCycle>,
    battery: StatisticalTestBattery,
    exporter: SampleExporter,
    entropy_source: &'static str,
    fatal: FatalLatch,
}

impl DrawEngine {
    /// Engine over the configured store, the system clock and OS entropy
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let repo: Arc<dyn Repository> = if config.storage.in_memory {
            tracing::warn!("Using in-memory repository; state is lost on exit");
            Arc::new(MemoryRepository::new())
        } else {
            tracing::info!(path = %config.storage.data_directory, "Opening RocksDB repository");
            Arc::new(RocksRepository::open_with_config(
                &config.storage.data_directory,
                &config.storage,
            )?)
        };
        Self::with_parts(config, repo, Arc::new(SystemClock), Arc::new(OsEntropy))
    }

    pub fn with_parts(
        config: EngineConfig,
        repo: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        entropy: Arc<dyn EntropySource>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let entropy_source = entropy.name();
        let audit = AuditLog::new(repo.clone(), clock.clone(), config.protocol.protocol_version.clone());
        let fatal = FatalLatch::new();
        let random = SecureRandomSource::new(entropy, audit.clone()).with_fatal_latch(fatal.clone());
        let protocol = Arc::new(CommitRevealProtocol::new(
            repo.clone(),
            audit.clone(),
            random.clone(),
            clock.clone(),
            config.protocol.minimum_reveal_delay_ms,
            config.protocol.seed_bytes,
            config.protocol.commitment_cache_capacity,
        ));
        let draws = Arc::new(DrawOrderGenerator::new(
            repo.clone(),
            audit.clone(),
            clock.clone(),
            config.protocol.fingerprint_hex_len,
        ));
        let machine = Arc::new(RoundLifecycleMachine::new(
            repo.clone(),
            protocol.clone(),
            draws,
            random.clone(),
            clock.clone(),
            config.game.clone(),
            config.pricing.clone(),
        ));
        let scheduler = Arc::new(SchedulerCycle::new(
            machine.clone(),
            repo.clone(),
            clock.clone(),
            config.scheduler.clone(),
        ));
        let battery = StatisticalTestBattery::new(random.clone(), repo.clone(), clock.clone(), config.statistics.clone());
        let exporter = SampleExporter::new(random, &config.statistics);

        Ok(Self {
            config,
            repo,
            clock,
            audit,
            protocol,
            machine,
            scheduler,
            battery,
            exporter,
            entropy_source,
            fatal,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Tripped when a fatal runtime failure means the process must stop
    pub fn fatal(&self) -> &FatalLatch {
        &self.fatal
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn protocol(&self) -> &Arc<CommitRevealProtocol> {
        &self.protocol
    }

    pub fn rounds(&self) -> &Arc<RoundLifecycleMachine> {
        &self.machine
    }

    pub fn scheduler(&self) -> &Arc<SchedulerCycle> {
        &self.scheduler
    }

    pub fn battery(&self) -> &StatisticalTestBattery {
        &self.battery
    }

    pub fn exporter(&self) -> &SampleExporter {
        &self.exporter
    }

    /// Card purchase honoring the scheduler's countdown window
    pub async fn purchase_card(&self, alias: &str, layout: CardLayout) -> EngineResult<Card> {
        let round = self.machine.ensure_current_round().await?;
        self.scheduler.ensure_purchase_open(&round).await?;
        self.machine.purchase_card(alias, layout).await
    }

    pub async fn purchase_shield(&self, card_id: &str) -> EngineResult<Card> {
        self.machine.purchase_shield(card_id).await
    }

    pub async fn round(&self, round_id: u64) -> EngineResult<Round> {
        self.repo
            .get_round(round_id)
            .await?
            .ok_or_else(|| RoundError::NoCurrentRound.into())
    }

    pub fn system_info(&self) -> SystemInfo {
        SystemInfo {
            protocol_version: self.config.protocol.protocol_version.clone(),
            hash_algorithm: "sha256".to_string(),
            commitment_scheme: "sha256(hex(seed) || decimal(round_id))".to_string(),
            draw_order_algorithm: "fisher-yates over sha256(domain || seed || round_id || counter)".to_string(),
            minimum_reveal_delay_ms: self.config.protocol.minimum_reveal_delay_ms,
            entropy_source: self.entropy_source.to_string(),
        }
    }

    pub async fn system_audit(&self) -> EngineResult<SystemAuditView> {
        Ok(SystemAuditView {
            system_info: self.system_info(),
            system_stats: self.audit.stats().await?,
            integrity_check: self.audit.verify_integrity().await?,
        })
    }

    pub async fn round_audit(&self, round_id: u64) -> EngineResult<RoundAuditView> {
        Ok(RoundAuditView {
            round_id,
            audit_trail: self.audit.trail_for(round_id).await?,
            integrity: self.audit.verify_round_integrity(round_id).await?,
        })
    }

    /// Re-run the auditor's checks for a round. A revealed round is run
    /// through `verify`, which records the check and marks the reveal verified.
    pub async fn verify_round(&self, round_id: u64) -> EngineResult<RoundVerification> {
        let round = self.round(round_id).await?;
        let commitment = self.protocol.commitment(round_id).await?;
        let reveal = self.protocol.reveal_for(round_id).await?;

        let commitment_valid = match (&commitment, &reveal) {
            (Some(c), Some(r)) => self.protocol.verify(round_id, &r.operator_seed, &c.commit_hash).await?,
            _ => false,
        };

        let stored_order = self.repo.get_draw_order(round_id).await?;
        let (draw_order_matches, calls_follow_order) = match (&reveal, &stored_order) {
            (Some(r), Some(order)) => {
                let recomputed = DrawOrderGenerator::recompute(&r.seed_bytes()?, round_id, round.domain_size);
                let follows = order.symbols.starts_with(&round.called_symbols);
                (Some(recomputed == order.symbols), Some(follows))
            }
            _ => (None, None),
        };

        let audit_integrity = self.audit.verify_round_integrity(round_id).await?;
        let certified = commitment_valid
            && draw_order_matches.unwrap_or(false)
            && calls_follow_order.unwrap_or(false)
            && audit_integrity.certify().is_ok();

        if !certified && reveal.is_some() {
            tracing::warn!(round_id, commitment_valid, ?draw_order_matches, "Round failed verification");
        }

        Ok(RoundVerification {
            round_id,
            commitment,
            reveal: reveal.map(|r| Reveal { verified: r.verified || commitment_valid, ..r }),
            commitment_valid,
            draw_order_matches,
            calls_follow_order,
            audit_integrity,
            certified,
        })
    }

    /// Pure commitment check for externally supplied values
    pub fn check_commitment(seed_hex: &str, round_id: u64, commit_hash: &str) -> bool {
        verify_commitment(seed_hex, round_id, commit_hash)
    }
}
