//! Scheduler cycle: wall-clock driven phase advancement
//!
//! `tick` reads the persisted [`SchedulerState`] and the current round and
//! performs at most one transition. Ticks are serialized in-process by a
//! mutex and across processes by the state's conditional write, so repeated
//! or concurrent ticks at the same instant advance the cycle exactly once.

use crate::{
    clock::Clock,
    config::SchedulerConfig,
    errors::{EngineError, EngineResult, ProtocolError, RoundError, Severity, StorageError},
    game::{Phase, Round, RoundLifecycleMachine},
    storage::Repository,
};
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::Mutex;

/// Timing sub-phase layered over the round phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    /// Round in `setup`, purchases open
    PreBuy,
    /// Round in `setup`, purchases closed until start
    Countdown,
    Live,
    WinnerDisplay,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerWindows {
    pub pre_buy_ms: u64,
    pub purchase_block_ms: u64,
    pub winner_display_ms: u64,
}

impl From<&SchedulerConfig> for SchedulerWindows {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            pre_buy_ms: config.pre_buy_window_ms,
            purchase_block_ms: config.purchase_block_window_ms,
            winner_display_ms: config.winner_display_window_ms,
        }
    }
}

impl Default for SchedulerWindows {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

/// Persisted scheduler state, stored alongside the rounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerState {
    pub enabled: bool,
    pub windows: SchedulerWindows,
    pub current_phase: SchedulerPhase,
    /// Round the deadline belongs to
    pub round_id: Option<u64>,
    pub next_phase_deadline: Option<u64>,
    /// Next automatic call while live
    pub next_call_at: Option<u64>,
    pub version: u64,
}

impl SchedulerState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            windows: SchedulerWindows::default(),
            current_phase: SchedulerPhase::PreBuy,
            round_id: None,
            next_phase_deadline: None,
            next_call_at: None,
            version: 0,
        }
    }

    /// Purchases close `purchase_block_ms` before the start deadline
    pub fn purchases_closed(&self, round_id: u64, now: u64) -> bool {
        if !self.enabled || self.round_id != Some(round_id) {
            return false;
        }
        match self.next_phase_deadline {
            Some(deadline) => now.saturating_add(self.windows.purchase_block_ms) >= deadline,
            None => false,
        }
    }
}

/// What a tick did
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TickOutcome {
    Disabled,
    /// Nothing was due
    Idle,
    /// A start deadline was set for a round in setup
    Scheduled { round_id: u64, deadline: u64 },
    CountdownStarted { round_id: u64 },
    RoundStarted { round_id: u64 },
    SymbolCalled { round_id: u64, symbol: u32, ended: bool },
    /// Auto-call refused by the reveal delay; retried on a later tick
    AwaitingReveal { round_id: u64, remaining_ms: u64 },
    WinnerDisplayStarted { round_id: u64, until: u64 },
    RoundReset { previous_round_id: u64, round_id: u64 },
    /// Another caller advanced the cycle first
    Superseded,
}

pub struct SchedulerCycle {
    machine: Arc<RoundLifecycleMachine>,
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    tick_lock: Mutex<()>,
}

impl SchedulerCycle {
    pub fn new(
        machine: Arc<RoundLifecycleMachine>,
        repo: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            machine,
            repo,
            clock,
            config,
            tick_lock: Mutex::new(()),
        }
    }

    pub async fn state(&self) -> EngineResult<SchedulerState> {
        Ok(self
            .repo
            .get_scheduler_state()
            .await?
            .unwrap_or_else(|| self.initial_state()))
    }

    pub async fn set_enabled(&self, enabled: bool) -> EngineResult<SchedulerState> {
        let _guard = self.tick_lock.lock().await;
        let mut state = self.state().await?;
        state.enabled = enabled;
        self.persist(&mut state).await?;
        tracing::info!(enabled, "Scheduler toggled");
        Ok(state)
    }

    /// Rejects purchases during the countdown before a scheduled start
    pub async fn ensure_purchase_open(&self, round: &Round) -> EngineResult<()> {
        let state = self.state().await?;
        if round.phase == Phase::Setup && state.purchases_closed(round.id, self.clock.now_ms()) {
            return Err(RoundError::PurchaseWindowClosed { round_id: round.id }.into());
        }
        Ok(())
    }

    pub async fn tick(&self) -> EngineResult<TickOutcome> {
        let _guard = self.tick_lock.lock().await;

        let mut state = self.state().await?;
        if !state.enabled {
            return Ok(TickOutcome::Disabled);
        }
        state.windows = SchedulerWindows::from(&self.config);

        let round = self.machine.ensure_current_round().await?;
        let now = self.clock.now_ms();

        let outcome = match round.phase {
            Phase::Setup => self.tick_setup(&mut state, &round, now).await,
            Phase::Live => self.tick_live(&mut state, &round, now).await,
            Phase::Ended => self.tick_ended(&mut state, &round, now).await,
        };

        match outcome {
            Ok(TickOutcome::Idle) => Ok(TickOutcome::Idle),
            Ok(outcome) => match self.persist(&mut state).await {
                Ok(()) => {
                    tracing::debug!(?outcome, "Scheduler advanced");
                    Ok(outcome)
                }
                Err(e) if is_superseded(&e) => Ok(TickOutcome::Superseded),
                Err(e) => Err(e),
            },
            Err(e) if is_superseded(&e) => {
                tracing::debug!(error = %e, "Tick lost a race with another writer");
                Ok(TickOutcome::Superseded)
            }
            Err(e) => Err(e),
        }
    }

    async fn tick_setup(&self, state: &mut SchedulerState, round: &Round, now: u64) -> EngineResult<TickOutcome> {
        let deadline = match state.next_phase_deadline {
            Some(deadline) if state.round_id == Some(round.id) => deadline,
            _ => {
                let deadline = now + state.windows.pre_buy_ms;
                state.round_id = Some(round.id);
                state.next_phase_deadline = Some(deadline);
                state.current_phase = SchedulerPhase::PreBuy;
                state.next_call_at = None;
                return Ok(TickOutcome::Scheduled {
                    round_id: round.id,
                    deadline,
                });
            }
        };

        if now >= deadline {
            let started = self.machine.start_round().await?;
            state.current_phase = SchedulerPhase::Live;
            state.next_phase_deadline = None;
            state.next_call_at = self.config.auto_call_interval_ms.map(|interval| now + interval);
            tracing::info!(round_id = started.id, "Scheduler started round");
            return Ok(TickOutcome::RoundStarted { round_id: started.id });
        }

        if state.current_phase != SchedulerPhase::Countdown && state.purchases_closed(round.id, now) {
            state.current_phase = SchedulerPhase::Countdown;
            return Ok(TickOutcome::CountdownStarted { round_id: round.id });
        }
        Ok(TickOutcome::Idle)
    }

    async fn tick_live(&self, state: &mut SchedulerState, round: &Round, now: u64) -> EngineResult<TickOutcome> {
        if state.current_phase != SchedulerPhase::Live || state.round_id != Some(round.id) {
            // Started outside the scheduler.
            state.current_phase = SchedulerPhase::Live;
            state.round_id = Some(round.id);
            state.next_phase_deadline = None;
            state.next_call_at = self.config.auto_call_interval_ms.map(|interval| now + interval);
            return Ok(TickOutcome::RoundStarted { round_id: round.id });
        }

        let Some(interval) = self.config.auto_call_interval_ms else {
            return Ok(TickOutcome::Idle);
        };
        if state.next_call_at.map_or(false, |at| now < at) {
            return Ok(TickOutcome::Idle);
        }

        match self.machine.call_next().await {
            Ok(outcome) => {
                state.next_call_at = Some(now + interval);
                if outcome.ended() {
                    self.enter_winner_display(state, &outcome.round);
                }
                Ok(TickOutcome::SymbolCalled {
                    round_id: round.id,
                    symbol: outcome.symbol,
                    ended: outcome.ended(),
                })
            }
            Err(EngineError::Protocol(ProtocolError::RevealTooEarly { remaining_ms, .. })) => {
                state.next_call_at = Some(now + remaining_ms);
                Ok(TickOutcome::AwaitingReveal {
                    round_id: round.id,
                    remaining_ms,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn tick_ended(&self, state: &mut SchedulerState, round: &Round, now: u64) -> EngineResult<TickOutcome> {
        if state.current_phase != SchedulerPhase::WinnerDisplay || state.round_id != Some(round.id) {
            state.round_id = Some(round.id);
            let until = self.enter_winner_display(state, round);
            return Ok(TickOutcome::WinnerDisplayStarted {
                round_id: round.id,
                until,
            });
        }

        let ended_at = round.ended_at.unwrap_or(now);
        if now.saturating_sub(ended_at) < state.windows.winner_display_ms {
            return Ok(TickOutcome::Idle);
        }

        let next = self.machine.reset_to_setup().await?;
        state.current_phase = SchedulerPhase::PreBuy;
        state.round_id = Some(next.id);
        state.next_phase_deadline = Some(now + state.windows.pre_buy_ms);
        state.next_call_at = None;
        tracing::info!(previous_round_id = round.id, round_id = next.id, "Scheduler reset to setup");
        Ok(TickOutcome::RoundReset {
            previous_round_id: round.id,
            round_id: next.id,
        })
    }

    fn enter_winner_display(&self, state: &mut SchedulerState, round: &Round) -> u64 {
        let until = round.ended_at.unwrap_or_else(|| self.clock.now_ms()) + state.windows.winner_display_ms;
        state.current_phase = SchedulerPhase::WinnerDisplay;
        state.next_phase_deadline = Some(until);
        state.next_call_at = None;
        until
    }

    async fn persist(&self, state: &mut SchedulerState) -> EngineResult<()> {
        self.repo.put_scheduler_state(state).await?;
        state.version += 1;
        Ok(())
    }

    fn initial_state(&self) -> SchedulerState {
        SchedulerState {
            windows: SchedulerWindows::from(&self.config),
            ..SchedulerState::new(self.config.enabled)
        }
    }
}

/// Errors meaning a concurrent caller already performed the transition
fn is_superseded(e: &EngineError) -> bool {
    matches!(
        e,
        EngineError::Storage(StorageError::Conflict { .. })
            | EngineError::Round(RoundError::InvalidPhaseTransition { .. })
            | EngineError::Protocol(ProtocolError::DuplicateCommit { .. })
    )
}

/// Background task driving `tick` on an interval
pub struct SchedulerWorker {
    running: Arc<AtomicBool>,
}

impl SchedulerWorker {
    pub fn spawn(cycle: Arc<SchedulerCycle>, interval: Duration) -> Arc<Self> {
        let worker = Arc::new(Self {
            running: Arc::new(AtomicBool::new(true)),
        });
        let running = worker.running.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            while running.load(Ordering::SeqCst) {
                tick.tick().await;
                match cycle.tick().await {
                    Ok(TickOutcome::Idle) | Ok(TickOutcome::Disabled) => {}
                    Ok(outcome) => tracing::debug!(?outcome, "Scheduler tick"),
                    Err(e) if e.severity() == Severity::Fatal => {
                        tracing::error!(error = %e, code = e.code(), "Scheduler tick failed fatally; stopping worker");
                        running.store(false, Ordering::SeqCst);
                    }
                    Err(e) if e.is_alerting() => tracing::error!(error = %e, code = e.code(), "Scheduler tick failed"),
                    Err(e) => tracing::warn!(error = %e, "Scheduler tick failed"),
                }
            }
            tracing::info!("Scheduler worker stopped");
        });

        worker
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
