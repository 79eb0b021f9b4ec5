//! Round lifecycle state machine
//!
//! `setup -> live -> ended`. Every phase-mutating operation reads the current
//! round, computes the next state in memory and persists it with one
//! conditional write, so a concurrent writer causes a retryable conflict and
//! never a partially applied change.

use super::card::{co_winners, standings, LayoutRules};
use super::types::{Card, CardLayout, EndReason, GameVariant, Phase, Round, RoundWinner, ShieldState, Symbol};
use crate::{
    clock::Clock,
    config::{GameConfig, PricingConfig},
    errors::{EngineError, EngineResult, ProtocolError, RoundError},
    rng::{CommitRevealProtocol, DrawOrder, DrawOrderGenerator, SecureRandomSource},
    storage::Repository,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Result of one `call_next`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOutcome {
    pub round_id: u64,
    pub symbol: Symbol,
    pub label: String,
    /// 1-based position in the draw order
    pub position: usize,
    pub matched_cards: Vec<String>,
    pub exploded_cards: Vec<String>,
    pub shields_consumed: Vec<String>,
    pub completed_cards: Vec<String>,
    pub round: Round,
}

impl CallOutcome {
    pub fn ended(&self) -> bool {
        self.round.phase == Phase::Ended
    }
}

pub struct RoundLifecycleMachine {
    repo: Arc<dyn Repository>,
    protocol: Arc<CommitRevealProtocol>,
    draws: Arc<DrawOrderGenerator>,
    random: SecureRandomSource,
    clock: Arc<dyn Clock>,
    game: GameConfig,
    pricing: PricingConfig,
}

impl RoundLifecycleMachine {
    pub fn new(
        repo: Arc<dyn Repository>,
        protocol: Arc<CommitRevealProtocol>,
        draws: Arc<DrawOrderGenerator>,
        random: SecureRandomSource,
        clock: Arc<dyn Clock>,
        game: GameConfig,
        pricing: PricingConfig,
    ) -> Self {
        Self {
            repo,
            protocol,
            draws,
            random,
            clock,
            game,
            pricing,
        }
    }

    pub async fn current_round(&self) -> EngineResult<Round> {
        self.repo
            .get_current_round()
            .await?
            .ok_or_else(|| RoundError::NoCurrentRound.into())
    }

    /// Current round, creating the first one in `setup` on a fresh store
    pub async fn ensure_current_round(&self) -> EngineResult<Round> {
        if let Some(round) = self.repo.get_current_round().await? {
            return Ok(round);
        }
        match self.open_round(None).await {
            Ok(round) => Ok(round),
            // Another caller opened the first round in the meantime.
            Err(e) if e.is_conflict() => self.current_round().await,
            Err(e) => Err(e),
        }
    }

    pub async fn start_round(&self) -> EngineResult<Round> {
        let mut round = self.current_round().await?;
        if round.phase != Phase::Setup {
            return Err(RoundError::InvalidPhaseTransition {
                operation: "start_round",
                phase: round.phase,
            }
            .into());
        }

        // A commitment left by an earlier attempt that lost the round write
        // still binds this round and nothing has been revealed.
        if self.protocol.commitment(round.id).await?.is_none() {
            self.protocol.commit(round.id).await?;
        }

        let cards = self.repo.cards_for_round(round.id).await?;
        round.phase = Phase::Live;
        round.called_symbols.clear();
        round.started_at = Some(self.clock.now_ms());
        round.total_collected = total_collected(&cards);

        self.repo.upsert_round(&round).await?;
        round.version += 1;

        tracing::info!(
            round_id = round.id,
            variant = %round.variant,
            cards = cards.len(),
            total_collected = round.total_collected,
            "Round started"
        );
        Ok(round)
    }

    /// Call the next symbol of the draw order and apply it to every card.
    /// Ends the round in the same write when an end condition becomes true.
    pub async fn call_next(&self) -> EngineResult<CallOutcome> {
        let mut round = self.current_round().await?;
        if round.phase != Phase::Live {
            return Err(RoundError::InvalidPhaseTransition {
                operation: "call_next",
                phase: round.phase,
            }
            .into());
        }
        if round.is_exhausted() {
            return Err(RoundError::DomainExhausted { round_id: round.id }.into());
        }

        let order = self.draw_order_for(&round).await?;
        let position = round.called_symbols.len();
        let symbol = order
            .symbol_at(position)
            .ok_or(RoundError::DomainExhausted { round_id: round.id })?;
        if round.called_symbols.contains(&symbol) {
            tracing::error!(round_id = round.id, symbol, position, "Draw order yielded an already called symbol");
            return Err(RoundError::AlreadyCalled {
                round_id: round.id,
                symbol,
            }
            .into());
        }

        let mut cards = self.repo.cards_for_round(round.id).await?;
        let mut changed = Vec::new();
        let mut outcome_cards = CardEffects::default();
        for card in cards.iter_mut() {
            let effect = card.apply_call(symbol);
            if !effect.changed() {
                continue;
            }
            if effect.matched {
                outcome_cards.matched.push(card.id.clone());
            }
            if effect.exploded {
                outcome_cards.exploded.push(card.id.clone());
            }
            if effect.shield_consumed {
                outcome_cards.shields.push(card.id.clone());
            }
            if effect.newly_completed {
                outcome_cards.completed.push(card.id.clone());
            }
            changed.push(card.clone());
        }
        round.called_symbols.push(symbol);

        let newly_completed: Vec<&Card> = cards
            .iter()
            .filter(|c| outcome_cards.completed.contains(&c.id))
            .collect();
        if let Some((reason, winner)) = self.end_condition(&round, &cards, &newly_completed) {
            self.finish(&mut round, &cards, reason, winner);
        }

        self.repo.commit_round_update(&round, &changed).await?;
        round.version += 1;

        tracing::info!(
            round_id = round.id,
            symbol,
            position = position + 1,
            matched = outcome_cards.matched.len(),
            exploded = outcome_cards.exploded.len(),
            "Symbol called"
        );
        if round.phase == Phase::Ended {
            log_round_end(&round);
        }

        Ok(CallOutcome {
            round_id: round.id,
            symbol,
            label: round.variant.label(symbol),
            position: position + 1,
            matched_cards: outcome_cards.matched,
            exploded_cards: outcome_cards.exploded,
            shields_consumed: outcome_cards.shields,
            completed_cards: outcome_cards.completed,
            round,
        })
    }

    /// End the live round. Without a pending end condition this is a forced
    /// end on current standings. Irreversible; calling it on a round that
    /// already ended returns the final state unchanged.
    pub async fn end_round(&self) -> EngineResult<Round> {
        let mut round = self.current_round().await?;
        match round.phase {
            Phase::Live => {}
            Phase::Ended => {
                tracing::debug!(round_id = round.id, "Round already ended");
                return Ok(round);
            }
            phase => {
                return Err(RoundError::InvalidPhaseTransition {
                    operation: "end_round",
                    phase,
                }
                .into())
            }
        }

        let cards = self.repo.cards_for_round(round.id).await?;
        let completed: Vec<&Card> = cards.iter().filter(|c| c.completed).collect();
        let (reason, winner) = self
            .end_condition(&round, &cards, &completed)
            .unwrap_or_else(|| (EndReason::Forced, standings(round.variant, &cards)));

        self.finish(&mut round, &cards, reason, winner);
        self.repo.upsert_round(&round).await?;
        round.version += 1;

        log_round_end(&round);
        Ok(round)
    }

    /// Open a fresh round in `setup`. The ended round is left untouched.
    /// Of two concurrent resets of the same round only one opens a round;
    /// the other gets a retryable conflict.
    pub async fn reset_to_setup(&self) -> EngineResult<Round> {
        let current = self.repo.get_current_round().await?;
        if let Some(round) = &current {
            if round.phase != Phase::Ended {
                return Err(RoundError::InvalidPhaseTransition {
                    operation: "reset_to_setup",
                    phase: round.phase,
                }
                .into());
            }
        }
        self.open_round(current.as_ref()).await
    }

    /// Buy a card for the current round while it is in `setup`. Trap cells
    /// are always placed by the house.
    pub async fn purchase_card(&self, alias: &str, layout: CardLayout) -> EngineResult<Card> {
        let alias = alias.trim();
        if alias.is_empty() {
            return Err(RoundError::InvalidCard("alias must not be empty".to_string()).into());
        }

        let mut attempt = 1;
        loop {
            let round = self.current_round().await?;
            match self.try_purchase_card(&round, alias, &layout).await {
                // A purchase by someone else moved the round version; the
                // phase check above is redone against the fresh round.
                Err(e) if e.is_conflict() && attempt < PURCHASE_ATTEMPTS => {
                    tracing::debug!(round_id = round.id, attempt, "Card purchase raced another writer");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn try_purchase_card(&self, round: &Round, alias: &str, layout: &CardLayout) -> EngineResult<Card> {
        if round.phase != Phase::Setup {
            return Err(RoundError::InvalidPhaseTransition {
                operation: "purchase_card",
                phase: round.phase,
            }
            .into());
        }
        let rules = self.layout_rules(round);
        rules.validate(layout)?;

        let traps: HashSet<Symbol> = if round.variant == GameVariant::NumberGrid && rules.traps_per_card > 0 {
            self.random
                .choose_indices(Some(round.id), layout.symbols.len(), rules.traps_per_card, "trap_assignment")
                .await?
                .into_iter()
                .map(|i| layout.symbols[i])
                .collect()
        } else {
            HashSet::new()
        };

        let card = Card {
            id: Uuid::new_v4().to_string(),
            round_id: round.id,
            alias: alias.to_string(),
            cells: Card::cells_from(layout, &traps),
            shield: ShieldState::None,
            exploded: false,
            completed: false,
            amount_paid: self.pricing.card_price,
            purchased_at: self.clock.now_ms(),
            version: 0,
        };
        self.repo.insert_card(&card, round.version).await?;

        tracing::info!(round_id = round.id, card_id = %card.id, alias = %card.alias, "Card purchased");
        Ok(card)
    }

    /// Arm the card's one shield. Allowed in `setup` and `live`.
    pub async fn purchase_shield(&self, card_id: &str) -> EngineResult<Card> {
        let mut card = self
            .repo
            .get_card(card_id)
            .await?
            .ok_or_else(|| RoundError::CardNotFound(card_id.to_string()))?;
        let round = self
            .repo
            .get_round(card.round_id)
            .await?
            .ok_or(RoundError::NoCurrentRound)?;

        if round.phase == Phase::Ended {
            return Err(RoundError::InvalidPhaseTransition {
                operation: "purchase_shield",
                phase: round.phase,
            }
            .into());
        }
        if round.variant != GameVariant::NumberGrid || card.shield != ShieldState::None || card.exploded {
            return Err(RoundError::ShieldUnavailable(card_id.to_string()).into());
        }

        card.shield = ShieldState::Armed;
        card.amount_paid += self.pricing.shield_price;
        self.repo.update_card(&card).await?;
        card.version += 1;

        tracing::info!(round_id = round.id, card_id = %card.id, "Shield purchased");
        Ok(card)
    }

    pub async fn card(&self, card_id: &str) -> EngineResult<Card> {
        self.repo
            .get_card(card_id)
            .await?
            .ok_or_else(|| RoundError::CardNotFound(card_id.to_string()).into())
    }

    pub async fn cards(&self, round_id: u64) -> EngineResult<Vec<Card>> {
        self.repo.cards_for_round(round_id).await
    }

    pub fn variant(&self) -> GameVariant {
        self.game.variant
    }

    /// The round's draw order, generating it on first use. Generation
    /// reveals the committed seed, which `RevealTooEarly` may refuse.
    async fn draw_order_for(&self, round: &Round) -> EngineResult<DrawOrder> {
        if let Some(order) = self.draws.existing(round.id).await? {
            return Ok(order);
        }

        match self.protocol.reveal(round.id).await {
            Ok(_) | Err(EngineError::Protocol(ProtocolError::AlreadyRevealed { .. })) => {}
            Err(e) => return Err(e),
        }

        match self.draws.generate(round.id, round.domain_size).await {
            Ok(order) => Ok(order),
            // Lost a race with a concurrent caller that generated it first.
            Err(EngineError::Protocol(ProtocolError::SeedUnavailable { .. })) => self
                .draws
                .existing(round.id)
                .await?
                .ok_or_else(|| ProtocolError::SeedUnavailable { round_id: round.id }.into()),
            Err(e) => Err(e),
        }
    }

    fn end_condition(
        &self,
        round: &Round,
        cards: &[Card],
        completed: &[&Card],
    ) -> Option<(EndReason, Option<RoundWinner>)> {
        match round.variant {
            GameVariant::LetterMatch if !completed.is_empty() => {
                return Some((EndReason::CardCompleted, co_winners(completed)));
            }
            GameVariant::NumberGrid if !cards.is_empty() && cards.iter().all(|c| c.exploded) => {
                return Some((EndReason::AllCardsExploded, None));
            }
            _ => {}
        }
        if round.is_exhausted() {
            return Some((EndReason::DomainExhausted, standings(round.variant, cards)));
        }
        None
    }

    fn finish(&self, round: &mut Round, cards: &[Card], reason: EndReason, winner: Option<RoundWinner>) {
        round.phase = Phase::Ended;
        round.ended_at = Some(self.clock.now_ms());
        round.end_reason = Some(reason);
        round.winner = winner;
        round.total_collected = total_collected(cards);
        round.prize_pool = (round.total_collected as f64 * self.pricing.payout_fraction).round() as u64;
    }

    fn layout_rules(&self, round: &Round) -> LayoutRules {
        LayoutRules {
            domain_size: round.domain_size,
            card_size: self.game.card_size(),
            traps_per_card: self.game.traps_per_card(),
        }
    }

    async fn open_round(&self, replacing: Option<&Round>) -> EngineResult<Round> {
        // The store assigns the id.
        let template = Round::new(0, self.game.variant, self.game.domain_size(), self.clock.now_ms());
        let round = self.repo.open_round(template, replacing).await?;
        tracing::info!(round_id = round.id, variant = %round.variant, "Round opened for setup");
        Ok(round)
    }
}

const PURCHASE_ATTEMPTS: u32 = 3;

#[derive(Default)]
struct CardEffects {
    matched: Vec<String>,
    exploded: Vec<String>,
    shields: Vec<String>,
    completed: Vec<String>,
}

fn total_collected(cards: &[Card]) -> u64 {
    cards.iter().map(|c| c.amount_paid).sum()
}

fn log_round_end(round: &Round) {
    tracing::info!(
        round_id = round.id,
        reason = ?round.end_reason,
        winner = ?round.winner.as_ref().map(|w| w.winner.aliases().join(",")),
        prize_pool = round.prize_pool,
        calls = round.called_symbols.len(),
        "Round ended"
    );
}
