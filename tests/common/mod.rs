//! Shared fixtures for scenario tests
#![allow(dead_code)]

use certdraw::{
    clock::ManualClock,
    config::EngineConfig,
    engine::DrawEngine,
    game::{CardLayout, GameVariant, Symbol},
    rng::{DrawOrderGenerator, EntropySource},
    storage::MemoryRepository,
};
use std::sync::Arc;

/// Every byte this source produces
pub const SEED_BYTE: u8 = 0x07;

pub const START_MS: u64 = 1_700_000_000_000;

/// Constant-byte entropy so the committed seed, and therefore the draw
/// order and trap placement, are known before the round starts.
pub struct FixedEntropy(pub u8);

impl EntropySource for FixedEntropy {
    fn fill(&self, buf: &mut [u8]) -> Result<(), String> {
        buf.fill(self.0);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Entropy that is never available
pub struct FailingEntropy;

impl EntropySource for FailingEntropy {
    fn fill(&self, _buf: &mut [u8]) -> Result<(), String> {
        Err("no entropy device".to_string())
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

pub struct Harness {
    pub engine: Arc<DrawEngine>,
    pub clock: ManualClock,
    pub repo: Arc<MemoryRepository>,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_entropy(config, Arc::new(FixedEntropy(SEED_BYTE)))
    }

    pub fn with_entropy(config: EngineConfig, entropy: Arc<dyn EntropySource>) -> Self {
        let repo = Arc::new(MemoryRepository::new());
        let clock = ManualClock::new(START_MS);
        let engine = DrawEngine::with_parts(config, repo.clone(), Arc::new(clock.clone()), entropy).unwrap();
        Self {
            engine: Arc::new(engine),
            clock,
            repo,
        }
    }

    /// Advance past the minimum reveal delay
    pub fn pass_reveal_delay(&self) {
        self.clock.advance(self.engine.config().protocol.minimum_reveal_delay_ms);
    }

    pub async fn buy(&self, alias: &str, symbols: &[Symbol]) -> certdraw::game::Card {
        self.engine
            .purchase_card(
                alias,
                CardLayout {
                    symbols: symbols.to_vec(),
                },
            )
            .await
            .unwrap()
    }
}

/// Cell index the house traps on a card of `card_size` cells when every
/// entropy byte is `SEED_BYTE` and one trap is placed per card.
pub fn trap_slot(card_size: usize) -> usize {
    (u64::from_le_bytes([SEED_BYTE; 8]) % card_size as u64) as usize
}

/// `symbols` reordered so the house trap lands on `trap`
pub fn layout_with_trap(symbols: &[Symbol], trap: Symbol) -> Vec<Symbol> {
    let mut layout = symbols.to_vec();
    let from = layout.iter().position(|&s| s == trap).unwrap();
    let to = trap_slot(layout.len());
    layout.swap(from, to);
    layout
}

pub fn seed() -> Vec<u8> {
    vec![SEED_BYTE; 32]
}

/// Draw order the engine will produce for `round_id`
pub fn expected_order(round_id: u64, domain_size: u32) -> Vec<Symbol> {
    DrawOrderGenerator::recompute(&seed(), round_id, domain_size)
}

pub fn grid_config(domain_size: u32, card_size: usize) -> EngineConfig {
    let mut config = EngineConfig::testing();
    config.game.variant = GameVariant::NumberGrid;
    config.game.number_grid.domain_size = domain_size;
    config.game.number_grid.card_size = card_size;
    config.game.number_grid.traps_per_card = 1;
    config
}

pub fn letter_config() -> EngineConfig {
    let mut config = EngineConfig::testing();
    config.game.variant = GameVariant::LetterMatch;
    config
}
