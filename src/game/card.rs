//! Card rules: layout validation, applying a called symbol, standings

use super::types::{Card, CardLayout, Cell, GameVariant, RoundWinner, ShieldState, Symbol, Winner};
use crate::errors::RoundError;
use std::collections::HashSet;

/// What one called symbol did to one card
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallEffect {
    pub matched: bool,
    pub trap_hit: bool,
    pub shield_consumed: bool,
    pub exploded: bool,
    pub newly_completed: bool,
}

impl CallEffect {
    pub fn changed(&self) -> bool {
        self.matched || self.trap_hit
    }
}

/// Shape constraints for a layout in a given round
#[derive(Debug, Clone, Copy)]
pub struct LayoutRules {
    pub domain_size: u32,
    pub card_size: usize,
    pub traps_per_card: usize,
}

impl LayoutRules {
    pub fn validate(&self, layout: &CardLayout) -> Result<(), RoundError> {
        let invalid = |msg: String| Err(RoundError::InvalidCard(msg));

        if layout.symbols.len() != self.card_size {
            return invalid(format!(
                "expected {} symbols, got {}",
                self.card_size,
                layout.symbols.len()
            ));
        }
        let mut seen = HashSet::new();
        for &s in &layout.symbols {
            if s == 0 || s > self.domain_size {
                return invalid(format!("symbol {} outside 1..={}", s, self.domain_size));
            }
            if !seen.insert(s) {
                return invalid(format!("symbol {} appears twice", s));
            }
        }

        if self.traps_per_card >= self.card_size {
            return invalid("a card needs at least one scoring cell".to_string());
        }
        Ok(())
    }
}

impl Card {
    /// Cells from a validated layout with the house-chosen trap symbols
    pub fn cells_from(layout: &CardLayout, traps: &HashSet<Symbol>) -> Vec<Cell> {
        layout
            .symbols
            .iter()
            .map(|&symbol| Cell {
                symbol,
                matched: false,
                trap: traps.contains(&symbol),
            })
            .collect()
    }

    /// Matched scoring cells. Traps never count.
    pub fn match_count(&self) -> usize {
        self.cells.iter().filter(|c| c.matched && !c.trap).count()
    }

    pub fn scoring_cells(&self) -> usize {
        self.cells.iter().filter(|c| !c.trap).count()
    }

    /// Apply a called symbol. Exploded cards are frozen.
    pub fn apply_call(&mut self, symbol: Symbol) -> CallEffect {
        let mut effect = CallEffect::default();
        if self.exploded {
            return effect;
        }

        let Some(cell) = self.cells.iter_mut().find(|c| c.symbol == symbol && !c.matched) else {
            return effect;
        };
        cell.matched = true;

        if cell.trap {
            effect.trap_hit = true;
            if self.shield == ShieldState::Armed {
                self.shield = ShieldState::Consumed;
                effect.shield_consumed = true;
            } else {
                self.exploded = true;
                effect.exploded = true;
            }
        } else {
            effect.matched = true;
        }

        if !self.completed && !self.exploded && self.match_count() == self.scoring_cells() {
            self.completed = true;
            effect.newly_completed = true;
        }
        effect
    }

    /// Card with trap positions hidden, for display while the round runs
    pub fn concealed(&self) -> Card {
        let mut card = self.clone();
        for cell in card.cells.iter_mut() {
            if !(cell.trap && cell.matched) {
                cell.trap = false;
            }
        }
        card
    }
}

/// Best result among eligible cards; ties are a draw.
pub fn standings(variant: GameVariant, cards: &[Card]) -> Option<RoundWinner> {
    let eligible: Vec<&Card> = match variant {
        GameVariant::NumberGrid => cards.iter().filter(|c| !c.exploded).collect(),
        GameVariant::LetterMatch => {
            let completed: Vec<&Card> = cards.iter().filter(|c| c.completed).collect();
            if completed.is_empty() {
                cards.iter().collect()
            } else {
                completed
            }
        }
    };

    let best = eligible.iter().map(|c| c.match_count()).max()?;
    let aliases = eligible
        .iter()
        .filter(|c| c.match_count() == best)
        .map(|c| c.alias.clone())
        .collect();
    Winner::from_aliases(aliases).map(|winner| RoundWinner {
        winner,
        match_count: best,
    })
}

/// Winner from cards that completed in the same call step
pub fn co_winners(completed: &[&Card]) -> Option<RoundWinner> {
    let match_count = completed.iter().map(|c| c.match_count()).max()?;
    let aliases = completed.iter().map(|c| c.alias.clone()).collect();
    Winner::from_aliases(aliases).map(|winner| RoundWinner { winner, match_count })
}
