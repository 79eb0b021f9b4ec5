use serde::{Deserialize, Serialize};
use std::fmt;

/// A drawable symbol. Numbers are `1..=domain_size`; letters map `1 => 'A'`.
pub type Symbol = u32;

/// Round phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Setup,
    Live,
    Ended,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Setup => write!(f, "setup"),
            Phase::Live => write!(f, "live"),
            Phase::Ended => write!(f, "ended"),
        }
    }
}

/// Supported game variants
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GameVariant {
    /// Numbered grid with hidden traps and purchasable shields
    NumberGrid,
    /// Letter matching, first completion ends the round
    LetterMatch,
}

impl fmt::Display for GameVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameVariant::NumberGrid => write!(f, "number_grid"),
            GameVariant::LetterMatch => write!(f, "letter_match"),
        }
    }
}

impl GameVariant {
    /// Human label for a symbol in this variant
    pub fn label(&self, symbol: Symbol) -> String {
        match self {
            GameVariant::NumberGrid => symbol.to_string(),
            GameVariant::LetterMatch => char::from_u32('A' as u32 + symbol.saturating_sub(1))
                .map(|c| c.to_string())
                .unwrap_or_else(|| symbol.to_string()),
        }
    }
}

/// Final winner of a round. Ties are reported, never broken.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Winner {
    Single(String),
    Draw(Vec<String>),
}

impl Winner {
    /// Build from the aliases sharing the best result
    pub fn from_aliases(mut aliases: Vec<String>) -> Option<Self> {
        aliases.sort();
        aliases.dedup();
        match aliases.len() {
            0 => None,
            1 => aliases.pop().map(Winner::Single),
            _ => Some(Winner::Draw(aliases)),
        }
    }

    pub fn aliases(&self) -> Vec<&str> {
        match self {
            Winner::Single(alias) => vec![alias.as_str()],
            Winner::Draw(aliases) => aliases.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundWinner {
    pub winner: Winner,
    pub match_count: usize,
}

/// Why a round ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Every card in the round exploded on a trap
    AllCardsExploded,
    /// Every symbol of the domain has been called
    DomainExhausted,
    /// At least one letter card completed
    CardCompleted,
    /// Ended by an operator while live
    Forced,
}

/// One game round. Only the lifecycle machine mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Round {
    pub id: u64,
    pub variant: GameVariant,
    pub domain_size: u32,
    pub phase: Phase,
    /// Append-only during `live`, drained from the draw order in order.
    pub called_symbols: Vec<Symbol>,
    pub prize_pool: u64,
    pub total_collected: u64,
    pub winner: Option<RoundWinner>,
    pub end_reason: Option<EndReason>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub ended_at: Option<u64>,
    /// Row version for conditional writes
    pub version: u64,
}

impl Round {
    pub fn new(id: u64, variant: GameVariant, domain_size: u32, created_at: u64) -> Self {
        Self {
            id,
            variant,
            domain_size,
            phase: Phase::Setup,
            called_symbols: Vec::new(),
            prize_pool: 0,
            total_collected: 0,
            winner: None,
            end_reason: None,
            created_at,
            started_at: None,
            ended_at: None,
            version: 0,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.called_symbols.len() >= self.domain_size as usize
    }
}

/// Shield protection state of a card
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShieldState {
    #[default]
    None,
    Armed,
    Consumed,
}

/// One position on a card
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cell {
    pub symbol: Symbol,
    pub matched: bool,
    /// Hidden from players until the round ends
    #[serde(default)]
    pub trap: bool,
}

/// A player's card for one round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Card {
    pub id: String,
    pub round_id: u64,
    pub alias: String,
    pub cells: Vec<Cell>,
    #[serde(default)]
    pub shield: ShieldState,
    pub exploded: bool,
    /// Monotonic within a round: never reverts to false.
    pub completed: bool,
    pub amount_paid: u64,
    pub purchased_at: u64,
    pub version: u64,
}

/// Player-chosen card symbols. Trap cells are never part of the layout;
/// the house places them at purchase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardLayout {
    pub symbols: Vec<Symbol>,
}
