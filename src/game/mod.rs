//! Round lifecycle and card rules for both game variants

pub mod card;
pub mod round;
pub mod types;

pub use card::{standings, CallEffect, LayoutRules};
pub use round::{CallOutcome, RoundLifecycleMachine};
pub use types::{
    Card, CardLayout, Cell, EndReason, GameVariant, Phase, Round, RoundWinner, ShieldState, Symbol, Winner,
};
