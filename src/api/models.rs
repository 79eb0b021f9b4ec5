//! API Data Models
//!
//! Query parameters, request bodies and response shapes for the HTTP surface.

use crate::{
    game::{Card, Phase, Round},
    scheduler::{SchedulerState, TickOutcome},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub time: DateTime<Utc>,
    pub protocol_version: String,
}

/// GET /audit?roundId=&action=system|round|integrity
#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    #[serde(default, rename = "roundId", alias = "round_id")]
    pub round_id: Option<u64>,
    #[serde(default)]
    pub action: Option<String>,
}

/// GET /stats?action=battery|export|info&samples=&encoding=
#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub samples: Option<usize>,
    #[serde(default)]
    pub encoding: Option<String>,
}

/// GET /verify?roundId=[&seed=&commitHash=]
#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "roundId", alias = "round_id")]
    pub round_id: u64,
    #[serde(default)]
    pub seed: Option<String>,
    #[serde(default, rename = "commitHash", alias = "commit_hash")]
    pub commit_hash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitmentCheckResponse {
    pub round_id: u64,
    pub valid: bool,
}

/// Players pick symbols only. Unknown fields are ignored.
#[derive(Debug, Serialize, Deserialize)]
pub struct PurchaseCardRequest {
    pub alias: String,
    pub symbols: Vec<u32>,
}

/// Current round with display labels
#[derive(Debug, Serialize, Deserialize)]
pub struct RoundResponse {
    pub round: Round,
    pub called_labels: Vec<String>,
    pub card_count: usize,
}

impl RoundResponse {
    pub fn new(round: Round, card_count: usize) -> Self {
        let called_labels = round
            .called_symbols
            .iter()
            .map(|&s| round.variant.label(s))
            .collect();
        Self {
            round,
            called_labels,
            card_count,
        }
    }
}

/// Card as shown to players; traps stay hidden until the round ends
#[derive(Debug, Serialize, Deserialize)]
pub struct CardResponse {
    pub card: Card,
    pub match_count: usize,
    pub round_phase: Phase,
}

impl CardResponse {
    pub fn new(card: Card, round_phase: Phase) -> Self {
        let match_count = card.match_count();
        let card = if round_phase == Phase::Ended {
            card
        } else {
            card.concealed()
        };
        Self {
            card,
            match_count,
            round_phase,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TickResponse {
    pub outcome: TickOutcome,
    pub state: SchedulerState,
}
