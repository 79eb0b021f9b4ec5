//! Request Handlers
//!
//! Thin adapters from HTTP to the engine. Every failure carries the request id.

use super::{errors::ApiError, middleware::RequestId, models::*};
use crate::{
    engine::DrawEngine,
    errors::EngineError,
    game::{CallOutcome, CardLayout, Round},
    scheduler::SchedulerState,
    stats::ExportEncoding,
};
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::Utc;
use std::sync::Arc;

/// Default sample count for `stats?action=export`
const DEFAULT_EXPORT_SAMPLES: usize = 1_000;
const RECENT_RESULTS_LIMIT: usize = 20;

/// Shared application state
pub struct AppState {
    pub engine: Arc<DrawEngine>,
    pub version: String,
}

fn engine_error(request_id: &RequestId) -> impl Fn(EngineError) -> ApiError + '_ {
    move |e| ApiError::engine(request_id.0.clone(), e)
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = if state.engine.fatal().is_tripped() { "Halted" } else { "Running" };
    Json(HealthResponse {
        status: status.to_string(),
        version: state.version.clone(),
        time: Utc::now(),
        protocol_version: state.engine.config().protocol.protocol_version.clone(),
    })
}

/// GET /audit?roundId={id}&action=system|round|integrity
pub async fn audit_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditQuery>,
) -> Result<Response, ApiError> {
    let action = params
        .action
        .clone()
        .unwrap_or_else(|| if params.round_id.is_some() { "round" } else { "system" }.to_string());
    tracing::info!(request_id = %request_id.0, action = %action, round_id = ?params.round_id, "Audit query");

    let audit = state.engine.audit();
    let response = match (action.as_str(), params.round_id) {
        ("system", _) => Json(state.engine.system_audit().await.map_err(engine_error(&request_id))?).into_response(),
        ("round", Some(round_id)) => {
            Json(state.engine.round_audit(round_id).await.map_err(engine_error(&request_id))?).into_response()
        }
        ("round", None) => {
            return Err(ApiError::bad_request(request_id.0, "action=round requires roundId".to_string()))
        }
        ("integrity", Some(round_id)) => {
            Json(audit.verify_round_integrity(round_id).await.map_err(engine_error(&request_id))?).into_response()
        }
        ("integrity", None) => Json(audit.verify_integrity().await.map_err(engine_error(&request_id))?).into_response(),
        (other, _) => {
            return Err(ApiError::bad_request(
                request_id.0,
                format!("Unknown action '{}'. Use system, round or integrity", other),
            ))
        }
    };
    Ok(response)
}

/// GET /stats?action=battery|export|info&samples={n}&encoding=decimal|hex|binary
pub async fn stats_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsQuery>,
) -> Result<Response, ApiError> {
    match params.action.as_deref().unwrap_or("info") {
        "battery" => {
            let report = state.engine.battery().run_battery().await.map_err(engine_error(&request_id))?;
            Ok(Json(report).into_response())
        }
        "export" => {
            let encoding = match params.encoding.as_deref() {
                Some(raw) => raw
                    .parse::<ExportEncoding>()
                    .map_err(|e| ApiError::bad_request(request_id.0.clone(), e.to_string()))?,
                None => ExportEncoding::default(),
            };
            let samples = params.samples.unwrap_or(DEFAULT_EXPORT_SAMPLES);
            if samples == 0 {
                return Err(ApiError::bad_request(request_id.0, "samples must be > 0".to_string()));
            }
            let payload = state
                .engine
                .exporter()
                .export(samples, encoding)
                .await
                .map_err(engine_error(&request_id))?;
            Ok(Json(payload).into_response())
        }
        "info" => {
            let recent = state
                .engine
                .battery()
                .recent_results(RECENT_RESULTS_LIMIT)
                .await
                .map_err(engine_error(&request_id))?;
            Ok(Json(serde_json::json!({
                "battery": state.engine.battery().info(),
                "recent_results": recent,
            }))
            .into_response())
        }
        other => Err(ApiError::bad_request(
            request_id.0,
            format!("Unknown action '{}'. Use battery, export or info", other),
        )),
    }
}

/// GET /verify?roundId={id}[&seed={hex}&commitHash={hex}]
///
/// With `seed` and `commitHash` this is the auditor's pure check; without
/// them the whole round is re-verified from stored values.
pub async fn verify_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(params): Query<VerifyQuery>,
) -> Result<Response, ApiError> {
    match (params.seed, params.commit_hash) {
        (Some(seed), Some(commit_hash)) => {
            let valid = state
                .engine
                .protocol()
                .verify(params.round_id, &seed, &commit_hash)
                .await
                .map_err(engine_error(&request_id))?;
            Ok(Json(CommitmentCheckResponse {
                round_id: params.round_id,
                valid,
            })
            .into_response())
        }
        (None, None) => {
            let report = state
                .engine
                .verify_round(params.round_id)
                .await
                .map_err(engine_error(&request_id))?;
            Ok(Json(report).into_response())
        }
        _ => Err(ApiError::bad_request(
            request_id.0,
            "seed and commitHash must be supplied together".to_string(),
        )),
    }
}

/// GET /round/current
pub async fn current_round_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RoundResponse>, ApiError> {
    let rounds = state.engine.rounds();
    let round = rounds.ensure_current_round().await.map_err(engine_error(&request_id))?;
    let cards = rounds.cards(round.id).await.map_err(engine_error(&request_id))?;
    Ok(Json(RoundResponse::new(round, cards.len())))
}

/// POST /round/start
pub async fn start_round_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Round>, ApiError> {
    let rounds = state.engine.rounds();
    rounds.ensure_current_round().await.map_err(engine_error(&request_id))?;
    let round = rounds.start_round().await.map_err(engine_error(&request_id))?;
    Ok(Json(round))
}

/// POST /round/call
pub async fn call_next_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<CallOutcome>, ApiError> {
    let outcome = state.engine.rounds().call_next().await.map_err(engine_error(&request_id))?;
    Ok(Json(outcome))
}

/// POST /round/end
pub async fn end_round_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Round>, ApiError> {
    let round = state.engine.rounds().end_round().await.map_err(engine_error(&request_id))?;
    Ok(Json(round))
}

/// POST /round/reset
pub async fn reset_round_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Round>, ApiError> {
    let round = state.engine.rounds().reset_to_setup().await.map_err(engine_error(&request_id))?;
    Ok(Json(round))
}

/// POST /cards
pub async fn purchase_card_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<PurchaseCardRequest>,
) -> Result<Json<CardResponse>, ApiError> {
    let layout = CardLayout { symbols: body.symbols };
    let card = state
        .engine
        .purchase_card(&body.alias, layout)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(CardResponse::new(card, crate::game::Phase::Setup)))
}

/// POST /cards/{id}/shield
pub async fn purchase_shield_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(card_id): Path<String>,
) -> Result<Json<CardResponse>, ApiError> {
    let card = state.engine.purchase_shield(&card_id).await.map_err(engine_error(&request_id))?;
    let round = state.engine.round(card.round_id).await.map_err(engine_error(&request_id))?;
    Ok(Json(CardResponse::new(card, round.phase)))
}

/// GET /cards/{id}
pub async fn card_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(card_id): Path<String>,
) -> Result<Json<CardResponse>, ApiError> {
    let card = state.engine.rounds().card(&card_id).await.map_err(engine_error(&request_id))?;
    let round = state.engine.round(card.round_id).await.map_err(engine_error(&request_id))?;
    Ok(Json(CardResponse::new(card, round.phase)))
}

/// GET /scheduler
pub async fn scheduler_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<SchedulerState>, ApiError> {
    let scheduler = state.engine.scheduler().state().await.map_err(engine_error(&request_id))?;
    Ok(Json(scheduler))
}

/// POST /scheduler/tick
pub async fn tick_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<TickResponse>, ApiError> {
    let scheduler = state.engine.scheduler();
    let outcome = scheduler.tick().await.map_err(engine_error(&request_id))?;
    let scheduler_state = scheduler.state().await.map_err(engine_error(&request_id))?;
    Ok(Json(TickResponse {
        outcome,
        state: scheduler_state,
    }))
}
