use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;

use super::domain::{Polarity, ResponseId, VoterId};
use super::engine::{DecisionEngine, EngineError};
use super::events::ReviewEvents;
use super::store::ReviewStore;

/// Vote event body.
#[derive(Debug, Clone, Deserialize)]
pub struct VoteRequest {
    pub voter_id: VoterId,
    pub polarity: Polarity,
}

/// Undo request body.
#[derive(Debug, Clone, Deserialize)]
pub struct CancelRequest {
    pub voter_id: VoterId,
}

/// Router builder exposing vote, undo and lookup endpoints.
pub fn review_router<S, E>(engine: DecisionEngine<S, E>) -> Router
where
    S: ReviewStore + 'static,
    E: ReviewEvents + 'static,
{
    Router::new()
        .route("/api/v1/applications/stats", get(stats_handler::<S, E>))
        .route(
            "/api/v1/applications/by-message/:message_ref",
            get(by_message_handler::<S, E>),
        )
        .route(
            "/api/v1/applications/:response_id",
            get(application_handler::<S, E>),
        )
        .route(
            "/api/v1/applications/:response_id/votes",
            post(vote_handler::<S, E>),
        )
        .route(
            "/api/v1/applications/:response_id/votes/cancel",
            post(cancel_handler::<S, E>),
        )
        .with_state(engine)
}

pub(crate) async fn vote_handler<S, E>(
    State(engine): State<DecisionEngine<S, E>>,
    Path(response_id): Path<String>,
    axum::Json(request): axum::Json<VoteRequest>,
) -> Response
where
    S: ReviewStore + 'static,
    E: ReviewEvents + 'static,
{
    let response_id = ResponseId(response_id);
    match engine
        .handle_vote(&response_id, &request.voter_id, request.polarity)
        .await
    {
        Ok(report) => (StatusCode::OK, axum::Json(report)).into_response(),
        Err(err) => engine_error_response(err),
    }
}

pub(crate) async fn cancel_handler<S, E>(
    State(engine): State<DecisionEngine<S, E>>,
    Path(response_id): Path<String>,
    axum::Json(request): axum::Json<CancelRequest>,
) -> Response
where
    S: ReviewStore + 'static,
    E: ReviewEvents + 'static,
{
    let response_id = ResponseId(response_id);
    match engine.cancel(&response_id, &request.voter_id).await {
        Ok(outcome) => (StatusCode::OK, axum::Json(outcome)).into_response(),
        Err(err) => engine_error_response(err),
    }
}

pub(crate) async fn application_handler<S, E>(
    State(engine): State<DecisionEngine<S, E>>,
    Path(response_id): Path<String>,
) -> Response
where
    S: ReviewStore + 'static,
    E: ReviewEvents + 'static,
{
    let response_id = ResponseId(response_id);
    match engine.application_view(&response_id).await {
        Ok(Some(view)) => (StatusCode::OK, axum::Json(view)).into_response(),
        Ok(None) => engine_error_response(EngineError::NotFound(response_id)),
        Err(err) => engine_error_response(err),
    }
}

pub(crate) async fn by_message_handler<S, E>(
    State(engine): State<DecisionEngine<S, E>>,
    Path(message_ref): Path<String>,
) -> Response
where
    S: ReviewStore + 'static,
    E: ReviewEvents + 'static,
{
    match engine.application_view_by_message_ref(&message_ref).await {
        Ok(Some(view)) => (StatusCode::OK, axum::Json(view)).into_response(),
        Ok(None) => {
            let payload = json!({
                "error": "no application for message reference",
                "message_ref": message_ref,
            });
            (StatusCode::NOT_FOUND, axum::Json(payload)).into_response()
        }
        Err(err) => engine_error_response(err),
    }
}

pub(crate) async fn stats_handler<S, E>(State(engine): State<DecisionEngine<S, E>>) -> Response
where
    S: ReviewStore + 'static,
    E: ReviewEvents + 'static,
{
    match engine.stats().await {
        Ok(stats) => (StatusCode::OK, axum::Json(stats)).into_response(),
        Err(err) => engine_error_response(err),
    }
}

fn engine_error_response(err: EngineError) -> Response {
    match err {
        EngineError::NotFound(response_id) => {
            let payload = json!({
                "error": "application not found",
                "response_id": response_id,
            });
            (StatusCode::NOT_FOUND, axum::Json(payload)).into_response()
        }
        EngineError::AlreadyDecided(status) => {
            let payload = json!({
                "error": "application already decided",
                "status": status,
            });
            (StatusCode::CONFLICT, axum::Json(payload)).into_response()
        }
        other => {
            let payload = json!({
                "error": other.to_string(),
            });
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(payload)).into_response()
        }
    }
}
