use std::sync::atomic::Ordering as AtomicOrdering;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::Method;
use axum::http::StatusCode;
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::state::AppState;
use crate::tally::TallyError;

mod polls;
mod votes;

pub fn router(state: AppState) -> Router {
    assert!(
        state.start_time.elapsed() < Duration::from_secs(86_400),
        "Application uptime exceeds 24 hours before router creation"
    );

    // CORS is open for the campus web client; restrict per deployment.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([ACCEPT, AUTHORIZATION, CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    let polls_router = polls::router().with_state(state.clone());
    let votes_router = votes::router().with_state(state.clone());
    Router::new()
        .route("/health", get(health_live))
        .route("/health/ready", get(health_ready))
        .nest("/polls", polls_router)
        .nest("/votes", votes_router)
        .layer(cors)
        .with_state(state)
}

async fn health_live(State(state): State<AppState>) -> Result<Json<HealthResponse>, HttpError> {
    let uptime = state.start_time.elapsed().as_secs();
    assert!(
        uptime <= 31_536_000,
        "Uptime exceeds one year without restart"
    );
    let response = HealthResponse {
        status: "live",
        uptime_seconds: uptime,
    };
    Ok(Json(response))
}

async fn health_ready(State(state): State<AppState>) -> Result<Json<ReadyResponse>, HttpError> {
    state
        .database
        .ping()
        .await
        .map_err(|err| HttpError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;

    let last_reconciled_at = state.last_reconciled_at.load(AtomicOrdering::SeqCst);
    assert!(
        last_reconciled_at <= i64::MAX as u64,
        "Reconciler timestamp exceeds bounds"
    );

    let response = ReadyResponse {
        status: "ready",
        last_reconciled_at,
        cache_entries: CacheSummary {
            results: state.cache.results.entry_count(),
            polls: state.cache.polls.entry_count(),
        },
    };
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    status: &'static str,
    last_reconciled_at: u64,
    cache_entries: CacheSummary,
}

#[derive(Debug, Serialize)]
struct CacheSummary {
    results: u64,
    polls: u64,
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: String) -> Self {
        assert!(status != StatusCode::OK, "Error status cannot be 200");
        assert!(!message.is_empty(), "Error message cannot be empty");
        Self { status, message }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message.into())
    }
}

impl From<TallyError> for HttpError {
    fn from(err: TallyError) -> Self {
        let status = match &err {
            TallyError::PollNotFound(_) => StatusCode::NOT_FOUND,
            TallyError::PollNotActive(_) => StatusCode::CONFLICT,
            TallyError::UnsupportedBallot(_) => StatusCode::NOT_IMPLEMENTED,
            TallyError::InvalidCandidate { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            TallyError::AlreadyVoted(_) => StatusCode::CONFLICT,
            TallyError::NotEligible(_) => StatusCode::FORBIDDEN,
            TallyError::MalformedRecord(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TallyError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

pub(crate) const MAX_ACTOR_ID_LEN: usize = 128;

/// Validates a client-supplied principal identifier (voter or owner id).
/// These arrive over the wire, so an over-long value is a 400, not an
/// invariant violation; the bound matches the storage column width.
pub(crate) fn require_actor_id(label: &str, raw: &str) -> Result<String, HttpError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(HttpError::bad_request(format!("{label} must not be empty")));
    }
    if trimmed.len() > MAX_ACTOR_ID_LEN {
        return Err(HttpError::bad_request(format!(
            "{label} exceeds {MAX_ACTOR_ID_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        info!("HTTP error: {}", self.message);
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_ids_are_trimmed() {
        let id = require_actor_id("voter_id", "  firebase-uid-42  ").expect("valid id");
        assert_eq!(id, "firebase-uid-42");
    }

    #[test]
    fn empty_actor_ids_are_rejected() {
        let err = require_actor_id("voter_id", "   ").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("voter_id"));
    }

    #[test]
    fn overlong_actor_ids_are_a_bad_request_not_a_panic() {
        let raw = "x".repeat(MAX_ACTOR_ID_LEN + 1);
        let err = require_actor_id("created_by", &raw).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("created_by"));

        let at_bound = "x".repeat(MAX_ACTOR_ID_LEN);
        assert!(require_actor_id("created_by", &at_bound).is_ok());
    }
}
