use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use serde::Deserialize;

use crate::entities::{poll, poll_candidate, vote};
use crate::lifecycle::fixed_now;
use crate::models::vote::{CastVoteRequest, VoteHistoryEntry, VoteReceipt};
use crate::state::AppState;
use crate::tally;
use crate::voter;

use super::{HttpError, require_actor_id};

const MAX_HISTORY_LIMIT: u64 = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(submit_vote))
        .route("/{voter_id}/history", get(get_vote_history))
}

#[derive(Debug, Deserialize, Default)]
struct VoteHistoryQuery {
    limit: Option<u64>,
    offset: Option<u64>,
}

async fn submit_vote(
    State(state): State<AppState>,
    Json(request): Json<CastVoteRequest>,
) -> Result<(StatusCode, Json<VoteReceipt>), HttpError> {
    let voter_id = require_actor_id("voter_id", &request.voter_id)?;

    let voter_email = request.voter_email.trim();
    if voter_email.is_empty() {
        return Err(HttpError::bad_request("voter_email must not be empty"));
    }
    if voter_email.len() > voter::MAX_EMAIL_LEN {
        return Err(HttpError::bad_request(format!(
            "voter_email exceeds {} characters",
            voter::MAX_EMAIL_LEN
        )));
    }

    if request.poll_id < 0 {
        return Err(HttpError::bad_request("poll_id must be non-negative"));
    }
    if request.candidate_id < 0 {
        return Err(HttpError::bad_request("candidate_id must be non-negative"));
    }

    let normalized = CastVoteRequest {
        poll_id: request.poll_id,
        candidate_id: request.candidate_id,
        voter_id,
        voter_email: voter_email.to_string(),
    };

    let receipt = tally::cast_vote(&state.database, &normalized, fixed_now()).await?;

    // Counters moved: cached tallies and listing totals are stale.
    state.cache.results.invalidate(&receipt.poll_id).await;
    state.cache.polls.invalidate_all();

    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn get_vote_history(
    Path(voter_id): Path<String>,
    Query(query): Query<VoteHistoryQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<VoteHistoryEntry>>, HttpError> {
    let voter_id = require_actor_id("voter_id", &voter_id)?;

    let requested_limit = query.limit.unwrap_or(100);
    if requested_limit == 0 {
        return Err(HttpError::bad_request("limit must be at least 1"));
    }

    let limit = requested_limit.min(MAX_HISTORY_LIMIT);
    let offset = query.offset.unwrap_or(0);
    assert!(limit > 0, "Vote history limit must be positive");
    assert!(
        offset <= i64::MAX as u64,
        "Vote history offset exceeds bounds"
    );

    let votes = vote::Entity::find()
        .filter(vote::Column::VoterId.eq(voter_id.clone()))
        .order_by_desc(vote::Column::CastAt)
        .limit(limit)
        .offset(offset)
        .all(&state.database)
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    if votes.is_empty() {
        return Ok(Json(Vec::new()));
    }

    let poll_ids: Vec<i64> = votes.iter().map(|record| record.poll_id).collect();
    let candidate_ids: Vec<i64> = votes.iter().map(|record| record.candidate_id).collect();

    let polls: HashMap<i64, poll::Model> = poll::Entity::find()
        .filter(poll::Column::Id.is_in(poll_ids))
        .all(&state.database)
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .into_iter()
        .map(|record| (record.id, record))
        .collect();

    let candidates: HashMap<i64, poll_candidate::Model> = poll_candidate::Entity::find()
        .filter(poll_candidate::Column::Id.is_in(candidate_ids))
        .all(&state.database)
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .into_iter()
        .map(|record| (record.id, record))
        .collect();

    let mut history = Vec::with_capacity(votes.len());
    for record in votes {
        // A vote whose poll vanished (cascade-deleted mid-request) is simply
        // dropped from the listing.
        let Some(poll_record) = polls.get(&record.poll_id) else {
            continue;
        };
        let Some(candidate_record) = candidates.get(&record.candidate_id) else {
            continue;
        };

        history.push(VoteHistoryEntry {
            vote_id: record.id,
            poll_id: record.poll_id,
            poll_title: poll_record.title.clone(),
            poll_status: poll_record.status.clone(),
            candidate_id: record.candidate_id,
            candidate_name: candidate_record.name.clone(),
            cast_at: record.cast_at.timestamp(),
        });
    }

    assert!(
        history.len() <= limit as usize,
        "Vote history result exceeds requested limit",
    );

    Ok(Json(history))
}
