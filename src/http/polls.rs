use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use serde::Deserialize;

use crate::entities::{poll, poll_candidate, vote};
use crate::lifecycle::{self, PollStatus, fixed_now, to_fixed_offset};
use crate::models::poll::{
    CandidateTally, CandidateView, CreatePollRequest, PollResultsView, PollSummary, PollView,
    UpdatePollRequest, validate_poll,
};
use crate::models::vote::VoteView;
use crate::state::AppState;
use crate::tally;
use crate::voter;

use super::{HttpError, require_actor_id};

const MAX_POLL_QUERY_LIMIT: u64 = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_polls).post(create_poll))
        .route(
            "/{poll_id}",
            get(get_poll).put(update_poll).delete(delete_poll),
        )
        .route("/{poll_id}/results", get(get_poll_results))
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct GetPollsQuery {
    status: Option<String>,
    created_by: Option<String>,
    voter_email: Option<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct PollDetailQuery {
    voter_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeletePollQuery {
    requested_by: String,
}

async fn get_polls(
    Query(query): Query<GetPollsQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<PollSummary>>, HttpError> {
    let requested_limit = query.limit.unwrap_or(50);
    if requested_limit == 0 {
        return Err(HttpError::bad_request("limit must be positive"));
    }

    let limit = requested_limit.min(MAX_POLL_QUERY_LIMIT);
    let offset = query.offset.unwrap_or(0);
    assert!(limit > 0, "Poll limit must be positive");
    assert!(
        offset <= i64::MAX as u64,
        "Poll offset exceeds database bounds"
    );

    let status_filter = match query.status.as_deref() {
        Some(raw) => Some(
            PollStatus::parse(raw)
                .ok_or_else(|| HttpError::bad_request(format!("unknown status {raw:?}")))?,
        ),
        None => None,
    };

    let cache_key = format!(
        "{}|{}|{}|{limit}|{offset}",
        query.status.as_deref().unwrap_or("*"),
        query.created_by.as_deref().unwrap_or("*"),
        query.voter_email.as_deref().unwrap_or("*"),
    );
    if let Some(cached) = state.cache.polls.get(&cache_key).await {
        let summaries: Vec<PollSummary> = serde_json::from_value(cached)
            .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
        return Ok(Json(summaries));
    }

    let mut select = poll::Entity::find();

    if let Some(status) = status_filter {
        select = select.filter(poll::Column::Status.eq(status.as_str()));
    }

    if let Some(created_by) = query.created_by.as_ref() {
        select = select.filter(poll::Column::CreatedBy.eq(created_by.clone()));
    }

    let polls = select
        .order_by_desc(poll::Column::CreatedAt)
        .limit(limit)
        .offset(offset)
        .all(&state.database)
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    let mut summaries = Vec::with_capacity(polls.len());
    for record in polls {
        let allowed_domains = tally::allowed_domains(&record)
            .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

        // Restricted polls are invisible to voters outside their domains.
        if let Some(voter_email) = query.voter_email.as_ref() {
            if record.visibility != "public" && !voter::is_eligible(&allowed_domains, voter_email) {
                continue;
            }
        }

        summaries.push(PollSummary {
            poll_id: record.id,
            title: record.title,
            description: record.description,
            start_at: record.start_at.timestamp(),
            end_at: record.end_at.timestamp(),
            visibility: record.visibility,
            allowed_domains,
            poll_type: record.poll_type,
            status: record.status,
            total_votes: record.total_votes,
            created_by: record.created_by,
            created_at: record.created_at.timestamp(),
        });
    }

    assert!(
        summaries.len() <= limit as usize,
        "Returned more polls than requested",
    );

    let cache_value = serde_json::to_value(&summaries)
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    state.cache.polls.insert(cache_key, cache_value).await;

    Ok(Json(summaries))
}

async fn create_poll(
    State(state): State<AppState>,
    Json(request): Json<CreatePollRequest>,
) -> Result<(StatusCode, Json<PollView>), HttpError> {
    let created_by = require_actor_id("created_by", &request.created_by)?;

    let validated = validate_poll(
        &request.title,
        &request.description,
        request.start_at,
        request.end_at,
        request.poll_type,
        &request.visibility,
        &request.allowed_domains,
        &request.candidates,
    )
    .map_err(HttpError::bad_request)?;

    let now = fixed_now();
    let status = lifecycle::derive_status(
        to_fixed_offset(validated.start_at),
        to_fixed_offset(validated.end_at),
        now,
    );

    let domains_value = serde_json::to_value(validated.visibility.allowed_domains())
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    let txn = state
        .database
        .begin()
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    let model = poll::ActiveModel {
        title: Set(validated.title.clone()),
        description: Set(validated.description.clone()),
        start_at: Set(to_fixed_offset(validated.start_at)),
        end_at: Set(to_fixed_offset(validated.end_at)),
        visibility: Set(validated.visibility.as_str().to_string()),
        allowed_domains: Set(domains_value),
        poll_type: Set(validated.poll_type.as_str().to_string()),
        status: Set(status.as_str().to_string()),
        total_votes: Set(0),
        created_by: Set(created_by.clone()),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };

    let poll_id = poll::Entity::insert(model)
        .exec(&txn)
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .last_insert_id;

    let mut candidates = Vec::with_capacity(validated.candidates.len());
    for (position, candidate) in validated.candidates.iter().enumerate() {
        let position = i32::try_from(position)
            .map_err(|_| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, "candidate position overflow".to_string()))?;
        let candidate_id = poll_candidate::Entity::insert(poll_candidate::ActiveModel {
            poll_id: Set(poll_id),
            position: Set(position),
            name: Set(candidate.name.clone()),
            description: Set(candidate.description.clone()),
            vote_count: Set(0),
            ..Default::default()
        })
        .exec(&txn)
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .last_insert_id;

        candidates.push(CandidateView {
            candidate_id,
            position,
            name: candidate.name.clone(),
            description: candidate.description.clone(),
            vote_count: 0,
        });
    }

    txn.commit()
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    state.cache.polls.invalidate_all();

    let view = PollView {
        poll_id,
        title: validated.title,
        description: validated.description,
        start_at: validated.start_at.timestamp(),
        end_at: validated.end_at.timestamp(),
        visibility: validated.visibility.as_str().to_string(),
        allowed_domains: validated.visibility.allowed_domains().to_vec(),
        poll_type: validated.poll_type.as_str().to_string(),
        status: status.as_str().to_string(),
        total_votes: 0,
        created_by,
        created_at: now.timestamp(),
        updated_at: now.timestamp(),
        candidates,
        has_voted: None,
        user_vote: None,
    };

    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_poll(
    Path(poll_id): Path<i64>,
    Query(detail): Query<PollDetailQuery>,
    State(state): State<AppState>,
) -> Result<Json<PollView>, HttpError> {
    assert!(poll_id >= 0, "Poll id must be non-negative");

    let record = poll::Entity::find_by_id(poll_id)
        .one(&state.database)
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .ok_or_else(|| {
            HttpError::new(StatusCode::NOT_FOUND, format!("Poll {poll_id} not found"))
        })?;

    let candidates = fetch_candidates(&state, poll_id).await?;

    let user_vote_record = if let Some(voter_id) = detail.voter_id.as_ref() {
        vote::Entity::find()
            .filter(vote::Column::PollId.eq(poll_id))
            .filter(vote::Column::VoterId.eq(voter_id.clone()))
            .one(&state.database)
            .await
            .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
    } else {
        None
    };

    let (has_voted, user_vote) = match (detail.voter_id.as_ref(), user_vote_record) {
        (Some(_), Some(record)) => (
            Some(true),
            Some(VoteView {
                vote_id: record.id,
                poll_id: record.poll_id,
                candidate_id: record.candidate_id,
                cast_at: record.cast_at.timestamp(),
            }),
        ),
        (Some(_), None) => (Some(false), None),
        (None, _) => (None, None),
    };

    let view = poll_view(record, candidates, has_voted, user_vote)?;
    Ok(Json(view))
}

async fn update_poll(
    Path(poll_id): Path<i64>,
    State(state): State<AppState>,
    Json(request): Json<UpdatePollRequest>,
) -> Result<Json<PollView>, HttpError> {
    let record = poll::Entity::find_by_id(poll_id)
        .one(&state.database)
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .ok_or_else(|| {
            HttpError::new(StatusCode::NOT_FOUND, format!("Poll {poll_id} not found"))
        })?;

    let requested_by = require_actor_id("requested_by", &request.requested_by)?;
    if requested_by != record.created_by {
        return Err(HttpError::new(
            StatusCode::FORBIDDEN,
            "only the poll owner may edit it".to_string(),
        ));
    }

    // Edits are only allowed before the voting window opens, derived fresh
    // from the timestamps rather than the cached status column.
    let now = fixed_now();
    if lifecycle::derive_status(record.start_at, record.end_at, now) != PollStatus::NotStarted {
        return Err(HttpError::new(
            StatusCode::CONFLICT,
            "polls can only be edited before they start".to_string(),
        ));
    }

    let validated = validate_poll(
        &request.title,
        &request.description,
        request.start_at,
        request.end_at,
        request.poll_type,
        &request.visibility,
        &request.allowed_domains,
        &request.candidates,
    )
    .map_err(HttpError::bad_request)?;

    let existing = fetch_candidates(&state, poll_id).await?;

    for candidate in &validated.candidates {
        if let Some(id) = candidate.id {
            if !existing.iter().any(|known| known.candidate_id == id) {
                return Err(HttpError::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    format!("candidate {id} does not belong to poll {poll_id}"),
                ));
            }
        }
    }

    let retained: Vec<i64> = validated.candidates.iter().filter_map(|c| c.id).collect();
    for known in &existing {
        if !retained.contains(&known.candidate_id) && known.vote_count > 0 {
            return Err(HttpError::new(
                StatusCode::CONFLICT,
                format!(
                    "candidate {} has recorded votes and cannot be removed",
                    known.candidate_id
                ),
            ));
        }
    }

    let status = lifecycle::derive_status(
        to_fixed_offset(validated.start_at),
        to_fixed_offset(validated.end_at),
        now,
    );
    let domains_value = serde_json::to_value(validated.visibility.allowed_domains())
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    let txn = state
        .database
        .begin()
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    let mut model: poll::ActiveModel = record.clone().into();
    model.title = Set(validated.title.clone());
    model.description = Set(validated.description.clone());
    model.start_at = Set(to_fixed_offset(validated.start_at));
    model.end_at = Set(to_fixed_offset(validated.end_at));
    model.visibility = Set(validated.visibility.as_str().to_string());
    model.allowed_domains = Set(domains_value);
    model.poll_type = Set(validated.poll_type.as_str().to_string());
    model.status = Set(status.as_str().to_string());
    model.updated_at = Set(now);
    poll::Entity::update(model)
        .exec(&txn)
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    for known in &existing {
        if !retained.contains(&known.candidate_id) {
            poll_candidate::Entity::delete_by_id(known.candidate_id)
                .exec(&txn)
                .await
                .map_err(|err| {
                    HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                })?;
        }
    }

    let mut candidates = Vec::with_capacity(validated.candidates.len());
    for (position, candidate) in validated.candidates.iter().enumerate() {
        let position = i32::try_from(position)
            .map_err(|_| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, "candidate position overflow".to_string()))?;
        let prior_count = candidate
            .id
            .and_then(|id| {
                existing
                    .iter()
                    .find(|known| known.candidate_id == id)
                    .map(|known| known.vote_count)
            })
            .unwrap_or(0);
        let candidate_id = match candidate.id {
            Some(id) => {
                let model = poll_candidate::ActiveModel {
                    id: Set(id),
                    poll_id: Set(poll_id),
                    position: Set(position),
                    name: Set(candidate.name.clone()),
                    description: Set(candidate.description.clone()),
                    vote_count: Set(prior_count),
                };
                poll_candidate::Entity::update(model)
                    .exec(&txn)
                    .await
                    .map_err(|err| {
                        HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                    })?;
                id
            }
            None => poll_candidate::Entity::insert(poll_candidate::ActiveModel {
                poll_id: Set(poll_id),
                position: Set(position),
                name: Set(candidate.name.clone()),
                description: Set(candidate.description.clone()),
                vote_count: Set(0),
                ..Default::default()
            })
            .exec(&txn)
            .await
            .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
            .last_insert_id,
        };

        candidates.push(CandidateView {
            candidate_id,
            position,
            name: candidate.name.clone(),
            description: candidate.description.clone(),
            vote_count: prior_count,
        });
    }

    txn.commit()
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    state.cache.polls.invalidate_all();
    state.cache.results.invalidate(&poll_id).await;

    let view = PollView {
        poll_id,
        title: validated.title,
        description: validated.description,
        start_at: validated.start_at.timestamp(),
        end_at: validated.end_at.timestamp(),
        visibility: validated.visibility.as_str().to_string(),
        allowed_domains: validated.visibility.allowed_domains().to_vec(),
        poll_type: validated.poll_type.as_str().to_string(),
        status: status.as_str().to_string(),
        total_votes: record.total_votes,
        created_by: record.created_by,
        created_at: record.created_at.timestamp(),
        updated_at: now.timestamp(),
        candidates,
        has_voted: None,
        user_vote: None,
    };

    Ok(Json(view))
}

async fn delete_poll(
    Path(poll_id): Path<i64>,
    Query(query): Query<DeletePollQuery>,
    State(state): State<AppState>,
) -> Result<StatusCode, HttpError> {
    let record = poll::Entity::find_by_id(poll_id)
        .one(&state.database)
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .ok_or_else(|| {
            HttpError::new(StatusCode::NOT_FOUND, format!("Poll {poll_id} not found"))
        })?;

    let requested_by = require_actor_id("requested_by", &query.requested_by)?;
    if requested_by != record.created_by {
        return Err(HttpError::new(
            StatusCode::FORBIDDEN,
            "only the poll owner may delete it".to_string(),
        ));
    }

    if record.total_votes > 0 {
        return Err(HttpError::new(
            StatusCode::CONFLICT,
            "polls with recorded votes cannot be deleted".to_string(),
        ));
    }

    poll::Entity::delete_by_id(poll_id)
        .exec(&state.database)
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    state.cache.polls.invalidate_all();
    state.cache.results.invalidate(&poll_id).await;

    Ok(StatusCode::NO_CONTENT)
}

async fn get_poll_results(
    Path(poll_id): Path<i64>,
    State(state): State<AppState>,
) -> Result<Json<PollResultsView>, HttpError> {
    if let Some(cached) = state.cache.results.get(&poll_id).await {
        return Ok(Json((*cached).clone()));
    }

    let record = poll::Entity::find_by_id(poll_id)
        .one(&state.database)
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .ok_or_else(|| {
            HttpError::new(StatusCode::NOT_FOUND, format!("Poll {poll_id} not found"))
        })?;

    let candidates = fetch_candidates(&state, poll_id).await?;

    let view = tally_results(poll_id, record.title, record.status, candidates);

    state
        .cache
        .results
        .insert(poll_id, Arc::new(view.clone()))
        .await;

    Ok(Json(view))
}

async fn fetch_candidates(
    state: &AppState,
    poll_id: i64,
) -> Result<Vec<CandidateView>, HttpError> {
    let candidates = poll_candidate::Entity::find()
        .filter(poll_candidate::Column::PollId.eq(poll_id))
        .order_by_asc(poll_candidate::Column::Position)
        .all(&state.database)
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    Ok(candidates
        .into_iter()
        .map(|candidate| CandidateView {
            candidate_id: candidate.id,
            position: candidate.position,
            name: candidate.name,
            description: candidate.description,
            vote_count: candidate.vote_count,
        })
        .collect())
}

fn poll_view(
    record: poll::Model,
    candidates: Vec<CandidateView>,
    has_voted: Option<bool>,
    user_vote: Option<VoteView>,
) -> Result<PollView, HttpError> {
    let allowed_domains = tally::allowed_domains(&record)
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    Ok(PollView {
        poll_id: record.id,
        title: record.title,
        description: record.description,
        start_at: record.start_at.timestamp(),
        end_at: record.end_at.timestamp(),
        visibility: record.visibility,
        allowed_domains,
        poll_type: record.poll_type,
        status: record.status,
        total_votes: record.total_votes,
        created_by: record.created_by,
        created_at: record.created_at.timestamp(),
        updated_at: record.updated_at.timestamp(),
        candidates,
        has_voted,
        user_vote,
    })
}

/// Builds a results view from one candidate snapshot. The poll row and the
/// candidate rows are read in separate statements, so the row's total_votes
/// column can lag a ballot committing between them; the total is therefore
/// recomputed from the candidate counts rather than trusted, which keeps
/// every share within [0, 1] under any interleaving with cast_vote.
fn tally_results(
    poll_id: i64,
    title: String,
    status: String,
    candidates: Vec<CandidateView>,
) -> PollResultsView {
    let total_votes: i64 = candidates.iter().map(|candidate| candidate.vote_count).sum();

    let tallies = candidates
        .into_iter()
        .map(|candidate| CandidateTally {
            candidate_id: candidate.candidate_id,
            name: candidate.name,
            vote_count: candidate.vote_count,
            vote_share: vote_share(candidate.vote_count, total_votes),
        })
        .collect::<Vec<_>>();

    PollResultsView {
        poll_id,
        title,
        status,
        total_votes,
        candidates: tallies,
    }
}

fn vote_share(count: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    let share = (count as f64) / (total as f64);
    assert!(share >= 0.0, "Vote share must be non-negative");
    assert!(share <= 1.0, "Vote share cannot exceed 1.0");
    share
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_share() {
        assert_eq!(vote_share(0, 0), 0.0);
        assert_eq!(vote_share(0, 4), 0.0);
        assert_eq!(vote_share(1, 4), 0.25);
        assert_eq!(vote_share(4, 4), 1.0);
    }

    #[test]
    fn results_total_is_recomputed_from_candidate_counts() {
        // The candidate snapshot can be one ballot ahead of the poll row's
        // cached total when a vote commits between the two reads; the view
        // must stay consistent with the snapshot it actually saw.
        let candidates = vec![
            CandidateView {
                candidate_id: 1,
                position: 0,
                name: "Alice".to_string(),
                description: String::new(),
                vote_count: 2,
            },
            CandidateView {
                candidate_id: 2,
                position: 1,
                name: "Bob".to_string(),
                description: String::new(),
                vote_count: 1,
            },
        ];

        let view = tally_results(9, "Council".to_string(), "active".to_string(), candidates);
        assert_eq!(view.total_votes, 3);
        assert_eq!(view.candidates[0].vote_count, 2);
        for tally in &view.candidates {
            assert!(tally.vote_share >= 0.0);
            assert!(tally.vote_share <= 1.0);
        }
        assert_eq!(view.candidates[1].vote_share, 1.0 / 3.0);
    }

    #[test]
    fn empty_results_have_zero_shares() {
        let view = tally_results(9, "Council".to_string(), "active".to_string(), Vec::new());
        assert_eq!(view.total_votes, 0);
        assert!(view.candidates.is_empty());
    }
}
