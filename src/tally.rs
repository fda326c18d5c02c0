//! Ballot recording: the one-vote policy, eligibility gating, and the
//! counter pair `(candidate.vote_count, poll.total_votes)` that must stay
//! consistent under concurrent voters.
//!
//! Concurrency model: the vote row insert and both counter increments run in
//! one database transaction. The increments are server-side `SET x = x + 1`
//! expressions, so two voters racing on the same poll cannot lose an update,
//! and the unique index on `(poll_id, voter_id)` turns a duplicate-submission
//! race into a rejected insert instead of a double count.

use chrono::{DateTime, FixedOffset};
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, TransactionTrait};
use thiserror::Error;
use tracing::info;

use crate::entities::{poll, poll_candidate, vote};
use crate::lifecycle;
use crate::models::poll::PollType;
use crate::models::vote::{CastVoteRequest, VoteReceipt};
use crate::voter;

#[derive(Debug, Error)]
pub enum TallyError {
    #[error("poll {0} not found")]
    PollNotFound(i64),
    #[error("poll {0} is not open for voting")]
    PollNotActive(i64),
    #[error("ballots of type {0} cannot be counted yet")]
    UnsupportedBallot(String),
    #[error("candidate {candidate_id} does not belong to poll {poll_id}")]
    InvalidCandidate { poll_id: i64, candidate_id: i64 },
    #[error("voter has already cast a ballot in poll {0}")]
    AlreadyVoted(i64),
    #[error("voter is not eligible to vote in poll {0}")]
    NotEligible(i64),
    #[error("poll record is malformed: {0}")]
    MalformedRecord(String),
    #[error(transparent)]
    Store(#[from] DbErr),
}

/// Records one ballot. Preconditions are checked in a fixed order so the
/// caller always sees the first failing one: existence, voting window,
/// ballot type, candidate membership, one-vote policy, eligibility.
pub async fn cast_vote(
    database: &DatabaseConnection,
    request: &CastVoteRequest,
    now: DateTime<FixedOffset>,
) -> Result<VoteReceipt, TallyError> {
    let poll = poll::Entity::find_by_id(request.poll_id)
        .one(database)
        .await?
        .ok_or(TallyError::PollNotFound(request.poll_id))?;

    // Always derived fresh from the timestamps; the cached status column can
    // lag by one reconciler interval.
    if !lifecycle::is_votable(&poll, now) {
        return Err(TallyError::PollNotActive(poll.id));
    }

    ensure_countable(&poll)?;

    let candidate = poll_candidate::Entity::find_by_id(request.candidate_id)
        .one(database)
        .await?
        .filter(|candidate| candidate.poll_id == poll.id)
        .ok_or(TallyError::InvalidCandidate {
            poll_id: poll.id,
            candidate_id: request.candidate_id,
        })?;

    let prior_vote = vote::Entity::find()
        .filter(vote::Column::PollId.eq(poll.id))
        .filter(vote::Column::VoterId.eq(request.voter_id.clone()))
        .one(database)
        .await?;
    if prior_vote.is_some() {
        return Err(TallyError::AlreadyVoted(poll.id));
    }

    ensure_eligible(&poll, &request.voter_email)?;

    let txn = database.begin().await?;

    let ballot = vote::ActiveModel {
        poll_id: Set(poll.id),
        voter_id: Set(request.voter_id.clone()),
        candidate_id: Set(candidate.id),
        cast_at: Set(now),
        ..Default::default()
    };

    let inserted = vote::Entity::insert(ballot)
        .on_conflict(
            OnConflict::columns([vote::Column::PollId, vote::Column::VoterId])
                .do_nothing()
                .to_owned(),
        )
        .exec(&txn)
        .await;

    let vote_id = match inserted {
        Ok(result) => result.last_insert_id,
        // Losing the duplicate-insert race is the same business rule as the
        // lookup above, observed a moment later.
        Err(DbErr::RecordNotInserted) => return Err(TallyError::AlreadyVoted(poll.id)),
        Err(err) => return Err(TallyError::Store(err)),
    };

    let candidate_update = poll_candidate::Entity::update_many()
        .col_expr(
            poll_candidate::Column::VoteCount,
            Expr::col(poll_candidate::Column::VoteCount).add(1),
        )
        .filter(poll_candidate::Column::Id.eq(candidate.id))
        .filter(poll_candidate::Column::PollId.eq(poll.id))
        .exec(&txn)
        .await?;
    if candidate_update.rows_affected != 1 {
        return Err(TallyError::InvalidCandidate {
            poll_id: poll.id,
            candidate_id: candidate.id,
        });
    }

    let poll_update = poll::Entity::update_many()
        .col_expr(
            poll::Column::TotalVotes,
            Expr::col(poll::Column::TotalVotes).add(1),
        )
        .filter(poll::Column::Id.eq(poll.id))
        .exec(&txn)
        .await?;
    assert_eq!(poll_update.rows_affected, 1, "Poll row vanished mid-tally");

    txn.commit().await?;

    info!(
        "Recorded ballot {vote_id} for candidate {} in poll {}",
        candidate.id, poll.id
    );

    Ok(VoteReceipt {
        vote_id,
        poll_id: poll.id,
        candidate_id: candidate.id,
        cast_at: now.timestamp(),
    })
}

/// The allowed-domain set stored on the poll row. Public polls carry an
/// empty array.
pub fn allowed_domains(poll: &poll::Model) -> Result<Vec<String>, TallyError> {
    serde_json::from_value(poll.allowed_domains.clone())
        .map_err(|err| TallyError::MalformedRecord(format!("allowed_domains: {err}")))
}

fn ensure_countable(poll: &poll::Model) -> Result<(), TallyError> {
    let poll_type = PollType::parse(&poll.poll_type)
        .ok_or_else(|| TallyError::MalformedRecord(format!("poll_type {:?}", poll.poll_type)))?;
    match poll_type {
        PollType::Single => Ok(()),
        PollType::Multiple | PollType::Ranked => {
            Err(TallyError::UnsupportedBallot(poll_type.as_str().to_string()))
        }
    }
}

fn ensure_eligible(poll: &poll::Model, voter_email: &str) -> Result<(), TallyError> {
    if poll.visibility == "public" {
        return Ok(());
    }

    let domains = allowed_domains(poll)?;
    if voter::is_eligible(&domains, voter_email) {
        Ok(())
    } else {
        Err(TallyError::NotEligible(poll.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::lifecycle::to_fixed_offset;

    fn poll_fixture(visibility: &str, domains: serde_json::Value, poll_type: &str) -> poll::Model {
        let now = to_fixed_offset(Utc::now());
        poll::Model {
            id: 7,
            title: "Sports week captain".to_string(),
            description: String::new(),
            start_at: now,
            end_at: now + chrono::Duration::hours(1),
            visibility: visibility.to_string(),
            allowed_domains: domains,
            poll_type: poll_type.to_string(),
            status: "active".to_string(),
            total_votes: 0,
            created_by: "admin".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn public_polls_skip_the_domain_gate() {
        let poll = poll_fixture("public", serde_json::json!([]), "single");
        assert!(ensure_eligible(&poll, "anyone@anywhere.example").is_ok());
    }

    #[test]
    fn restricted_polls_enforce_the_domain_gate() {
        let poll = poll_fixture(
            "restricted",
            serde_json::json!(["college-a.edu"]),
            "single",
        );
        assert!(ensure_eligible(&poll, "Jane@COLLEGE-A.EDU").is_ok());
        assert!(matches!(
            ensure_eligible(&poll, "jane@college-b.edu"),
            Err(TallyError::NotEligible(7))
        ));
    }

    #[test]
    fn restricted_poll_with_empty_set_admits_all() {
        // A restricted poll whose domain list drained to empty behaves as
        // "all authenticated voters allowed".
        let poll = poll_fixture("restricted", serde_json::json!([]), "single");
        assert!(ensure_eligible(&poll, "anyone@anywhere.example").is_ok());
    }

    #[test]
    fn malformed_domain_column_is_reported() {
        let poll = poll_fixture("restricted", serde_json::json!("not-an-array"), "single");
        assert!(matches!(
            ensure_eligible(&poll, "jane@college-a.edu"),
            Err(TallyError::MalformedRecord(_))
        ));
    }

    #[test]
    fn only_single_choice_ballots_are_countable() {
        assert!(ensure_countable(&poll_fixture("public", serde_json::json!([]), "single")).is_ok());
        assert!(matches!(
            ensure_countable(&poll_fixture("public", serde_json::json!([]), "multiple")),
            Err(TallyError::UnsupportedBallot(kind)) if kind == "multiple"
        ));
        assert!(matches!(
            ensure_countable(&poll_fixture("public", serde_json::json!([]), "ranked")),
            Err(TallyError::UnsupportedBallot(kind)) if kind == "ranked"
        ));
        assert!(matches!(
            ensure_countable(&poll_fixture("public", serde_json::json!([]), "approval")),
            Err(TallyError::MalformedRecord(_))
        ));
    }
}
