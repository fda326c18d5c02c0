use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastVoteRequest {
    pub poll_id: i64,
    /// Stable candidate id from the poll view, never an array position.
    pub candidate_id: i64,
    pub voter_id: String,
    pub voter_email: String,
}

/// Proof that a ballot was durably recorded. A retried submission after a
/// timeout never yields a second receipt for the same voter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReceipt {
    pub vote_id: i64,
    pub poll_id: i64,
    pub candidate_id: i64,
    pub cast_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteView {
    pub vote_id: i64,
    pub poll_id: i64,
    pub candidate_id: i64,
    pub cast_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteHistoryEntry {
    pub vote_id: i64,
    pub poll_id: i64,
    pub poll_title: String,
    pub poll_status: String,
    pub candidate_id: i64,
    pub candidate_name: String,
    pub cast_at: i64,
}
