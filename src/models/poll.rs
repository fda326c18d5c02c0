use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::voter::normalize_domain;

pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 10_000;
pub const MAX_CANDIDATE_NAME_LEN: usize = 256;
pub const MAX_CANDIDATE_DESCRIPTION_LEN: usize = 1024;
pub const MAX_CANDIDATES: usize = 64;
pub const MIN_CANDIDATES: usize = 2;
pub const MAX_ALLOWED_DOMAINS: usize = 64;

/// Who may cast a ballot. Restricted polls carry the normalized set of
/// college e-mail domains admitted to vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollVisibility {
    Public,
    RestrictedTo(Vec<String>),
}

impl PollVisibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollVisibility::Public => "public",
            PollVisibility::RestrictedTo(_) => "restricted",
        }
    }

    pub fn allowed_domains(&self) -> &[String] {
        match self {
            PollVisibility::Public => &[],
            PollVisibility::RestrictedTo(domains) => domains,
        }
    }
}

/// Ballot-counting rule. Only `Single` ballots are countable today;
/// `Multiple` and `Ranked` polls can be created and listed but refuse votes
/// until their counting rules are defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollType {
    Single,
    Multiple,
    Ranked,
}

impl PollType {
    pub fn as_str(self) -> &'static str {
        match self {
            PollType::Single => "single",
            PollType::Multiple => "multiple",
            PollType::Ranked => "ranked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "single" => Some(PollType::Single),
            "multiple" => Some(PollType::Multiple),
            "ranked" => Some(PollType::Ranked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSpec {
    /// Stable candidate id; present when editing an existing candidate,
    /// absent for a newly added one. Never a positional index.
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePollRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub poll_type: PollType,
    pub visibility: String,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    pub candidates: Vec<CandidateSpec>,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePollRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub poll_type: PollType,
    pub visibility: String,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    pub candidates: Vec<CandidateSpec>,
    pub requested_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSummary {
    pub poll_id: i64,
    pub title: String,
    pub description: String,
    pub start_at: i64,
    pub end_at: i64,
    pub visibility: String,
    pub allowed_domains: Vec<String>,
    pub poll_type: String,
    pub status: String,
    pub total_votes: i64,
    pub created_by: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateView {
    pub candidate_id: i64,
    pub position: i32,
    pub name: String,
    pub description: String,
    pub vote_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollView {
    pub poll_id: i64,
    pub title: String,
    pub description: String,
    pub start_at: i64,
    pub end_at: i64,
    pub visibility: String,
    pub allowed_domains: Vec<String>,
    pub poll_type: String,
    pub status: String,
    pub total_votes: i64,
    pub created_by: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub candidates: Vec<CandidateView>,
    pub has_voted: Option<bool>,
    pub user_vote: Option<super::vote::VoteView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTally {
    pub candidate_id: i64,
    pub name: String,
    pub vote_count: i64,
    /// Fraction of the poll's total, in [0, 1]. Zero when nobody voted.
    pub vote_share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResultsView {
    pub poll_id: i64,
    pub title: String,
    pub status: String,
    pub total_votes: i64,
    pub candidates: Vec<CandidateTally>,
}

/// Validated shape shared by poll creation and edit: window ordering,
/// candidate count, field bounds, and the canonical visibility
/// representation (a set of normalized domain strings).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPoll {
    pub title: String,
    pub description: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub poll_type: PollType,
    pub visibility: PollVisibility,
    pub candidates: Vec<CandidateSpec>,
}

pub fn validate_poll(
    title: &str,
    description: &str,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    poll_type: PollType,
    visibility: &str,
    allowed_domains: &[String],
    candidates: &[CandidateSpec],
) -> Result<ValidatedPoll, String> {
    let title = title.trim();
    if title.is_empty() {
        return Err("title must not be empty".to_string());
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(format!("title exceeds {MAX_TITLE_LEN} characters"));
    }

    let description = description.trim();
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(format!("description exceeds {MAX_DESCRIPTION_LEN} characters"));
    }

    // Downstream time arithmetic assumes post-epoch timestamps.
    if start_at < DateTime::<Utc>::UNIX_EPOCH {
        return Err("start_at predates the Unix epoch".to_string());
    }
    if end_at <= start_at {
        return Err("end_at must be after start_at".to_string());
    }

    if candidates.len() < MIN_CANDIDATES {
        return Err(format!("a poll needs at least {MIN_CANDIDATES} candidates"));
    }
    if candidates.len() > MAX_CANDIDATES {
        return Err(format!("a poll cannot carry more than {MAX_CANDIDATES} candidates"));
    }

    let mut validated_candidates = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let name = candidate.name.trim();
        if name.is_empty() {
            return Err("candidate name must not be empty".to_string());
        }
        if name.len() > MAX_CANDIDATE_NAME_LEN {
            return Err(format!(
                "candidate name exceeds {MAX_CANDIDATE_NAME_LEN} characters"
            ));
        }
        let candidate_description = candidate.description.trim();
        if candidate_description.len() > MAX_CANDIDATE_DESCRIPTION_LEN {
            return Err(format!(
                "candidate description exceeds {MAX_CANDIDATE_DESCRIPTION_LEN} characters"
            ));
        }
        if validated_candidates
            .iter()
            .any(|existing: &CandidateSpec| existing.name.eq_ignore_ascii_case(name))
        {
            return Err(format!("duplicate candidate name {name}"));
        }
        validated_candidates.push(CandidateSpec {
            id: candidate.id,
            name: name.to_string(),
            description: candidate_description.to_string(),
        });
    }

    let visibility = match visibility {
        "public" => PollVisibility::Public,
        "restricted" => {
            if allowed_domains.len() > MAX_ALLOWED_DOMAINS {
                return Err(format!(
                    "allowed_domains cannot list more than {MAX_ALLOWED_DOMAINS} entries"
                ));
            }
            let mut normalized: Vec<String> = Vec::with_capacity(allowed_domains.len());
            for raw in allowed_domains {
                match normalize_domain(raw) {
                    Some(domain) => {
                        if !normalized.contains(&domain) {
                            normalized.push(domain);
                        }
                    }
                    None => return Err(format!("invalid domain entry {raw:?}")),
                }
            }
            if normalized.is_empty() {
                return Err("restricted polls must allow at least one domain".to_string());
            }
            PollVisibility::RestrictedTo(normalized)
        }
        other => return Err(format!("unknown visibility {other:?}")),
    };

    Ok(ValidatedPoll {
        title: title.to_string(),
        description: description.to_string(),
        start_at,
        end_at,
        poll_type,
        visibility,
        candidates: validated_candidates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candidates(names: &[&str]) -> Vec<CandidateSpec> {
        names
            .iter()
            .map(|name| CandidateSpec {
                id: None,
                name: name.to_string(),
                description: String::new(),
            })
            .collect()
    }

    fn validate(
        start_offset: Duration,
        end_offset: Duration,
        visibility: &str,
        domains: &[&str],
        names: &[&str],
    ) -> Result<ValidatedPoll, String> {
        let now = Utc::now();
        validate_poll(
            "Student council 2026",
            "Annual election",
            now + start_offset,
            now + end_offset,
            PollType::Single,
            visibility,
            &domains.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
            &candidates(names),
        )
    }

    #[test]
    fn accepts_a_well_formed_poll() {
        let validated = validate(
            Duration::hours(1),
            Duration::hours(2),
            "public",
            &[],
            &["Alice", "Bob"],
        )
        .expect("valid poll");
        assert_eq!(validated.visibility, PollVisibility::Public);
        assert_eq!(validated.candidates.len(), 2);
    }

    #[test]
    fn rejects_inverted_window() {
        let err = validate(
            Duration::hours(2),
            Duration::hours(1),
            "public",
            &[],
            &["Alice", "Bob"],
        )
        .unwrap_err();
        assert!(err.contains("end_at"));

        // A zero-length window is equally invalid.
        assert!(
            validate(
                Duration::hours(1),
                Duration::hours(1),
                "public",
                &[],
                &["Alice", "Bob"]
            )
            .is_err()
        );
    }

    #[test]
    fn rejects_pre_epoch_window() {
        let start = DateTime::<Utc>::UNIX_EPOCH - Duration::days(1);
        let err = validate_poll(
            "Student council 2026",
            "Annual election",
            start,
            start + Duration::hours(2),
            PollType::Single,
            "public",
            &[],
            &candidates(&["Alice", "Bob"]),
        )
        .unwrap_err();
        assert!(err.contains("epoch"));
    }

    #[test]
    fn rejects_too_few_candidates() {
        assert!(
            validate(
                Duration::hours(1),
                Duration::hours(2),
                "public",
                &[],
                &["Alice"]
            )
            .is_err()
        );
    }

    #[test]
    fn rejects_duplicate_candidate_names() {
        assert!(
            validate(
                Duration::hours(1),
                Duration::hours(2),
                "public",
                &[],
                &["Alice", "alice"]
            )
            .is_err()
        );
    }

    #[test]
    fn restricted_polls_need_domains_and_normalize_them() {
        assert!(
            validate(
                Duration::hours(1),
                Duration::hours(2),
                "restricted",
                &[],
                &["Alice", "Bob"]
            )
            .is_err()
        );

        let validated = validate(
            Duration::hours(1),
            Duration::hours(2),
            "restricted",
            &["@Herald.EDU.np", "herald.edu.np", "icp.edu.np"],
            &["Alice", "Bob"],
        )
        .expect("valid restricted poll");
        assert_eq!(
            validated.visibility,
            PollVisibility::RestrictedTo(vec![
                "herald.edu.np".to_string(),
                "icp.edu.np".to_string()
            ])
        );
    }

    #[test]
    fn rejects_unknown_visibility() {
        let err = validate(
            Duration::hours(1),
            Duration::hours(2),
            "invite-only",
            &[],
            &["Alice", "Bob"],
        )
        .unwrap_err();
        assert!(err.contains("visibility"));
    }
}
