use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use anyhow::Result;
use chrono::{DateTime, Datelike, FixedOffset, Utc};
use sea_orm::ColumnTrait;
use sea_orm::DatabaseConnection;
use sea_orm::EntityTrait;
use sea_orm::QueryFilter;
use sea_orm::sea_query::Expr;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ReconcilerConfig;
use crate::entities::poll;
use crate::state::ApiCache;

/// Where a poll sits in its voting window. Stored as a string column on the
/// poll row, but that column is only a cached projection: anything that gates
/// an actual ballot recomputes the status from the timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    NotStarted,
    Active,
    Ended,
}

impl PollStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PollStatus::NotStarted => "not_started",
            PollStatus::Active => "active",
            PollStatus::Ended => "ended",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "not_started" => Some(PollStatus::NotStarted),
            "active" => Some(PollStatus::Active),
            "ended" => Some(PollStatus::Ended),
            _ => None,
        }
    }
}

/// Pure three-way partition of `now` against the voting window. Total over
/// every timestamp combination; both boundaries are inclusive on the active
/// side, so a ballot at exactly `end_at` still counts.
pub fn derive_status(
    start_at: DateTime<FixedOffset>,
    end_at: DateTime<FixedOffset>,
    now: DateTime<FixedOffset>,
) -> PollStatus {
    if now < start_at {
        PollStatus::NotStarted
    } else if now <= end_at {
        PollStatus::Active
    } else {
        PollStatus::Ended
    }
}

/// Votability is always derived fresh from the timestamps rather than read
/// from the cached status column, which can lag by one reconciler interval.
pub fn is_votable(poll: &poll::Model, now: DateTime<FixedOffset>) -> bool {
    derive_status(poll.start_at, poll.end_at, now) == PollStatus::Active
}

/// Change detection for one reconciler pass: `Some(status)` when the stored
/// column disagrees with the derivation (including when it holds a value
/// `parse` does not recognise), `None` when the row is already correct.
pub fn needs_update(record: &poll::Model, now: DateTime<FixedOffset>) -> Option<PollStatus> {
    let derived = derive_status(record.start_at, record.end_at, now);
    if PollStatus::parse(&record.status) == Some(derived) {
        None
    } else {
        Some(derived)
    }
}

/// Periodic task that folds every poll's derived status back into the stored
/// column. It touches the status column only, never the vote counters, so it
/// cannot race the tally path on the fields that matter.
pub struct StatusReconciler {
    database: DatabaseConnection,
    config: ReconcilerConfig,
    last_pass_at: Arc<AtomicU64>,
    cache: Arc<ApiCache>,
}

impl StatusReconciler {
    pub fn new(
        database: DatabaseConnection,
        config: ReconcilerConfig,
        last_pass_at: Arc<AtomicU64>,
        cache: Arc<ApiCache>,
    ) -> Self {
        assert!(
            Arc::strong_count(&last_pass_at) >= 1,
            "Reconciler state must be shared"
        );
        Self {
            database,
            config,
            last_pass_at,
            cache,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Starting poll status reconciler loop");
        // Run once at startup so freshly booted processes do not serve a
        // stale status column for a full interval.
        self.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    match changed {
                        Ok(_) => {
                            if *shutdown.borrow() {
                                info!("Reconciler shutdown signal received");
                                break;
                            }
                        }
                        Err(_) => {
                            warn!("Shutdown channel closed unexpectedly. Exiting reconciler loop");
                            break;
                        }
                    }
                }
                _ = sleep(self.config.interval()) => {
                    self.tick().await;
                }
            }
        }

        Ok(())
    }

    /// One reconciliation pass. A fetch or write failure on one poll is
    /// logged and skipped; the next pass self-corrects, so nothing here
    /// retries and nothing aborts the batch.
    async fn tick(&self) {
        let polls = match poll::Entity::find().all(&self.database).await {
            Ok(polls) => polls,
            Err(err) => {
                warn!("Reconciler failed to list polls: {err}");
                return;
            }
        };

        let total = polls.len();
        let now = fixed_now();
        let mut updated = 0usize;
        let mut failed = 0usize;

        for record in polls {
            let Some(derived) = needs_update(&record, now) else {
                continue;
            };

            let result = poll::Entity::update_many()
                .col_expr(poll::Column::Status, Expr::value(derived.as_str()))
                .filter(poll::Column::Id.eq(record.id))
                .exec(&self.database)
                .await;

            match result {
                Ok(_) => {
                    debug!(
                        "Poll {} status {} -> {}",
                        record.id,
                        record.status,
                        derived.as_str()
                    );
                    updated += 1;
                    self.cache.results.invalidate(&record.id).await;
                }
                Err(err) => {
                    warn!("Failed to reconcile status of poll {}: {err}", record.id);
                    failed += 1;
                }
            }
        }

        assert!(
            updated + failed <= total,
            "Reconciler touched more polls than it fetched"
        );

        if updated > 0 {
            info!("Reconciled {updated} of {total} poll statuses");
            self.cache.polls.invalidate_all();
        } else {
            debug!("Reconciler pass over {total} polls produced no writes");
        }

        let epoch = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        self.last_pass_at.store(epoch, AtomicOrdering::SeqCst);
    }
}

pub fn to_fixed_offset(time: DateTime<Utc>) -> DateTime<FixedOffset> {
    let offset = FixedOffset::east_opt(0).unwrap();
    let converted = time.with_timezone(&offset);
    assert!(converted.year() >= 1970, "Timestamp predates Unix epoch");
    converted
}

pub fn fixed_now() -> DateTime<FixedOffset> {
    to_fixed_offset(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn window() -> (DateTime<FixedOffset>, DateTime<FixedOffset>) {
        let start = to_fixed_offset(Utc::now());
        (start, start + Duration::hours(2))
    }

    fn poll_fixture(
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
        status: &str,
    ) -> poll::Model {
        poll::Model {
            id: 1,
            title: "Student council".to_string(),
            description: String::new(),
            start_at: start,
            end_at: end,
            visibility: "public".to_string(),
            allowed_domains: serde_json::json!([]),
            poll_type: "single".to_string(),
            status: status.to_string(),
            total_votes: 0,
            created_by: "admin".to_string(),
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn status_partitions_are_contiguous() {
        let (start, end) = window();
        assert_eq!(
            derive_status(start, end, start - Duration::seconds(1)),
            PollStatus::NotStarted
        );
        assert_eq!(derive_status(start, end, start), PollStatus::Active);
        assert_eq!(
            derive_status(start, end, start + Duration::hours(1)),
            PollStatus::Active
        );
        assert_eq!(derive_status(start, end, end), PollStatus::Active);
        assert_eq!(
            derive_status(start, end, end + Duration::seconds(1)),
            PollStatus::Ended
        );
    }

    #[test]
    fn second_pass_without_time_passing_writes_nothing() {
        // A stale row gets repaired once; a pass over the repaired row at the
        // same instant detects no further change.
        let (start, end) = window();
        let now = start + Duration::minutes(30);
        let mut poll = poll_fixture(start, end, "not_started");

        let derived = needs_update(&poll, now);
        assert_eq!(derived, Some(PollStatus::Active));

        poll.status = derived.unwrap().as_str().to_string();
        assert_eq!(needs_update(&poll, now), None);
    }

    #[test]
    fn malformed_stored_status_is_repaired() {
        // A status value outside the known set never parses equal to the
        // derivation, so the row is always rewritten.
        let (start, end) = window();
        let poll = poll_fixture(start, end, "paused");

        assert_eq!(
            needs_update(&poll, start + Duration::minutes(1)),
            Some(PollStatus::Active)
        );
        assert_eq!(
            needs_update(&poll, end + Duration::minutes(1)),
            Some(PollStatus::Ended)
        );
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [PollStatus::NotStarted, PollStatus::Active, PollStatus::Ended] {
            assert_eq!(PollStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PollStatus::parse("draft"), None);
    }

    #[test]
    fn votability_tracks_the_window() {
        let (start, end) = window();
        let poll = poll_fixture(start, end, "not_started");

        // Stored status says not started, but the window is open: the fresh
        // derivation wins.
        assert!(is_votable(&poll, start + Duration::minutes(1)));
        assert!(!is_votable(&poll, start - Duration::minutes(1)));
        assert!(!is_votable(&poll, end + Duration::minutes(1)));
    }
}
