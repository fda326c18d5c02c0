use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use moka::future::Cache;
use sea_orm::DatabaseConnection;
use serde_json::Value;

use crate::config::CacheConfig;
use crate::models::poll::PollResultsView;

#[derive(Clone)]
pub struct AppState {
    pub database: DatabaseConnection,
    pub cache: Arc<ApiCache>,
    pub start_time: Instant,
    /// Epoch seconds of the reconciler's last completed pass; surfaced by
    /// the readiness probe.
    pub last_reconciled_at: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        database: DatabaseConnection,
        cache: Arc<ApiCache>,
        last_reconciled_at: Arc<AtomicU64>,
    ) -> Self {
        assert!(
            cache.results_capacity >= 10,
            "Results cache capacity must be configured"
        );
        assert!(
            Arc::strong_count(&last_reconciled_at) >= 1,
            "Reconciler state must be shared"
        );
        Self {
            database,
            cache,
            start_time: Instant::now(),
            last_reconciled_at,
        }
    }
}

pub struct ApiCache {
    /// Tallied results per poll id, invalidated on every recorded ballot.
    pub results: Cache<i64, Arc<PollResultsView>>,
    /// Listing responses keyed by their query string.
    pub polls: Cache<String, Value>,
    pub results_capacity: u64,
}

impl ApiCache {
    pub fn new(config: &CacheConfig) -> Self {
        assert!(
            config.results_max_capacity >= 10,
            "Results cache capacity threshold"
        );
        assert!(
            config.polls_max_capacity >= 10,
            "Poll list cache capacity threshold"
        );

        let results = Cache::builder()
            .max_capacity(config.results_max_capacity)
            .time_to_live(Duration::from_secs(config.results_ttl_seconds))
            .time_to_idle(Duration::from_secs(config.results_ttl_seconds / 2 + 1))
            .build();

        let polls = Cache::builder()
            .max_capacity(config.polls_max_capacity)
            .time_to_live(Duration::from_secs(config.polls_ttl_seconds))
            .time_to_idle(Duration::from_secs(config.polls_ttl_seconds / 2 + 1))
            .build();

        Self {
            results,
            polls,
            results_capacity: config.results_max_capacity,
        }
    }
}
