//! Shared server state threaded through every handler (spec §4).
//!
//! Mirrors the teacher's `AppState` (`daemon.rs`): one struct, cheap to
//! clone via `Arc`, handed to the dispatcher and to every background
//! sweeper task at startup.

use std::sync::Arc;
use std::time::Duration;

use crate::adapter::Adapter;
use crate::config::Config;
use crate::jobs::JobEngine;
use crate::locks::LockRegistry;
use crate::pool::ConnectionPool;
use crate::session::SessionManager;

pub struct AppContext {
    pub config: Config,
    pub adapter: Arc<dyn Adapter>,
    pub locks: Arc<LockRegistry>,
    pub pool: Arc<ConnectionPool>,
    pub sessions: Arc<SessionManager>,
    pub jobs: Arc<JobEngine>,
}

impl AppContext {
    pub fn new(config: Config, adapter: Arc<dyn Adapter>) -> Arc<Self> {
        let pool = ConnectionPool::new(
            config.connection_pool_max_size,
            Duration::from_secs(config.connection_idle_ttl_seconds),
            config.connection_max_usage,
        );
        let sessions = SessionManager::new(Duration::from_secs(config.session_ttl_seconds));
        let jobs = JobEngine::new(Duration::from_secs(config.job_result_ttl_seconds));
        Arc::new(Self {
            locks: Arc::new(LockRegistry::new()),
            pool,
            sessions,
            jobs,
            adapter,
            config,
        })
    }

    /// Start every background sweeper this context owns. Returns their join
    /// handles so the caller (`bin/virtualization_mcp`) can abort them on
    /// shutdown.
    pub fn spawn_sweepers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.pool
                .spawn_sweeper(Duration::from_secs(self.config.connection_pool_cleanup_interval_seconds)),
            self.sessions
                .spawn_sweeper(Duration::from_secs(self.config.session_cleanup_interval_seconds)),
            self.jobs
                .spawn_sweeper(Duration::from_secs(self.config.job_result_ttl_seconds.max(60))),
        ]
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.config.default_operation_timeout_seconds)
    }

    pub fn long_timeout(&self) -> Duration {
        Duration::from_secs(self.config.long_operation_timeout_seconds)
    }
}
