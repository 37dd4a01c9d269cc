//! TTL-bounded per-client session state (spec §5.3).
//!
//! Grounded in the teacher's `RunState` bookkeeping (`daemon.rs::AppState`):
//! sessions live in a `Mutex<HashMap<_, _>>`, a background sweeper evicts
//! anything past its TTL, and every read that should count as activity
//! goes through `touch` rather than mutating the map directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: String,
    pub last_active_at: String,
    #[serde(default)]
    pub client_label: Option<String>,
}

struct SessionEntry {
    info: SessionInfo,
    created_at: Instant,
    last_active_at: Instant,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        })
    }

    pub async fn create(&self, client_label: Option<String>) -> SessionInfo {
        let id = Uuid::now_v7().to_string();
        let now = Instant::now();
        let rfc3339 = now_rfc3339();
        let info = SessionInfo {
            session_id: id.clone(),
            created_at: rfc3339.clone(),
            last_active_at: rfc3339,
            client_label,
        };
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            id,
            SessionEntry {
                info: info.clone(),
                created_at: now,
                last_active_at: now,
            },
        );
        info
    }

    /// Fetch a session and mark it active, extending its TTL window. Errors
    /// with `NotFound` if the session never existed or was already reaped.
    pub async fn touch(&self, session_id: &str) -> Result<SessionInfo> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound(format!("no such session '{session_id}'")))?;
        entry.last_active_at = Instant::now();
        entry.info.last_active_at = now_rfc3339();
        Ok(entry.info.clone())
    }

    /// Touch `session_id` if it exists, else create it fresh with this
    /// manager's configured TTL (spec §4.D: "creates with the configured TTL
    /// if absent, otherwise touches `last_touched_at`"). Unlike `create`,
    /// the session id is caller-supplied rather than minted here.
    pub async fn get_or_create(&self, session_id: &str) -> SessionInfo {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.last_active_at = Instant::now();
            entry.info.last_active_at = now_rfc3339();
            return entry.info.clone();
        }
        let now = Instant::now();
        let rfc3339 = now_rfc3339();
        let info = SessionInfo {
            session_id: session_id.to_string(),
            created_at: rfc3339.clone(),
            last_active_at: rfc3339,
            client_label: None,
        };
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                info: info.clone(),
                created_at: now,
                last_active_at: now,
            },
        );
        info
    }

    /// Fetch a session without touching it (spec §4.D: "does not touch").
    pub async fn get(&self, session_id: &str) -> Result<SessionInfo> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .map(|e| e.info.clone())
            .ok_or_else(|| Error::NotFound(format!("no such session '{session_id}'")))
    }

    pub async fn end(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("no such session '{session_id}'")))
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        self.sessions.lock().await.values().map(|e| e.info.clone()).collect()
    }

    async fn sweep(&self) {
        let mut sessions = self.sessions.lock().await;
        let ttl = self.ttl;
        let before = sessions.len();
        sessions.retain(|_, e| e.created_at.elapsed() <= ttl || e.last_active_at.elapsed() <= ttl);
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "session sweep reaped expired sessions");
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let mgr = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                mgr.sweep().await;
            }
        })
    }
}

fn now_rfc3339() -> String {
    humantime::format_rfc3339_seconds(std::time::SystemTime::now()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_get_end_round_trip() {
        let mgr = SessionManager::new(Duration::from_secs(60));
        let info = mgr.create(Some("test-client".into())).await;
        let fetched = mgr.get(&info.session_id).await.unwrap();
        assert_eq!(fetched.session_id, info.session_id);
        mgr.end(&info.session_id).await.unwrap();
        assert!(mgr.get(&info.session_id).await.is_err());
    }

    #[tokio::test]
    async fn sweep_reaps_expired_sessions() {
        let mgr = SessionManager::new(Duration::from_millis(10));
        let info = mgr.create(None).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        mgr.sweep().await;
        assert!(mgr.get(&info.session_id).await.is_err());
    }

    #[tokio::test]
    async fn get_or_create_creates_once_then_touches() {
        let mgr = SessionManager::new(Duration::from_millis(50));
        let first = mgr.get_or_create("client-chosen-id").await;
        assert_eq!(first.session_id, "client-chosen-id");
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = mgr.get_or_create("client-chosen-id").await;
        assert_eq!(second.session_id, first.session_id);
        tokio::time::sleep(Duration::from_millis(30)).await;
        mgr.sweep().await;
        assert!(mgr.get("client-chosen-id").await.is_ok(), "touched session must survive the sweep");
    }

    #[tokio::test]
    async fn get_does_not_extend_activity_window() {
        let mgr = SessionManager::new(Duration::from_millis(40));
        let info = mgr.create(None).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        mgr.get(&info.session_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        mgr.sweep().await;
        assert!(mgr.get(&info.session_id).await.is_err(), "get() must not have kept the session alive");
    }

    #[tokio::test]
    async fn touch_extends_activity_window() {
        let mgr = SessionManager::new(Duration::from_millis(50));
        let info = mgr.create(None).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        mgr.touch(&info.session_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        mgr.sweep().await;
        assert!(mgr.get(&info.session_id).await.is_ok());
    }
}
