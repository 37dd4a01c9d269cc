//! Per-VM guest-command connection pool (spec §5.2).
//!
//! Grounded in the teacher's `backend/control_channel.rs`: connections are
//! reused up to an idle TTL or a max-usage count, then retired and
//! reconnected lazily. A background sweeper evicts idle connections the
//! same way `control_channel`'s reconnect loop retires stale channels.
//! Unlike the teacher, which dials a single guest channel, this pool keeps
//! one free-list per VM id since sessions address VMs independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::debug;

use crate::error::{Error, Result};

/// A pooled guest-command connection. Real connection establishment is
/// outside this module's scope (spec §4.C treats the channel as opaque);
/// what matters here is lifecycle accounting.
pub struct PooledConnection {
    pub vm_id: String,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub usage_count: u32,
}

impl PooledConnection {
    fn new(vm_id: String) -> Self {
        let now = Instant::now();
        Self {
            vm_id,
            created_at: now,
            last_used_at: now,
            usage_count: 0,
        }
    }

    fn is_expired(&self, idle_ttl: Duration, max_usage: u32) -> bool {
        self.last_used_at.elapsed() > idle_ttl || self.usage_count >= max_usage
    }
}

struct PoolInner {
    idle: HashMap<String, Vec<PooledConnection>>,
    in_use_count: usize,
}

pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    max_size: usize,
    idle_ttl: Duration,
    max_usage: u32,
    notify: Arc<tokio::sync::Notify>,
}

/// RAII lease: returns the connection to the pool on drop unless it has
/// expired, in which case it's dropped for real.
pub struct ConnectionLease {
    conn: Option<PooledConnection>,
    pool: Arc<ConnectionPool>,
}

impl ConnectionLease {
    pub fn vm_id(&self) -> &str {
        &self.conn.as_ref().unwrap().vm_id
    }

    pub fn mark_used(&mut self) {
        if let Some(c) = &mut self.conn {
            c.usage_count += 1;
            c.last_used_at = Instant::now();
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.release(conn).await;
            });
        }
    }
}

impl ConnectionPool {
    pub fn new(max_size: usize, idle_ttl: Duration, max_usage: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                idle: HashMap::new(),
                in_use_count: 0,
            }),
            max_size: max_size.max(1),
            idle_ttl,
            max_usage: max_usage.max(1),
            notify: Arc::new(tokio::sync::Notify::new()),
        })
    }

    /// Acquire a connection for `vm_id`, reusing an idle one if available
    /// and still fresh, else opening a new slot, else waiting for capacity,
    /// else failing with `PoolExhausted`.
    pub async fn acquire(self: &Arc<Self>, vm_id: &str, wait_timeout: Duration) -> Result<ConnectionLease> {
        let deadline = tokio::time::Instant::now() + wait_timeout;
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(list) = inner.idle.get_mut(vm_id) {
                    while let Some(conn) = list.pop() {
                        if !conn.is_expired(self.idle_ttl, self.max_usage) {
                            inner.in_use_count += 1;
                            return Ok(ConnectionLease {
                                conn: Some(conn),
                                pool: self.clone(),
                            });
                        }
                        debug!(vm_id, "dropping expired pooled connection");
                    }
                }
                let total_idle: usize = inner.idle.values().map(|v| v.len()).sum();
                if inner.in_use_count + total_idle < self.max_size {
                    inner.in_use_count += 1;
                    return Ok(ConnectionLease {
                        conn: Some(PooledConnection::new(vm_id.to_string())),
                        pool: self.clone(),
                    });
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::PoolExhausted(format!(
                    "connection pool exhausted for '{vm_id}'"
                )));
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    async fn release(&self, conn: PooledConnection) {
        let mut inner = self.inner.lock().await;
        inner.in_use_count = inner.in_use_count.saturating_sub(1);
        if !conn.is_expired(self.idle_ttl, self.max_usage) {
            inner.idle.entry(conn.vm_id.clone()).or_default().push(conn);
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Drop idle connections past their TTL or usage cap. Intended to run on
    /// a fixed interval from [`ConnectionPool::spawn_sweeper`].
    pub async fn sweep(&self) {
        let mut inner = self.inner.lock().await;
        let idle_ttl = self.idle_ttl;
        let max_usage = self.max_usage;
        let mut removed = 0usize;
        for list in inner.idle.values_mut() {
            let before = list.len();
            list.retain(|c| !c.is_expired(idle_ttl, max_usage));
            removed += before - list.len();
        }
        inner.idle.retain(|_, v| !v.is_empty());
        if removed > 0 {
            debug!(removed, "connection pool sweep evicted expired connections");
        }
    }

    /// Drop every idle pooled connection for `vm_id` (spec §4.C: "closes all
    /// pooled connections for a VM (used on VM stop/delete)"). A lease
    /// already checked out is returned to `release` as normal and simply
    /// won't be re-idled here; in-flight use can't be revoked mid-flight.
    pub async fn close(&self, vm_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(removed) = inner.idle.remove(vm_id) {
            if !removed.is_empty() {
                debug!(vm_id, count = removed.len(), "closed pooled connections for vm");
            }
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                pool.sweep().await;
            }
        })
    }
}
