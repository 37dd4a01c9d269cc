//! Per-VM advisory read/write locking (spec §5.1).
//!
//! Readers-writer, FIFO-fair: a waiting writer blocks new readers from
//! jumping the queue, so a steady stream of readers cannot starve a writer
//! indefinitely. Multi-VM operations (e.g. cloning between two machines)
//! must acquire locks in a globally consistent order to avoid deadlock;
//! [`LockRegistry::acquire_many`] sorts ids before taking leases, the same
//! discipline the teacher's `AppState` uses when it needs more than one
//! `RunState` at a time (`daemon.rs`).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

struct VmLockState {
    readers: u32,
    writer: bool,
    /// FIFO queue of waiters, each paired with the mode they're waiting for.
    waiters: VecDeque<(u64, LockMode)>,
    next_ticket: u64,
    notify: Arc<Notify>,
}

impl Default for VmLockState {
    fn default() -> Self {
        Self {
            readers: 0,
            writer: false,
            waiters: VecDeque::new(),
            next_ticket: 0,
            notify: Arc::new(Notify::new()),
        }
    }
}

pub struct LockRegistry {
    vms: Mutex<HashMap<String, Arc<Mutex<VmLockState>>>>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Held while a caller has an outstanding lease; drop releases it and wakes
/// the next fair waiter.
pub struct LockGuard {
    vm_id: String,
    mode: LockMode,
    state: Arc<Mutex<VmLockState>>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let state = self.state.clone();
        let mode = self.mode;
        tokio::spawn(async move {
            let mut s = state.lock().await;
            match mode {
                LockMode::Read => s.readers = s.readers.saturating_sub(1),
                LockMode::Write => s.writer = false,
            }
            s.notify.notify_waiters();
        });
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            vms: Mutex::new(HashMap::new()),
        }
    }

    async fn state_for(&self, vm_id: &str) -> Arc<Mutex<VmLockState>> {
        let mut vms = self.vms.lock().await;
        vms.entry(vm_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VmLockState::default())))
            .clone()
    }

    /// Acquire a single VM lease, fair to arrival order, bounded by `timeout`.
    pub async fn acquire(&self, vm_id: &str, mode: LockMode, timeout: Duration) -> Result<LockGuard> {
        let state = self.state_for(vm_id).await;
        let deadline = tokio::time::Instant::now() + timeout;

        let ticket = {
            let mut s = state.lock().await;
            let t = s.next_ticket;
            s.next_ticket += 1;
            s.waiters.push_back((t, mode));
            t
        };

        loop {
            let notify = {
                let mut s = state.lock().await;
                if s.waiters.front().map(|(t, _)| *t) != Some(ticket) {
                    s.notify.clone()
                } else if can_grant(&s, mode) {
                    s.waiters.pop_front();
                    match mode {
                        LockMode::Read => s.readers += 1,
                        LockMode::Write => s.writer = true,
                    }
                    return Ok(LockGuard {
                        vm_id: vm_id.to_string(),
                        mode,
                        state: state.clone(),
                    });
                } else {
                    s.notify.clone()
                }
            };

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                let mut s = state.lock().await;
                s.waiters.retain(|(t, _)| *t != ticket);
                return Err(Error::Timeout {
                    after_ms: timeout.as_millis() as u64,
                    operation: format!("acquire {mode:?} lock on '{vm_id}'"),
                });
            }
            let _ = tokio::time::timeout(remaining, notify.notified()).await;
        }
    }

    /// Acquire leases on several VMs at once, always in sorted-id order, so
    /// two callers locking the same pair never deadlock against each other.
    pub async fn acquire_many(
        &self,
        mut vm_ids: Vec<String>,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Vec<LockGuard>> {
        vm_ids.sort();
        vm_ids.dedup();
        let mut guards = Vec::with_capacity(vm_ids.len());
        for id in vm_ids {
            guards.push(self.acquire(&id, mode, timeout).await?);
        }
        Ok(guards)
    }
}

fn can_grant(s: &VmLockState, mode: LockMode) -> bool {
    match mode {
        LockMode::Read => !s.writer,
        LockMode::Write => !s.writer && s.readers == 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn two_readers_can_overlap() {
        let reg = LockRegistry::new();
        let g1 = reg.acquire("vm1", LockMode::Read, Duration::from_secs(1)).await.unwrap();
        let g2 = reg.acquire("vm1", LockMode::Read, Duration::from_secs(1)).await.unwrap();
        drop(g1);
        drop(g2);
    }

    #[tokio::test]
    async fn writer_excludes_readers() {
        let reg = Arc::new(LockRegistry::new());
        let writer = reg.acquire("vm1", LockMode::Write, Duration::from_secs(1)).await.unwrap();
        let reg2 = reg.clone();
        let reader = tokio::spawn(async move {
            reg2.acquire("vm1", LockMode::Read, Duration::from_millis(100)).await
        });
        let result = reader.await.unwrap();
        assert!(result.is_err());
        drop(writer);
    }

    #[tokio::test]
    async fn acquire_many_sorts_ids() {
        let reg = LockRegistry::new();
        let guards = reg
            .acquire_many(vec!["b".into(), "a".into()], LockMode::Write, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(guards.len(), 2);
    }

    #[tokio::test]
    async fn acquire_times_out_under_contention() {
        let reg = Arc::new(LockRegistry::new());
        let _writer = reg.acquire("vm1", LockMode::Write, Duration::from_secs(5)).await.unwrap();
        let err = reg.acquire("vm1", LockMode::Write, Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
    }
}
