use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{DfsError, DfsResult};

/// Short-lived path reservations taken while a client uploads blocks for a new file.
#[derive(Default)]
pub struct PathLocks {
    locks: HashMap<String, Instant>,
}

fn expiry(now: Instant, path: &str, ttl: Duration) -> DfsResult<Instant> {
    now.checked_add(ttl).ok_or_else(|| {
        DfsError::InvalidParam(format!("lock ttl {}s on {} out of range", ttl.as_secs(), path))
    })
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Succeeds only if no unexpired lock is held on `path`.
    pub fn set_lock(&mut self, path: &str, ttl: Duration) -> DfsResult<()> {
        let now = Instant::now();
        let expire = expiry(now, path, ttl)?;
        if let Some(expire_at) = self.locks.get(path) {
            if *expire_at > now {
                return Err(DfsError::LockAcquisitionFailed(path.to_string()));
            }
        }
        self.locks.insert(path.to_string(), expire);
        Ok(())
    }

    /// Extend a lock still held on `path`.
    pub fn update_lock(&mut self, path: &str, ttl: Duration) -> DfsResult<()> {
        let now = Instant::now();
        match self.locks.get_mut(path) {
            Some(expire_at) if *expire_at > now => {
                *expire_at = expiry(now, path, ttl)?;
                Ok(())
            }
            _ => Err(DfsError::LockAcquisitionFailed(format!(
                "no lock held on {}",
                path
            ))),
        }
    }

    pub fn unset_lock(&mut self, path: &str) -> bool {
        self.locks.remove(path).is_some()
    }

    pub fn is_locked(&self, path: &str) -> bool {
        self.locks
            .get(path)
            .map(|expire_at| *expire_at > Instant::now())
            .unwrap_or(false)
    }

    /// Drop every lock whose expiry has passed; returns how many were removed.
    pub fn sweep(&mut self) -> usize {
        let now = Instant::now();
        let before = self.locks.len();
        self.locks.retain(|_, expire_at| *expire_at > now);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Periodically reap expired locks, independent of request handling.
pub fn spawn_lock_sweeper(locks: Arc<Mutex<PathLocks>>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let reclaimed = match locks.lock() {
                Ok(mut guard) => guard.sweep(),
                Err(e) => {
                    warn!("path lock sweep: lock poisoned: {}", e);
                    continue;
                }
            };
            if reclaimed > 0 {
                info!("path lock sweep: reclaimed {} expired locks", reclaimed);
            }
        }
    })
}
