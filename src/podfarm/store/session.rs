/*
 * Copyright (C) 2025 The Podfarm Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Lease abstraction over the coordination store. A session grants exclusive
//! per-key locks; losing the session drops every lock held under it and fires
//! a cancellation observed by all lock-dependent workers.

use std::collections::HashMap;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum SessionError {
    AlreadyHeld { key: String },
    Lost,
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AlreadyHeld { key } => {
                write!(f, "lock '{}' is already held", key)
            }
            SessionError::Lost => write!(f, "session has been lost"),
        }
    }
}

impl Error for SessionError {}

#[derive(Debug)]
struct LeaseState {
    // Held lock keys, tagged with the lease generation that acquired them. A
    // handle surviving from a lost lease must not release a newer holder's
    // lock, so releases check the tag.
    locks: HashMap<String, u64>,
    generation: u64,
    token: CancellationToken,
}

#[derive(Debug)]
struct SessionInner {
    name: String,
    ttl: Duration,
    lease: Mutex<LeaseState>,
}

/// A lease handle. Clones share the same lease and lock table, so replicas
/// competing through one session contend on the same keys.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Session {
            inner: Arc::new(SessionInner {
                name: name.into(),
                ttl,
                lease: Mutex::new(LeaseState {
                    locks: HashMap::new(),
                    generation: 1,
                    token: CancellationToken::new(),
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Acquires the exclusive lock on `key`. The returned handle releases the
    /// lock when dropped.
    pub fn lock(&self, key: impl Into<String>) -> Result<SessionLock, SessionError> {
        let key = key.into();
        let mut lease = self.lock_lease();
        if lease.token.is_cancelled() {
            return Err(SessionError::Lost);
        }
        if lease.locks.contains_key(&key) {
            return Err(SessionError::AlreadyHeld { key });
        }
        let generation = lease.generation;
        lease.locks.insert(key.clone(), generation);
        Ok(SessionLock {
            key,
            generation,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Resolves when the session lease is lost.
    pub async fn cancelled(&self) {
        let token = self.current_token();
        token.cancelled().await;
    }

    pub fn is_lost(&self) -> bool {
        self.current_token().is_cancelled()
    }

    /// Drops the lease: every held lock is released and the loss signal fires.
    pub fn destroy(&self) {
        let mut lease = self.lock_lease();
        lease.locks.clear();
        lease.token.cancel();
    }

    /// Establishes a fresh lease after a loss. Locks must be re-acquired.
    pub fn reacquire(&self) {
        let mut lease = self.lock_lease();
        if lease.token.is_cancelled() {
            lease.generation += 1;
            lease.token = CancellationToken::new();
        }
    }

    fn current_token(&self) -> CancellationToken {
        self.lock_lease().token.clone()
    }

    fn lock_lease(&self) -> std::sync::MutexGuard<'_, LeaseState> {
        self.inner.lease.lock().expect("session lease lock poisoned")
    }
}

/// An exclusive lock held under a session. Dropping the handle releases it.
#[derive(Debug)]
pub struct SessionLock {
    key: String,
    generation: u64,
    inner: Arc<SessionInner>,
}

impl SessionLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let mut lease = self.inner.lease.lock().expect("session lease lock poisoned");
        if lease.locks.get(&self.key) == Some(&self.generation) {
            lease.locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("farm-test", Duration::from_secs(30))
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        let session = session();
        let lock = session.lock("lock/daemon_sets/one").expect("first lock");

        let err = session
            .lock("lock/daemon_sets/one")
            .expect_err("second lock on same key");
        assert!(matches!(err, SessionError::AlreadyHeld { .. }));

        lock.release();
        session
            .lock("lock/daemon_sets/one")
            .expect("lock after release");
    }

    #[test]
    fn clones_contend_on_the_same_table() {
        let session = session();
        let twin = session.clone();
        let _lock = session.lock("shared").expect("lock");
        assert!(matches!(
            twin.lock("shared"),
            Err(SessionError::AlreadyHeld { .. })
        ));
    }

    #[test]
    fn destroy_drops_locks_and_refuses_new_ones() {
        let session = session();
        let _lock = session.lock("a").expect("lock");
        session.destroy();

        assert!(session.is_lost());
        assert!(matches!(session.lock("b"), Err(SessionError::Lost)));
    }

    #[test]
    fn reacquire_restores_the_lease() {
        let session = session();
        session.destroy();
        session.reacquire();

        assert!(!session.is_lost());
        session.lock("a").expect("lock after reacquire");
    }

    #[test]
    fn stale_handle_does_not_release_a_newer_holder() {
        let session = session();
        let stale = session.lock("contested").expect("lock");
        session.destroy();
        session.reacquire();

        let _fresh = session.lock("contested").expect("lock on fresh lease");
        drop(stale);

        // The stale drop must not have freed the fresh holder's lock.
        assert!(matches!(
            session.lock("contested"),
            Err(SessionError::AlreadyHeld { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_fires_on_destroy() {
        let session = session();
        let watcher = session.clone();
        let waiter = tokio::spawn(async move { watcher.cancelled().await });
        session.destroy();
        waiter.await.expect("cancellation observed");
    }
}
