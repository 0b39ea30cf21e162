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

//! The coordination store: a versioned key-value tree with prefix watches,
//! shaped after the Consul KV API (compare-and-swap against a modify index,
//! blocking watches delivered as key diffs). This in-process implementation
//! backs every higher-level store; watchers that lag behind the broadcast
//! channel recover from a bounded history ring.

use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;

const WATCH_HISTORY_LIMIT: usize = 512;
const WATCH_CHANNEL_CAPACITY: usize = 128;

/// A single key diff: `value` is `None` when the key was deleted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KvEvent {
    pub key: String,
    pub value: Option<String>,
    pub version: u64,
}

impl KvEvent {
    fn matches_prefix(&self, prefix: &str) -> bool {
        prefix.is_empty() || self.key.starts_with(prefix)
    }
}

#[derive(Debug)]
pub enum KvError {
    /// Compare-and-swap lost against a concurrent writer.
    Conflict { key: String },
    /// Transport-level failure talking to the store.
    Unavailable(String),
}

impl Display for KvError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KvError::Conflict { key } => write!(f, "compare-and-swap conflict on key '{}'", key),
            KvError::Unavailable(message) => write!(f, "store unavailable: {}", message),
        }
    }
}

impl Error for KvError {}

struct KvState {
    entries: HashMap<String, (String, u64)>,
    version: u64,
}

struct WatchHub {
    sender: broadcast::Sender<KvEvent>,
    history: RwLock<VecDeque<KvEvent>>,
}

impl WatchHub {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            sender,
            history: RwLock::new(VecDeque::new()),
        }
    }

    fn record(&self, event: KvEvent) {
        {
            let mut history = self.history.write().expect("kv watch history lock poisoned");
            history.push_back(event.clone());
            if history.len() > WATCH_HISTORY_LIMIT {
                history.pop_front();
            }
        }
        let _ = self.sender.send(event);
    }

    fn snapshot_since(&self, since: u64) -> VecDeque<KvEvent> {
        let history = self.history.read().expect("kv watch history lock poisoned");
        history
            .iter()
            .filter(|event| event.version > since)
            .cloned()
            .collect()
    }
}

struct KvInner {
    state: Mutex<KvState>,
    watch: WatchHub,
}

#[derive(Clone)]
pub struct KvStore {
    inner: Arc<KvInner>,
}

impl KvStore {
    pub fn new() -> Self {
        KvStore {
            inner: Arc::new(KvInner {
                state: Mutex::new(KvState {
                    entries: HashMap::new(),
                    version: 0,
                }),
                watch: WatchHub::new(),
            }),
        }
    }

    /// Returns the value and modify version of `key`, if present.
    pub fn get(&self, key: &str) -> Result<Option<(String, u64)>, KvError> {
        let state = self.lock_state();
        Ok(state.entries.get(key).cloned())
    }

    /// Unconditional write; returns the new modify version.
    pub fn put(&self, key: &str, value: &str) -> Result<u64, KvError> {
        let mut state = self.lock_state();
        let version = Self::commit(&mut state, key, value);
        self.inner.watch.record(KvEvent {
            key: key.to_string(),
            value: Some(value.to_string()),
            version,
        });
        Ok(version)
    }

    /// Compare-and-swap: writes only if the key's current modify version is
    /// `expected`; `expected == 0` requires the key to be absent.
    pub fn cas(&self, key: &str, expected: u64, value: &str) -> Result<u64, KvError> {
        let mut state = self.lock_state();
        let current = state.entries.get(key).map(|(_, version)| *version);
        let matches = match current {
            Some(version) => version == expected,
            None => expected == 0,
        };
        if !matches {
            return Err(KvError::Conflict {
                key: key.to_string(),
            });
        }
        let version = Self::commit(&mut state, key, value);
        self.inner.watch.record(KvEvent {
            key: key.to_string(),
            value: Some(value.to_string()),
            version,
        });
        Ok(version)
    }

    /// Removes `key`. Absent keys are not an error.
    pub fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut state = self.lock_state();
        if state.entries.remove(key).is_none() {
            return Ok(());
        }
        state.version += 1;
        let version = state.version;
        self.inner.watch.record(KvEvent {
            key: key.to_string(),
            value: None,
            version,
        });
        Ok(())
    }

    /// Lists every `(key, value, version)` under `prefix`, unordered.
    pub fn list(&self, prefix: &str) -> Result<Vec<(String, String, u64)>, KvError> {
        let state = self.lock_state();
        Ok(state
            .entries
            .iter()
            .filter(|(key, _)| prefix.is_empty() || key.starts_with(prefix))
            .map(|(key, (value, version))| (key.clone(), value.clone(), *version))
            .collect())
    }

    /// The store-wide modify version of the most recent write.
    pub fn version(&self) -> u64 {
        self.lock_state().version
    }

    /// Watches key diffs under `prefix`. With `since`, replays history after
    /// that version first; older diffs are dropped.
    pub fn watch(&self, prefix: &str, since: Option<u64>) -> KvWatchStream {
        let receiver = self.inner.watch.sender.subscribe();
        let mut stream = KvWatchStream {
            prefix: prefix.to_string(),
            receiver,
            inner: Arc::clone(&self.inner),
            backlog: VecDeque::new(),
            last_version: since.unwrap_or(0),
        };
        stream.refill_backlog();
        stream
    }

    fn commit(state: &mut KvState, key: &str, value: &str) -> u64 {
        state.version += 1;
        let version = state.version;
        state
            .entries
            .insert(key.to_string(), (value.to_string(), version));
        version
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, KvState> {
        self.inner.state.lock().expect("kv state lock poisoned")
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct KvWatchStream {
    prefix: String,
    receiver: broadcast::Receiver<KvEvent>,
    inner: Arc<KvInner>,
    backlog: VecDeque<KvEvent>,
    last_version: u64,
}

impl KvWatchStream {
    fn refill_backlog(&mut self) {
        let events = self.inner.watch.snapshot_since(self.last_version);
        for event in events {
            if event.matches_prefix(&self.prefix) {
                self.backlog.push_back(event);
            }
        }
    }

    /// Waits for the next diff under the watched prefix.
    pub async fn next(&mut self) -> Option<KvEvent> {
        loop {
            if let Some(event) = self.pop_backlog() {
                return Some(event);
            }

            match self.receiver.recv().await {
                Ok(event) => {
                    if let Some(event) = self.admit(event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => self.refill_backlog(),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns a pending diff without waiting, if one is immediately ready.
    pub fn try_next(&mut self) -> Option<KvEvent> {
        loop {
            if let Some(event) = self.pop_backlog() {
                return Some(event);
            }

            match self.receiver.try_recv() {
                Ok(event) => {
                    if let Some(event) = self.admit(event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => self.refill_backlog(),
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
            }
        }
    }

    fn pop_backlog(&mut self) -> Option<KvEvent> {
        let event = self.backlog.pop_front()?;
        self.last_version = event.version;
        Some(event)
    }

    fn admit(&mut self, event: KvEvent) -> Option<KvEvent> {
        if event.version <= self.last_version {
            return None;
        }
        self.last_version = event.version;
        if event.matches_prefix(&self.prefix) {
            Some(event)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[test]
    fn get_put_delete_round_trip() {
        let kv = KvStore::new();
        assert_eq!(kv.get("a/b").expect("get"), None);

        let version = kv.put("a/b", "one").expect("put");
        let (value, stored_version) = kv.get("a/b").expect("get").expect("present");
        assert_eq!(value, "one");
        assert_eq!(stored_version, version);

        kv.delete("a/b").expect("delete");
        assert_eq!(kv.get("a/b").expect("get"), None);
        // Deleting again is not an error.
        kv.delete("a/b").expect("delete absent");
    }

    #[test]
    fn cas_enforces_expected_version() {
        let kv = KvStore::new();
        let version = kv.cas("key", 0, "first").expect("create");

        let err = kv.cas("key", 0, "second").expect_err("create over existing");
        assert!(matches!(err, KvError::Conflict { .. }));

        let next = kv.cas("key", version, "second").expect("swap");
        assert!(next > version);

        let err = kv.cas("key", version, "third").expect_err("stale swap");
        assert!(matches!(err, KvError::Conflict { .. }));
    }

    #[test]
    fn list_filters_by_prefix() {
        let kv = KvStore::new();
        kv.put("intent/node1/pod", "m1").expect("put");
        kv.put("intent/node2/pod", "m2").expect("put");
        kv.put("daemon_sets/abc", "ds").expect("put");

        let mut keys: Vec<String> = kv
            .list("intent/")
            .expect("list")
            .into_iter()
            .map(|(key, _, _)| key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["intent/node1/pod", "intent/node2/pod"]);
    }

    #[tokio::test]
    async fn watch_delivers_diffs_in_version_order() {
        let kv = KvStore::new();
        let mut watch = kv.watch("labels/", None);

        kv.put("labels/node/node1", "a").expect("put");
        kv.put("other/key", "ignored").expect("put");
        kv.put("labels/node/node2", "b").expect("put");
        kv.delete("labels/node/node1").expect("delete");

        let first = timeout(Duration::from_secs(1), watch.next())
            .await
            .expect("first event")
            .expect("stream open");
        assert_eq!(first.key, "labels/node/node1");
        assert_eq!(first.value.as_deref(), Some("a"));

        let second = timeout(Duration::from_secs(1), watch.next())
            .await
            .expect("second event")
            .expect("stream open");
        assert_eq!(second.key, "labels/node/node2");
        assert!(second.version > first.version);

        let third = timeout(Duration::from_secs(1), watch.next())
            .await
            .expect("third event")
            .expect("stream open");
        assert_eq!(third.key, "labels/node/node1");
        assert_eq!(third.value, None);
    }

    #[tokio::test]
    async fn watch_since_replays_history() {
        let kv = KvStore::new();
        kv.put("a", "1").expect("put");
        let cutoff = kv.version();
        kv.put("b", "2").expect("put");

        let mut watch = kv.watch("", Some(cutoff));
        let event = watch.try_next().expect("replayed event");
        assert_eq!(event.key, "b");
        assert!(watch.try_next().is_none());
    }
}
