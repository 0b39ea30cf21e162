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

//! Durable, watchable store of daemon set records under `daemon_sets/<id>`.
//! Mutation is read-modify-write under compare-and-swap with bounded retry;
//! the watch delivers coalesced {added, updated, deleted} snapshots that
//! never lose a record's final state.

use crate::podfarm::ds::daemonset::DaemonSet;
use crate::podfarm::labels::selector::LabelSelector;
use crate::podfarm::store::kv::{KvError, KvStore, KvWatchStream};
use crate::podfarm::types::{ClusterName, DaemonSetId, PodId, PodManifest};
use chrono::Utc;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

const DS_TREE: &str = "daemon_sets/";
const MUTATE_RETRIES: usize = 3;

#[derive(Debug)]
pub enum DsError {
    NotFound(DaemonSetId),
    /// Optimistic-concurrency loss that survived every retry.
    Conflict(DaemonSetId),
    /// A mutation attempted to change the record's identity.
    IdChanged(DaemonSetId),
    Corrupt(serde_json::Error),
    Store(KvError),
}

impl Display for DsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DsError::NotFound(id) => write!(f, "no daemon set with id '{}'", id),
            DsError::Conflict(id) => {
                write!(f, "conflicting writes to daemon set '{}'", id)
            }
            DsError::IdChanged(id) => {
                write!(f, "mutation may not change the id of daemon set '{}'", id)
            }
            DsError::Corrupt(err) => write!(f, "corrupt daemon set record: {}", err),
            DsError::Store(err) => write!(f, "daemon set store unavailable: {}", err),
        }
    }
}

impl Error for DsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DsError::Corrupt(err) => Some(err),
            DsError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<KvError> for DsError {
    fn from(err: KvError) -> Self {
        DsError::Store(err)
    }
}

#[derive(Clone)]
pub struct DsStore {
    kv: KvStore,
}

impl DsStore {
    pub fn new(kv: KvStore) -> Self {
        DsStore { kv }
    }

    /// Writes a new record with a fresh id and creation time, enabled.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        manifest: PodManifest,
        min_health: u32,
        cluster_name: ClusterName,
        node_selector: &LabelSelector,
        pod_id: PodId,
        timeout: Duration,
    ) -> Result<DaemonSet, DsError> {
        let ds = DaemonSet {
            id: DaemonSetId::new(),
            pod_id,
            manifest,
            min_health,
            cluster_name,
            node_selector: node_selector.to_string(),
            timeout,
            disabled: false,
            created_at: Utc::now(),
        };
        let raw = encode(&ds)?;
        match self.kv.cas(&record_key(&ds.id), 0, &raw) {
            Ok(_) => Ok(ds),
            Err(KvError::Conflict { .. }) => Err(DsError::Conflict(ds.id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetches a record and its store version.
    pub fn get(&self, id: &DaemonSetId) -> Result<(DaemonSet, u64), DsError> {
        match self.kv.get(&record_key(id))? {
            Some((raw, version)) => Ok((decode(&raw)?, version)),
            None => Err(DsError::NotFound(id.clone())),
        }
    }

    pub fn list(&self) -> Result<Vec<DaemonSet>, DsError> {
        let mut records = Vec::new();
        for (_, raw, _) in self.kv.list(DS_TREE)? {
            records.push(decode(&raw)?);
        }
        Ok(records)
    }

    /// Read-modify-write under optimistic concurrency. The mutation runs
    /// against the freshest committed record on every attempt; after the
    /// retry bound the conflict surfaces to the caller.
    pub fn mutate<F>(&self, id: &DaemonSetId, mutation: F) -> Result<DaemonSet, DsError>
    where
        F: Fn(&mut DaemonSet),
    {
        for _ in 0..MUTATE_RETRIES {
            let (mut ds, version) = self.get(id)?;
            mutation(&mut ds);
            if ds.id != *id {
                return Err(DsError::IdChanged(id.clone()));
            }
            let raw = encode(&ds)?;
            match self.kv.cas(&record_key(id), version, &raw) {
                Ok(_) => return Ok(ds),
                Err(KvError::Conflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(DsError::Conflict(id.clone()))
    }

    /// Idempotent delete.
    pub fn delete(&self, id: &DaemonSetId) -> Result<(), DsError> {
        self.kv.delete(&record_key(id))?;
        Ok(())
    }

    /// Opens a snapshot stream. The first snapshot reports every existing
    /// record as added; later snapshots carry the diffs since the previous
    /// one, merging bursts of physical writes.
    pub fn watch_all(&self) -> DsWatchStream {
        let since = self.kv.version();
        let watch = self.kv.watch(DS_TREE, Some(since));
        DsWatchStream {
            watch,
            store: self.clone(),
            known: HashMap::new(),
            primed: false,
        }
    }
}

fn record_key(id: &DaemonSetId) -> String {
    format!("{}{}", DS_TREE, id)
}

fn encode(ds: &DaemonSet) -> Result<String, DsError> {
    serde_json::to_string(ds).map_err(DsError::Corrupt)
}

fn decode(raw: &str) -> Result<DaemonSet, DsError> {
    serde_json::from_str(raw).map_err(DsError::Corrupt)
}

/// One coalesced diff of the daemon set tree.
#[derive(Clone, Debug, Default)]
pub struct DsWatchSnapshot {
    pub added: Vec<DaemonSet>,
    pub updated: Vec<DaemonSet>,
    pub deleted: Vec<DaemonSet>,
}

impl DsWatchSnapshot {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

pub struct DsWatchStream {
    watch: KvWatchStream,
    store: DsStore,
    known: HashMap<String, (DaemonSet, u64)>,
    primed: bool,
}

impl DsWatchStream {
    pub async fn next(&mut self) -> Option<DsWatchSnapshot> {
        if !self.primed {
            self.primed = true;
            if let Some(snapshot) = self.prime() {
                return Some(snapshot);
            }
        }

        loop {
            let first = self.watch.next().await?;
            let before = self.known.clone();
            self.apply(first.key, first.value, first.version);
            while let Some(event) = self.watch.try_next() {
                self.apply(event.key, event.value, event.version);
            }

            let snapshot = diff(&before, &self.known);
            if !snapshot.is_empty() {
                return Some(snapshot);
            }
        }
    }

    fn prime(&mut self) -> Option<DsWatchSnapshot> {
        let listed = self.store.kv.list(DS_TREE).ok()?;
        let mut snapshot = DsWatchSnapshot::default();
        for (key, raw, version) in listed {
            if let Ok(ds) = serde_json::from_str::<DaemonSet>(&raw) {
                snapshot.added.push(ds.clone());
                self.known.insert(key, (ds, version));
            }
        }
        sort_snapshot(&mut snapshot);
        if snapshot.is_empty() {
            None
        } else {
            Some(snapshot)
        }
    }

    fn apply(&mut self, key: String, value: Option<String>, version: u64) {
        match value {
            Some(raw) => {
                // Records that fail to decode are ignored rather than
                // poisoning the stream; the writer owns the schema.
                if let Ok(ds) = serde_json::from_str::<DaemonSet>(&raw) {
                    self.known.insert(key, (ds, version));
                }
            }
            None => {
                self.known.remove(&key);
            }
        }
    }
}

fn diff(
    before: &HashMap<String, (DaemonSet, u64)>,
    after: &HashMap<String, (DaemonSet, u64)>,
) -> DsWatchSnapshot {
    let mut snapshot = DsWatchSnapshot::default();
    for (key, (ds, version)) in after {
        match before.get(key) {
            None => snapshot.added.push(ds.clone()),
            Some((previous, previous_version)) => {
                if version != previous_version && ds != previous {
                    snapshot.updated.push(ds.clone());
                }
            }
        }
    }
    for (key, (ds, _)) in before {
        if !after.contains_key(key) {
            snapshot.deleted.push(ds.clone());
        }
    }
    sort_snapshot(&mut snapshot);
    snapshot
}

fn sort_snapshot(snapshot: &mut DsWatchSnapshot) {
    snapshot.added.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    snapshot.updated.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    snapshot.deleted.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}
