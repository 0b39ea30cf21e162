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

//! The label index: key-value tags attached to nodes, pods and daemon sets,
//! stored under `labels/<kind>/<id>` in the coordination store, with selector
//! queries and selector-scoped watches.

pub mod selector;

use crate::podfarm::store::kv::{KvError, KvStore, KvWatchStream};
use crate::podfarm::types::{NodeName, PodId};
use selector::LabelSelector;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{self, Display, Formatter};

const LABEL_TREE: &str = "labels/";

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LabelKind {
    Node,
    Pod,
    DaemonSet,
}

impl LabelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LabelKind::Node => "node",
            LabelKind::Pod => "pod",
            LabelKind::DaemonSet => "daemon_set",
        }
    }

    fn prefix(self) -> String {
        format!("{}{}/", LABEL_TREE, self.as_str())
    }
}

impl Display for LabelKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The pod-row id labeled by daemon set scheduling: `node/podID`.
pub fn make_pod_label_key(node: &NodeName, pod_id: &PodId) -> String {
    format!("{}/{}", node, pod_id)
}

/// Splits a pod-row id back into its node and pod halves. Returns `None` for
/// ids that were not produced by `make_pod_label_key`.
pub fn split_pod_label_key(id: &str) -> Option<(NodeName, PodId)> {
    let (node, pod_id) = id.split_once('/')?;
    if node.is_empty() || pod_id.is_empty() {
        return None;
    }
    Some((NodeName::new(node), PodId::new(pod_id)))
}

/// An entity and its full label set. Missing entities carry an empty set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LabeledEntity {
    pub id: String,
    pub labels: HashMap<String, String>,
}

impl LabeledEntity {
    fn empty(id: impl Into<String>) -> Self {
        LabeledEntity {
            id: id.into(),
            labels: HashMap::new(),
        }
    }
}

#[derive(Debug)]
pub enum LabelError {
    /// Transport failure talking to the backing store.
    Unavailable(KvError),
}

impl Display for LabelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LabelError::Unavailable(err) => write!(f, "label store unavailable: {}", err),
        }
    }
}

impl Error for LabelError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LabelError::Unavailable(err) => Some(err),
        }
    }
}

impl From<KvError> for LabelError {
    fn from(err: KvError) -> Self {
        LabelError::Unavailable(err)
    }
}

/// Watchable label index over the coordination store. Concurrent readers run
/// freely; writers to one (kind, id) row serialize through compare-and-swap.
#[derive(Clone)]
pub struct Applicator {
    kv: KvStore,
}

impl Applicator {
    pub fn new(kv: KvStore) -> Self {
        Applicator { kv }
    }

    /// Upserts one label under (kind, id).
    pub fn set_label(
        &self,
        kind: LabelKind,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), LabelError> {
        self.mutate_row(kind, id, |labels| {
            labels.insert(key.to_string(), value.to_string());
        })
    }

    /// Deletes one label key; an absent key or row is not an error.
    pub fn remove_label(&self, kind: LabelKind, id: &str, key: &str) -> Result<(), LabelError> {
        self.mutate_row(kind, id, |labels| {
            labels.remove(key);
        })
    }

    /// Returns the full label set of (kind, id); missing rows are empty.
    pub fn get_labels(&self, kind: LabelKind, id: &str) -> Result<LabeledEntity, LabelError> {
        let row_key = row_key(kind, id);
        match self.kv.get(&row_key)? {
            Some((raw, _)) => Ok(LabeledEntity {
                id: id.to_string(),
                labels: decode_labels(&raw),
            }),
            None => Ok(LabeledEntity::empty(id)),
        }
    }

    /// Evaluates `selector` against every labeled entity of `kind`.
    pub fn get_matches(
        &self,
        kind: LabelKind,
        selector: &LabelSelector,
    ) -> Result<Vec<LabeledEntity>, LabelError> {
        let prefix = kind.prefix();
        let mut matches = Vec::new();
        for (key, raw, _) in self.kv.list(&prefix)? {
            let labels = decode_labels(&raw);
            if selector.matches(&labels) {
                let id = key[prefix.len()..].to_string();
                matches.push(LabeledEntity { id, labels });
            }
        }
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches)
    }

    /// Watches the match set of `selector` over entities of `kind`, emitting
    /// one delta per entity entering or leaving the set. The initial match
    /// set is absorbed silently; only subsequent changes produce events.
    pub fn watch_matches(
        &self,
        kind: LabelKind,
        selector: LabelSelector,
    ) -> Result<MatchWatch, LabelError> {
        // Read the cursor before seeding so that writes racing the seed are
        // replayed from history rather than lost.
        let since = self.kv.version();
        let known: HashSet<String> = self
            .get_matches(kind, &selector)?
            .into_iter()
            .map(|entity| entity.id)
            .collect();
        let watch = self.kv.watch(&kind.prefix(), Some(since));
        Ok(MatchWatch {
            prefix: kind.prefix(),
            selector,
            watch,
            known,
        })
    }

    fn mutate_row<F>(&self, kind: LabelKind, id: &str, apply: F) -> Result<(), LabelError>
    where
        F: Fn(&mut HashMap<String, String>),
    {
        let row_key = row_key(kind, id);
        loop {
            let current = self.kv.get(&row_key)?;
            let (mut labels, version) = match &current {
                Some((raw, version)) => (decode_labels(raw), *version),
                None => (HashMap::new(), 0),
            };
            apply(&mut labels);

            let outcome = if labels.is_empty() {
                if current.is_none() {
                    return Ok(());
                }
                self.kv.delete(&row_key).map(|_| 0)
            } else {
                let encoded = encode_labels(&labels);
                self.kv.cas(&row_key, version, &encoded)
            };

            match outcome {
                Ok(_) => return Ok(()),
                Err(KvError::Conflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn row_key(kind: LabelKind, id: &str) -> String {
    format!("{}{}", kind.prefix(), id)
}

fn encode_labels(labels: &HashMap<String, String>) -> String {
    serde_json::to_string(labels).expect("label map serializes")
}

fn decode_labels(raw: &str) -> HashMap<String, String> {
    serde_json::from_str(raw).unwrap_or_default()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LabelEventKind {
    Added,
    Removed,
}

/// A change in a watched match set.
#[derive(Clone, Debug)]
pub struct LabelEvent {
    pub kind: LabelEventKind,
    pub entity: LabeledEntity,
}

/// Delta stream produced by `Applicator::watch_matches`.
pub struct MatchWatch {
    prefix: String,
    selector: LabelSelector,
    watch: KvWatchStream,
    known: HashSet<String>,
}

impl MatchWatch {
    /// Waits for the next entity to enter or leave the match set.
    pub async fn next(&mut self) -> Option<LabelEvent> {
        loop {
            let event = self.watch.next().await?;
            if let Some(delta) = self.evaluate(&event.key, event.value.as_deref()) {
                return Some(delta);
            }
        }
    }

    fn evaluate(&mut self, key: &str, value: Option<&str>) -> Option<LabelEvent> {
        let id = key.strip_prefix(&self.prefix)?.to_string();
        let labels = value.map(decode_labels).unwrap_or_default();
        let matches = value.is_some() && self.selector.matches(&labels);

        if matches && self.known.insert(id.clone()) {
            return Some(LabelEvent {
                kind: LabelEventKind::Added,
                entity: LabeledEntity { id, labels },
            });
        }
        if !matches && self.known.remove(&id) {
            return Some(LabelEvent {
                kind: LabelEventKind::Removed,
                entity: LabeledEntity { id, labels },
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn applicator() -> Applicator {
        Applicator::new(KvStore::new())
    }

    #[test]
    fn get_labels_on_missing_entity_is_empty() {
        let applicator = applicator();
        let labeled = applicator
            .get_labels(LabelKind::Pod, "node1/testPod")
            .expect("get labels");
        assert!(labeled.labels.is_empty());
    }

    #[test]
    fn set_get_remove_round_trip() {
        let applicator = applicator();
        applicator
            .set_label(LabelKind::Node, "node1", "az", "az1")
            .expect("set label");
        applicator
            .set_label(LabelKind::Node, "node1", "rack", "r7")
            .expect("set label");

        let labeled = applicator
            .get_labels(LabelKind::Node, "node1")
            .expect("get labels");
        assert_eq!(labeled.labels.get("az").map(String::as_str), Some("az1"));
        assert_eq!(labeled.labels.get("rack").map(String::as_str), Some("r7"));

        applicator
            .remove_label(LabelKind::Node, "node1", "az")
            .expect("remove label");
        let labeled = applicator
            .get_labels(LabelKind::Node, "node1")
            .expect("get labels");
        assert!(!labeled.labels.contains_key("az"));

        // Removing an absent key is not an error.
        applicator
            .remove_label(LabelKind::Node, "node1", "az")
            .expect("remove absent label");
        applicator
            .remove_label(LabelKind::Node, "ghost", "az")
            .expect("remove from absent row");
    }

    #[test]
    fn matches_are_scoped_by_kind_and_selector() {
        let applicator = applicator();
        applicator
            .set_label(LabelKind::Node, "node1", "az", "az1")
            .expect("set");
        applicator
            .set_label(LabelKind::Node, "node2", "az", "az2")
            .expect("set");
        applicator
            .set_label(LabelKind::Pod, "node1/testPod", "az", "az1")
            .expect("set");

        let selector = LabelSelector::everything().and_equals("az", "az1");
        let matches = applicator
            .get_matches(LabelKind::Node, &selector)
            .expect("matches");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "node1");
    }

    #[test]
    fn pod_label_keys_round_trip() {
        let key = make_pod_label_key(&NodeName::new("node1"), &PodId::new("testPod"));
        assert_eq!(key, "node1/testPod");
        let (node, pod_id) = split_pod_label_key(&key).expect("split");
        assert_eq!(node.as_str(), "node1");
        assert_eq!(pod_id.as_str(), "testPod");

        assert!(split_pod_label_key("nodeonly").is_none());
        assert!(split_pod_label_key("/testPod").is_none());
    }

    #[tokio::test]
    async fn watch_emits_deltas_as_the_match_set_changes() {
        let applicator = applicator();
        let selector = LabelSelector::everything().and_equals("az", "az1");
        let mut watch = applicator
            .watch_matches(LabelKind::Node, selector)
            .expect("watch");

        applicator
            .set_label(LabelKind::Node, "node1", "az", "az1")
            .expect("set");
        let event = timeout(Duration::from_secs(1), watch.next())
            .await
            .expect("add event")
            .expect("stream open");
        assert_eq!(event.kind, LabelEventKind::Added);
        assert_eq!(event.entity.id, "node1");

        // An unrelated label change on a matching node is not a delta.
        applicator
            .set_label(LabelKind::Node, "node1", "rack", "r7")
            .expect("set");
        // Relabeling out of the selector is a removal.
        applicator
            .set_label(LabelKind::Node, "node1", "az", "az99")
            .expect("set");
        let event = timeout(Duration::from_secs(1), watch.next())
            .await
            .expect("remove event")
            .expect("stream open");
        assert_eq!(event.kind, LabelEventKind::Removed);
        assert_eq!(event.entity.id, "node1");
    }

    #[tokio::test]
    async fn watch_absorbs_preexisting_matches() {
        let applicator = applicator();
        applicator
            .set_label(LabelKind::Node, "node1", "az", "az1")
            .expect("set");

        let selector = LabelSelector::everything().and_equals("az", "az1");
        let mut watch = applicator
            .watch_matches(LabelKind::Node, selector)
            .expect("watch");

        applicator
            .set_label(LabelKind::Node, "node2", "az", "az1")
            .expect("set");
        let event = timeout(Duration::from_secs(1), watch.next())
            .await
            .expect("add event")
            .expect("stream open");
        assert_eq!(event.entity.id, "node2", "node1 was already in the set");
    }
}
