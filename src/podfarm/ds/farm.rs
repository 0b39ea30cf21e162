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

//! The farm: multiplexes daemon set store events onto per-daemon-set
//! workers, owns each daemon set through a session lock so replicas never
//! drive the same set twice, disables mutually contending daemon sets, and
//! reaps pod labels and intent entries whose daemon set no longer exists.

use crate::podfarm::alerting::Alerter;
use crate::podfarm::ds::child::ChildDaemonSet;
use crate::podfarm::ds::daemonset::{DaemonSet, DS_ID_LABEL};
use crate::podfarm::labels::selector::LabelSelector;
use crate::podfarm::labels::{split_pod_label_key, Applicator, LabelKind};
use crate::podfarm::logger::Logger;
use crate::podfarm::store::dsstore::{DsError, DsStore, DsWatchSnapshot, DsWatchStream};
use crate::podfarm::store::intent::IntentStore;
use crate::podfarm::store::session::{Session, SessionError, SessionLock};
use crate::podfarm::types::{DaemonSetId, NodeName, PodId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const LOCK_TREE: &str = "lock/daemon_sets/";

struct ChildEntry {
    child: ChildDaemonSet,
    // Held for the lifetime of the child; releasing it lets another replica
    // adopt the daemon set.
    _lock: SessionLock,
}

pub struct Farm {
    ds_store: DsStore,
    intent: IntentStore,
    applicator: Applicator,
    session: Session,
    children: Mutex<HashMap<DaemonSetId, ChildEntry>>,
    logger: Logger,
    alerter: Arc<dyn Alerter>,
}

impl Farm {
    pub fn new(
        ds_store: DsStore,
        intent: IntentStore,
        applicator: Applicator,
        session: Session,
        logger: Logger,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        Farm {
            ds_store,
            intent,
            applicator,
            session,
            children: Mutex::new(HashMap::new()),
            logger,
            alerter,
        }
    }

    /// Drives daemon set store snapshots until `quit` fires. On session loss
    /// every child stops in place and the loop resynchronizes from a fresh
    /// watch under a reacquired lease.
    pub async fn main_loop(&self, quit: CancellationToken) {
        loop {
            let mut watch = self.ds_store.watch_all();
            loop {
                tokio::select! {
                    _ = quit.cancelled() => {
                        self.halt_children();
                        return;
                    }
                    _ = self.session.cancelled() => break,
                    snapshot = watch.next() => match snapshot {
                        Some(snapshot) => {
                            self.apply_snapshot(snapshot);
                            self.check_contention();
                        }
                        None => {
                            self.logger.error("daemon set watch ended unexpectedly", &[]);
                            self.halt_children();
                            return;
                        }
                    }
                }
            }

            self.logger
                .warn("session lost; stopping all children in place", &[]);
            self.alert("farm_session_lost", &[("farm", self.session.name())]);
            self.halt_children();
            self.session.reacquire();
            self.logger.info("session reacquired; resynchronizing", &[]);
        }
    }

    fn apply_snapshot(&self, snapshot: DsWatchSnapshot) {
        let mut children = self.lock_children();
        for ds in snapshot.added {
            self.adopt(&mut children, ds);
        }
        for ds in snapshot.updated {
            match children.get(&ds.id) {
                Some(entry) => entry.child.update_ds(ds),
                // An update for a set nobody drives is a second chance to
                // take the lock.
                None => self.adopt(&mut children, ds),
            }
        }
        for ds in snapshot.deleted {
            if let Some(entry) = children.remove(&ds.id) {
                self.logger
                    .info("daemon set deleted; tearing down", &[("ds_id", ds.id.as_str())]);
                entry.child.teardown();
            }
        }
    }

    fn adopt(&self, children: &mut HashMap<DaemonSetId, ChildEntry>, ds: DaemonSet) {
        if let Some(entry) = children.get(&ds.id) {
            entry.child.update_ds(ds);
            return;
        }
        match self.session.lock(lock_key(&ds.id)) {
            Ok(lock) => {
                self.logger
                    .info("acquired daemon set", &[("ds_id", ds.id.as_str())]);
                let child_logger = self.logger.sub_logger(&[
                    ("ds_id", ds.id.as_str()),
                    ("pod_id", ds.pod_id.as_str()),
                ]);
                let child = ChildDaemonSet::spawn(
                    ds.clone(),
                    self.applicator.clone(),
                    self.intent.clone(),
                    self.session.clone(),
                    child_logger,
                    Arc::clone(&self.alerter),
                );
                children.insert(ds.id, ChildEntry { child, _lock: lock });
            }
            Err(SessionError::AlreadyHeld { .. }) => {
                self.logger.debug(
                    "daemon set already driven by another farm",
                    &[("ds_id", ds.id.as_str())],
                );
            }
            Err(SessionError::Lost) => {
                self.logger
                    .warn("session lost while adopting daemon set", &[("ds_id", ds.id.as_str())]);
            }
        }
    }

    /// Walks all records in creation order and disables any enabled daemon
    /// set whose schedule would write a (node, pod) pair an earlier enabled
    /// set already claims. Runs after every snapshot: the on-write guard in
    /// the workers stops races the moment they happen, this pass settles the
    /// record state.
    fn check_contention(&self) {
        let mut records = match self.ds_store.list() {
            Ok(records) => records,
            Err(err) => {
                self.logger.warn(
                    "could not list daemon sets for contention check",
                    &[("error", &err.to_string())],
                );
                return;
            }
        };
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut claims: HashMap<(NodeName, PodId), DaemonSetId> = HashMap::new();
        for ds in records {
            // Disabled sets are frozen: they neither claim pairs nor need
            // re-disabling. Their existing pod labels stay protected by the
            // on-write guard.
            if ds.disabled {
                continue;
            }
            let Ok(selector) = ds.selector() else {
                continue;
            };
            let matches = match self.applicator.get_matches(LabelKind::Node, &selector) {
                Ok(matches) => matches,
                Err(err) => {
                    self.logger.warn(
                        "could not resolve node matches for contention check",
                        &[("ds_id", ds.id.as_str()), ("error", &err.to_string())],
                    );
                    continue;
                }
            };

            let pairs: Vec<(NodeName, PodId)> = matches
                .into_iter()
                .map(|entity| (NodeName::new(entity.id), ds.pod_id.clone()))
                .collect();
            let earlier = pairs
                .iter()
                .find_map(|pair| claims.get(pair))
                .cloned();

            match earlier {
                Some(earlier) => self.disable_contender(&ds, &earlier),
                None => {
                    for pair in pairs {
                        claims.insert(pair, ds.id.clone());
                    }
                }
            }
        }
    }

    fn disable_contender(&self, ds: &DaemonSet, earlier: &DaemonSetId) {
        // Surface the state on the worker first so no scheduling write races
        // the record mutation below.
        if let Some(entry) = self.lock_children().get(&ds.id) {
            entry.child.mark_contended();
        }
        self.logger.warn(
            "daemon set contends with an earlier one; disabling",
            &[("ds_id", ds.id.as_str()), ("kept", earlier.as_str())],
        );
        self.alert(
            "ds_contention",
            &[("disabled", ds.id.as_str()), ("kept", earlier.as_str())],
        );

        match self.ds_store.mutate(&ds.id, |ds| ds.disabled = true) {
            Ok(_) => {}
            // Deleted under us; nothing left to disable.
            Err(DsError::NotFound(_)) => {}
            Err(err) => {
                self.logger.warn(
                    "could not disable contending daemon set; retrying on the next event",
                    &[("ds_id", ds.id.as_str()), ("error", &err.to_string())],
                );
            }
        }
    }

    /// Reaps pod labels and intent entries whose daemon set no longer
    /// exists: runs once at startup, then on a timer and on every delete
    /// observed in the store. This is the sole recovery path for labels
    /// orphaned while their owning farm was offline.
    pub async fn cleanup_daemon_set_pods(&self, quit: CancellationToken) {
        let mut watch = Some(self.ds_store.watch_all());
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);

        loop {
            tokio::select! {
                _ = quit.cancelled() => return,
                _ = ticker.tick() => self.cleanup_pass(),
                snapshot = next_snapshot(&mut watch) => match snapshot {
                    Some(snapshot) => {
                        if !snapshot.deleted.is_empty() {
                            self.cleanup_pass();
                        }
                    }
                    None => watch = None,
                }
            }
        }
    }

    fn cleanup_pass(&self) {
        let selector = LabelSelector::everything().and_exists(DS_ID_LABEL);
        let rows = match self.applicator.get_matches(LabelKind::Pod, &selector) {
            Ok(rows) => rows,
            Err(err) => {
                self.logger.warn(
                    "could not enumerate pod rows for cleanup",
                    &[("error", &err.to_string())],
                );
                return;
            }
        };

        for row in rows {
            let Some(owner) = row.labels.get(DS_ID_LABEL) else {
                continue;
            };
            let owner_id = DaemonSetId::from_string(owner.clone());
            match self.ds_store.get(&owner_id) {
                Ok(_) => continue,
                Err(DsError::NotFound(_)) => {}
                Err(err) => {
                    self.logger.warn(
                        "could not resolve daemon set during cleanup",
                        &[("ds_id", owner.as_str()), ("error", &err.to_string())],
                    );
                    continue;
                }
            }

            let Some((node, pod_id)) = split_pod_label_key(&row.id) else {
                self.logger.error(
                    "pod row with a dangling daemon set id has a malformed key; operator attention required",
                    &[("pod", &row.id), ("ds_id", owner.as_str())],
                );
                self.alert(
                    "ds_cleanup_invariant",
                    &[("pod", &row.id), ("ds_id", owner.as_str())],
                );
                continue;
            };

            self.logger.info(
                "removing dangling pod labels and intent",
                &[("pod", &row.id), ("ds_id", owner.as_str())],
            );
            if let Err(err) = self
                .applicator
                .remove_label(LabelKind::Pod, &row.id, DS_ID_LABEL)
            {
                self.logger.warn(
                    "could not remove dangling pod label",
                    &[("pod", &row.id), ("error", &err.to_string())],
                );
                continue;
            }
            if let Err(err) = self.intent.delete_pod(&node, &pod_id) {
                self.logger.warn(
                    "could not remove dangling intent entry",
                    &[("pod", &row.id), ("error", &err.to_string())],
                );
            }
        }
    }

    fn halt_children(&self) {
        let mut children = self.lock_children();
        for (id, entry) in children.drain() {
            self.logger
                .debug("stopping child", &[("ds_id", id.as_str())]);
            entry.child.quit();
        }
    }

    /// Whether this farm currently drives the daemon set.
    pub fn has_child(&self, id: &DaemonSetId) -> bool {
        self.lock_children().contains_key(id)
    }

    pub fn child_ids(&self) -> Vec<DaemonSetId> {
        self.lock_children().keys().cloned().collect()
    }

    /// The disabled state of a driven daemon set, `None` when not driven
    /// here.
    pub fn child_is_disabled(&self, id: &DaemonSetId) -> Option<bool> {
        self.lock_children()
            .get(id)
            .map(|entry| entry.child.is_disabled())
    }

    pub fn child_nodes(&self, id: &DaemonSetId) -> Option<Vec<NodeName>> {
        self.lock_children()
            .get(id)
            .map(|entry| entry.child.current_nodes())
    }

    fn lock_children(&self) -> MutexGuard<'_, HashMap<DaemonSetId, ChildEntry>> {
        self.children.lock().expect("farm children lock poisoned")
    }

    fn alert(&self, kind: &str, details: &[(&str, &str)]) {
        if let Err(err) = self.alerter.alert(kind, details) {
            self.logger
                .warn("alert delivery failed", &[("error", &err.to_string())]);
        }
    }
}

async fn next_snapshot(watch: &mut Option<DsWatchStream>) -> Option<DsWatchSnapshot> {
    match watch.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

fn lock_key(id: &DaemonSetId) -> String {
    format!("{}{}", LOCK_TREE, id)
}
