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

//! The per-daemon-set worker. One task owns the scheduling loop for one
//! daemon set: it resolves the node selector against node labels, writes the
//! pod-row ownership label and the intent entry for nodes entering the match
//! set, and removes both for nodes leaving it. Disabling freezes the worker
//! in place; nothing it has scheduled is ever unscheduled by a freeze.

use crate::podfarm::alerting::Alerter;
use crate::podfarm::ds::daemonset::{DaemonSet, DS_ID_LABEL};
use crate::podfarm::labels::selector::LabelSelector;
use crate::podfarm::labels::{
    make_pod_label_key, split_pod_label_key, Applicator, LabelEvent, LabelEventKind, LabelKind,
    MatchWatch,
};
use crate::podfarm::logger::Logger;
use crate::podfarm::store::intent::IntentStore;
use crate::podfarm::store::session::Session;
use crate::podfarm::types::{DaemonSetId, NodeName};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const BACKOFF_INITIAL_MS: u64 = 100;
const BACKOFF_MAX_MS: u64 = 30_000;

enum ChildCommand {
    Update(DaemonSet),
    Teardown,
}

struct ChildState {
    ds: Mutex<DaemonSet>,
    contended: AtomicBool,
    selector_broken: AtomicBool,
    owned: Mutex<BTreeSet<NodeName>>,
}

impl ChildState {
    fn snapshot(&self) -> DaemonSet {
        self.ds.lock().expect("child ds lock poisoned").clone()
    }

    fn is_disabled(&self) -> bool {
        self.snapshot().disabled
            || self.contended.load(Ordering::SeqCst)
            || self.selector_broken.load(Ordering::SeqCst)
    }

    fn owned(&self) -> BTreeSet<NodeName> {
        self.owned.lock().expect("child owned lock poisoned").clone()
    }
}

/// Handle to a running per-daemon-set worker, held by the farm.
pub struct ChildDaemonSet {
    state: Arc<ChildState>,
    commands: mpsc::UnboundedSender<ChildCommand>,
    quit: CancellationToken,
}

impl ChildDaemonSet {
    pub fn spawn(
        ds: DaemonSet,
        applicator: Applicator,
        intent: IntentStore,
        session: Session,
        logger: Logger,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        let state = Arc::new(ChildState {
            ds: Mutex::new(ds),
            contended: AtomicBool::new(false),
            selector_broken: AtomicBool::new(false),
            owned: Mutex::new(BTreeSet::new()),
        });
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let quit = CancellationToken::new();

        let worker = Worker {
            state: Arc::clone(&state),
            applicator,
            intent,
            session,
            quit: quit.clone(),
            logger,
            alerter,
            selector: None,
        };
        tokio::spawn(run(worker, commands_rx));

        ChildDaemonSet {
            state,
            commands,
            quit,
        }
    }

    pub fn id(&self) -> DaemonSetId {
        self.state.snapshot().id
    }

    /// True when the daemon set record is disabled, the farm has marked this
    /// worker as contending, or its selector failed to compile.
    pub fn is_disabled(&self) -> bool {
        self.state.is_disabled()
    }

    /// Nodes this worker believes it currently has scheduled.
    pub fn current_nodes(&self) -> Vec<NodeName> {
        self.state.owned().into_iter().collect()
    }

    /// Delivers a fresh record snapshot; snapshots apply in send order.
    pub fn update_ds(&self, ds: DaemonSet) {
        let _ = self.commands.send(ChildCommand::Update(ds));
    }

    /// Instructs the worker to unschedule every owned node and stop. Used
    /// when the daemon set record has been deleted.
    pub fn teardown(&self) {
        let _ = self.commands.send(ChildCommand::Teardown);
    }

    /// Surfaces contention immediately so no scheduling write races the
    /// record mutation that will follow.
    pub fn mark_contended(&self) {
        self.state.contended.store(true, Ordering::SeqCst);
    }

    /// Stops the worker promptly without unscheduling anything.
    pub fn quit(&self) {
        self.quit.cancel();
    }
}

struct Worker {
    state: Arc<ChildState>,
    applicator: Applicator,
    intent: IntentStore,
    session: Session,
    quit: CancellationToken,
    logger: Logger,
    alerter: Arc<dyn Alerter>,
    selector: Option<LabelSelector>,
}

enum Step {
    Quit,
    SessionLost,
    Command(Option<ChildCommand>),
    Label(Option<LabelEvent>),
}

enum UpdateAction {
    None,
    RewriteIntent,
    Reconcile,
    Resubscribe { reconcile: bool },
}

async fn run(mut worker: Worker, mut commands: mpsc::UnboundedReceiver<ChildCommand>) {
    let initial = worker.state.snapshot();
    worker.compile_selector(&initial.node_selector);
    worker.recover_owned().await;

    let mut watch = worker.subscribe();
    if !worker.state.is_disabled() {
        worker.reconcile().await;
    }

    loop {
        // Resolve the multiplex first so every pending future is dropped
        // before the handler touches the worker.
        let step = {
            let quit = worker.quit.clone();
            tokio::select! {
                _ = quit.cancelled() => Step::Quit,
                _ = worker.session.cancelled() => Step::SessionLost,
                command = commands.recv() => Step::Command(command),
                event = next_label_event(&mut watch) => Step::Label(event),
            }
        };

        match step {
            Step::Quit => return,
            Step::SessionLost => {
                worker
                    .logger
                    .info("session lost; stopping without unscheduling", &[]);
                return;
            }
            Step::Command(Some(ChildCommand::Update(ds))) => {
                match worker.apply_update(ds) {
                    UpdateAction::None => {}
                    UpdateAction::RewriteIntent => worker.rewrite_intent().await,
                    UpdateAction::Reconcile => worker.reconcile().await,
                    // Resubscribe before reconciling: the fresh watch absorbs
                    // the current match set, so any node labeled in between
                    // is picked up by the reconcile rather than lost.
                    UpdateAction::Resubscribe { reconcile } => {
                        watch = worker.subscribe();
                        if reconcile {
                            worker.reconcile().await;
                        }
                    }
                }
            }
            Step::Command(Some(ChildCommand::Teardown)) => {
                worker.unschedule_all().await;
                return;
            }
            Step::Command(None) => return,
            Step::Label(Some(event)) => worker.handle_label_event(event).await,
            Step::Label(None) => watch = None,
        }
    }
}

async fn next_label_event(watch: &mut Option<MatchWatch>) -> Option<LabelEvent> {
    match watch.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl Worker {
    fn compile_selector(&mut self, raw: &str) {
        match LabelSelector::parse(raw) {
            Ok(selector) => {
                self.selector = Some(selector);
                self.state.selector_broken.store(false, Ordering::SeqCst);
            }
            Err(err) => {
                self.selector = None;
                self.state.selector_broken.store(true, Ordering::SeqCst);
                let message = err.to_string();
                self.logger.error(
                    "node selector failed to compile; daemon set frozen",
                    &[("selector", raw), ("error", &message)],
                );
                self.alert(
                    "ds_selector_parse",
                    &[("selector", raw), ("error", &message)],
                );
            }
        }
    }

    fn subscribe(&self) -> Option<MatchWatch> {
        let selector = self.selector.clone()?;
        match self.applicator.watch_matches(LabelKind::Node, selector) {
            Ok(watch) => Some(watch),
            Err(err) => {
                self.logger.warn(
                    "could not open node label watch",
                    &[("error", &err.to_string())],
                );
                None
            }
        }
    }

    /// Rebuilds the owned-node set from pod rows already labeled with this
    /// daemon set's id, so a restarted farm resumes where it left off.
    async fn recover_owned(&self) {
        let ds = self.state.snapshot();
        let selector =
            LabelSelector::everything().and_equals(DS_ID_LABEL, ds.id.as_str());
        let Some(rows) = self
            .with_retries("list_owned_pod_rows", || {
                self.applicator.get_matches(LabelKind::Pod, &selector)
            })
            .await
        else {
            return;
        };

        let mut owned = self.state.owned.lock().expect("child owned lock poisoned");
        for row in rows {
            match split_pod_label_key(&row.id) {
                Some((node, pod_id)) if pod_id == ds.pod_id => {
                    owned.insert(node);
                }
                _ => {}
            }
        }
    }

    /// Applies a record update to the worker state and reports which
    /// follow-up the scheduling loop owes.
    fn apply_update(&mut self, new: DaemonSet) -> UpdateAction {
        let old = {
            let mut guard = self.state.ds.lock().expect("child ds lock poisoned");
            std::mem::replace(&mut *guard, new.clone())
        };

        // A record arriving enabled is the operator's word: contention-based
        // freezes lift until the next contention pass says otherwise.
        if !new.disabled {
            self.state.contended.store(false, Ordering::SeqCst);
        }

        let selector_changed = old.node_selector != new.node_selector;
        if selector_changed {
            self.compile_selector(&new.node_selector);
        }

        if self.state.is_disabled() {
            return if selector_changed {
                UpdateAction::Resubscribe { reconcile: false }
            } else {
                UpdateAction::None
            };
        }

        let resumed = old.disabled && !new.disabled;
        if selector_changed {
            UpdateAction::Resubscribe { reconcile: true }
        } else if resumed {
            UpdateAction::Reconcile
        } else if old.manifest != new.manifest {
            UpdateAction::RewriteIntent
        } else {
            UpdateAction::None
        }
    }

    async fn handle_label_event(&self, event: LabelEvent) {
        if self.state.is_disabled() {
            return;
        }
        let node = NodeName::new(event.entity.id);
        match event.kind {
            LabelEventKind::Added => self.schedule(&node).await,
            LabelEventKind::Removed => self.unschedule(&node).await,
        }
    }

    /// Diffs the selector's match set against the owned set: additions are
    /// scheduled, nodes that no longer match are unscheduled.
    async fn reconcile(&self) {
        let Some(selector) = self.selector.clone() else {
            return;
        };
        let Some(matches) = self
            .with_retries("list_node_matches", || {
                self.applicator.get_matches(LabelKind::Node, &selector)
            })
            .await
        else {
            return;
        };

        let desired: BTreeSet<NodeName> = matches
            .into_iter()
            .map(|entity| NodeName::new(entity.id))
            .collect();
        let owned = self.state.owned();

        for node in desired.difference(&owned) {
            self.schedule(node).await;
        }
        for node in owned.difference(&desired) {
            self.unschedule(node).await;
        }
    }

    /// Writes this daemon set's ownership label on the pod row, then the
    /// intent entry. The label write happens first so a crash between the two
    /// leaves an ownership claim rather than an orphaned manifest. A foreign
    /// ownership label is never overwritten.
    async fn schedule(&self, node: &NodeName) {
        let ds = self.state.snapshot();
        let pod_key = make_pod_label_key(node, &ds.pod_id);

        let Some(labeled) = self
            .with_retries("get_pod_row", || {
                self.applicator.get_labels(LabelKind::Pod, &pod_key)
            })
            .await
        else {
            return;
        };
        if let Some(owner) = labeled.labels.get(DS_ID_LABEL) {
            if owner != ds.id.as_str() {
                self.logger.warn(
                    "pod row already claimed by another daemon set; refusing to overwrite",
                    &[("pod", &pod_key), ("owner", owner)],
                );
                return;
            }
        }

        if self
            .with_retries("label_pod_row", || {
                self.applicator
                    .set_label(LabelKind::Pod, &pod_key, DS_ID_LABEL, ds.id.as_str())
            })
            .await
            .is_none()
        {
            return;
        }
        if self
            .with_retries("write_intent", || self.intent.set_pod(node, &ds.manifest))
            .await
            .is_none()
        {
            return;
        }

        self.state
            .owned
            .lock()
            .expect("child owned lock poisoned")
            .insert(node.clone());
        self.logger
            .info("scheduled pod", &[("node", node.as_str())]);
    }

    /// Removes the ownership label and intent entry for a node, provided the
    /// row is still ours.
    async fn unschedule(&self, node: &NodeName) {
        let ds = self.state.snapshot();
        let pod_key = make_pod_label_key(node, &ds.pod_id);

        let Some(labeled) = self
            .with_retries("get_pod_row", || {
                self.applicator.get_labels(LabelKind::Pod, &pod_key)
            })
            .await
        else {
            return;
        };

        match labeled.labels.get(DS_ID_LABEL) {
            Some(owner) if owner == ds.id.as_str() => {
                if self
                    .with_retries("unlabel_pod_row", || {
                        self.applicator.remove_label(LabelKind::Pod, &pod_key, DS_ID_LABEL)
                    })
                    .await
                    .is_none()
                {
                    return;
                }
                if self
                    .with_retries("delete_intent", || self.intent.delete_pod(node, &ds.pod_id))
                    .await
                    .is_none()
                {
                    return;
                }
                self.logger
                    .info("unscheduled pod", &[("node", node.as_str())]);
            }
            Some(owner) => {
                self.logger.warn(
                    "pod row claimed by another daemon set; leaving it in place",
                    &[("pod", &pod_key), ("owner", owner)],
                );
            }
            None => {}
        }

        self.state
            .owned
            .lock()
            .expect("child owned lock poisoned")
            .remove(node);
    }

    async fn unschedule_all(&self) {
        for node in self.state.owned() {
            self.unschedule(&node).await;
        }
    }

    /// Manifest-only change: the ownership labels stand, the intent entries
    /// are rewritten in place.
    async fn rewrite_intent(&self) {
        let ds = self.state.snapshot();
        for node in self.state.owned() {
            self.with_retries("rewrite_intent", || self.intent.set_pod(&node, &ds.manifest))
                .await;
        }
    }

    /// Retries a store operation with exponential backoff. Once the backoff
    /// would exceed the ceiling the failure is escalated to the alerter and
    /// the operation abandoned; the worker itself keeps running.
    async fn with_retries<T, E, F>(&self, operation: &str, mut attempt: F) -> Option<T>
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
        loop {
            match attempt() {
                Ok(value) => return Some(value),
                Err(err) => {
                    let message = err.to_string();
                    if backoff > Duration::from_millis(BACKOFF_MAX_MS) {
                        self.logger.error(
                            "store operation kept failing; giving up",
                            &[("operation", operation), ("error", &message)],
                        );
                        self.alert(
                            "ds_store_failure",
                            &[("operation", operation), ("error", &message)],
                        );
                        return None;
                    }
                    self.logger.warn(
                        "store operation failed; backing off",
                        &[("operation", operation), ("error", &message)],
                    );
                    tokio::select! {
                        _ = self.quit.cancelled() => return None,
                        _ = self.session.cancelled() => return None,
                        _ = sleep(backoff) => {}
                    }
                    backoff *= 2;
                }
            }
        }
    }

    fn alert(&self, kind: &str, details: &[(&str, &str)]) {
        if let Err(err) = self.alerter.alert(kind, details) {
            self.logger
                .warn("alert delivery failed", &[("error", &err.to_string())]);
        }
    }
}
