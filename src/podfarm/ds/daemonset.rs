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

//! The daemon set record: a declarative request that a pod manifest run on
//! every node matching a selector.

use crate::podfarm::labels::selector::{LabelSelector, SelectorParseError};
use crate::podfarm::types::{ClusterName, DaemonSetId, PodId, PodManifest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reserved pod-row label key recording which daemon set owns the placement.
/// At most one value per row; a foreign value is never overwritten.
pub const DS_ID_LABEL: &str = "daemon_set_id";

/// Replication never times out.
pub const NO_TIMEOUT: Duration = Duration::ZERO;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DaemonSet {
    pub id: DaemonSetId,
    pub pod_id: PodId,
    pub manifest: PodManifest,
    pub min_health: u32,
    pub cluster_name: ClusterName,
    /// Raw selector expression over NODE labels; compiled on use.
    pub node_selector: String,
    pub timeout: Duration,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

impl DaemonSet {
    /// Compiles the node selector. Failure permanently disables the daemon
    /// set on the farm that observes it.
    pub fn selector(&self) -> Result<LabelSelector, SelectorParseError> {
        LabelSelector::parse(&self.node_selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(selector: &str) -> DaemonSet {
        DaemonSet {
            id: DaemonSetId::new(),
            pod_id: PodId::new("testPod"),
            manifest: PodManifest::new(PodId::new("testPod")),
            min_health: 0,
            cluster_name: ClusterName::new("some_name"),
            node_selector: selector.to_string(),
            timeout: NO_TIMEOUT,
            disabled: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn selector_compiles_from_the_stored_expression() {
        let ds = record("az=az1");
        let selector = ds.selector().expect("compile selector");
        let labels = [("az".to_string(), "az1".to_string())].into_iter().collect();
        assert!(selector.matches(&labels));
    }

    #[test]
    fn bad_selector_expression_fails_to_compile() {
        let ds = record("az ~~ az1");
        assert!(ds.selector().is_err());
    }

    #[test]
    fn record_round_trips_through_json() {
        let ds = record("az in (az1,az2)");
        let raw = serde_json::to_string(&ds).expect("serialize");
        let decoded: DaemonSet = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(ds, decoded);
    }
}
