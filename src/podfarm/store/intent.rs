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

//! Per-node intended pod manifests under `intent/<node>/<podID>`: the
//! desired-state tree consumed by downstream pod execution. The farm writes
//! and deletes entries but never reads them for scheduling decisions.

use crate::podfarm::store::kv::{KvError, KvStore};
use crate::podfarm::types::{NodeName, PodId, PodManifest};
use std::error::Error;
use std::fmt::{self, Display, Formatter};

const INTENT_TREE: &str = "intent/";

#[derive(Debug)]
pub enum IntentError {
    Corrupt(serde_json::Error),
    Store(KvError),
}

impl Display for IntentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            IntentError::Corrupt(err) => write!(f, "corrupt intent entry: {}", err),
            IntentError::Store(err) => write!(f, "intent store unavailable: {}", err),
        }
    }
}

impl Error for IntentError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            IntentError::Corrupt(err) => Some(err),
            IntentError::Store(err) => Some(err),
        }
    }
}

impl From<KvError> for IntentError {
    fn from(err: KvError) -> Self {
        IntentError::Store(err)
    }
}

#[derive(Clone)]
pub struct IntentStore {
    kv: KvStore,
}

impl IntentStore {
    pub fn new(kv: KvStore) -> Self {
        IntentStore { kv }
    }

    /// Writes the manifest that should run on `node`, keyed by the manifest's
    /// own pod id. Overwrites any previous manifest for that pod.
    pub fn set_pod(&self, node: &NodeName, manifest: &PodManifest) -> Result<(), IntentError> {
        let raw = serde_json::to_string(manifest).map_err(IntentError::Corrupt)?;
        self.kv.put(&entry_key(node, &manifest.id), &raw)?;
        Ok(())
    }

    /// Reads the intended manifest for (node, pod), if any.
    pub fn pod(&self, node: &NodeName, pod_id: &PodId) -> Result<Option<PodManifest>, IntentError> {
        match self.kv.get(&entry_key(node, pod_id))? {
            Some((raw, _)) => {
                let manifest = serde_json::from_str(&raw).map_err(IntentError::Corrupt)?;
                Ok(Some(manifest))
            }
            None => Ok(None),
        }
    }

    /// Idempotent removal of the (node, pod) entry.
    pub fn delete_pod(&self, node: &NodeName, pod_id: &PodId) -> Result<(), IntentError> {
        self.kv.delete(&entry_key(node, pod_id))?;
        Ok(())
    }
}

fn entry_key(node: &NodeName, pod_id: &PodId) -> String {
    format!("{}{}/{}", INTENT_TREE, node, pod_id)
}
