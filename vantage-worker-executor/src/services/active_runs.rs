// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::Mutex;
use vantage_common::model::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Monitor,
    Playwright,
    K6,
}

#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub kind: RunKind,
    pub container_name: Option<String>,
    pub dashboard_port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
#[error("worker already executes a k6 run; per-process k6 concurrency is 1")]
pub struct K6CapacityExhausted;

/// Registry of every in-flight execution, keyed by run id. Cancellation
/// resolves container names through it, and it enforces the hard
/// one-k6-run-per-process cap (scaling k6 is done with worker replicas, not
/// in-process parallelism).
#[derive(Default)]
pub struct ActiveRunRegistry {
    runs: Mutex<HashMap<RunId, ActiveRun>>,
}

impl ActiveRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: RunId, kind: RunKind) -> Result<(), K6CapacityExhausted> {
        let mut runs = self.runs.lock().unwrap();
        if kind == RunKind::K6 && runs.values().any(|run| run.kind == RunKind::K6) {
            return Err(K6CapacityExhausted);
        }
        runs.insert(
            run_id,
            ActiveRun {
                kind,
                container_name: None,
                dashboard_port: None,
            },
        );
        Ok(())
    }

    pub fn attach_container(&self, run_id: &RunId, container_name: &str) {
        if let Some(run) = self.runs.lock().unwrap().get_mut(run_id) {
            run.container_name = Some(container_name.to_string());
        }
    }

    pub fn attach_dashboard_port(&self, run_id: &RunId, port: u16) {
        if let Some(run) = self.runs.lock().unwrap().get_mut(run_id) {
            run.dashboard_port = Some(port);
        }
    }

    pub fn detach_container(&self, run_id: &RunId) {
        if let Some(run) = self.runs.lock().unwrap().get_mut(run_id) {
            run.container_name = None;
        }
    }

    pub fn get(&self, run_id: &RunId) -> Option<ActiveRun> {
        self.runs.lock().unwrap().get(run_id).cloned()
    }

    pub fn deregister(&self, run_id: &RunId) -> Option<ActiveRun> {
        self.runs.lock().unwrap().remove(run_id)
    }

    pub fn active_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn k6_concurrency_is_capped_at_one() {
        let registry = ActiveRunRegistry::new();
        let first = RunId::new_v4();
        let second = RunId::new_v4();

        registry.register(first, RunKind::K6).unwrap();
        assert!(registry.register(second, RunKind::K6).is_err());

        // Other kinds are unaffected by the k6 cap.
        registry.register(second, RunKind::Monitor).unwrap();

        registry.deregister(&first);
        registry.register(RunId::new_v4(), RunKind::K6).unwrap();
    }

    #[test]
    fn container_names_resolve_for_cancellation() {
        let registry = ActiveRunRegistry::new();
        let run_id = RunId::new_v4();
        registry.register(run_id, RunKind::K6).unwrap();
        registry.attach_container(&run_id, "exec-abc");
        registry.attach_dashboard_port(&run_id, 5665);

        let run = registry.get(&run_id).unwrap();
        assert_eq!(run.container_name.as_deref(), Some("exec-abc"));
        assert_eq!(run.dashboard_port, Some(5665));

        assert!(registry.deregister(&run_id).is_some());
        assert!(registry.get(&run_id).is_none());
    }
}
