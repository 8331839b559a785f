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

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;
use vantage_common::model::{MonitorSpec, ProbeOutcome, RunId};
use vantage_service_base::clients::playwright::{PlaywrightClient, PlaywrightExecutionRequest};
use vantage_service_base::repo::synthetic_test::SyntheticTestRepo;

/// A synthetic monitor's check action is the execution of a Playwright test
/// by the external driver. The driver's reported execution time is the
/// monitor's response time.
pub struct SyntheticProbe {
    tests: Arc<dyn SyntheticTestRepo>,
    playwright: Arc<dyn PlaywrightClient>,
}

impl SyntheticProbe {
    pub fn new(tests: Arc<dyn SyntheticTestRepo>, playwright: Arc<dyn PlaywrightClient>) -> Self {
        Self { tests, playwright }
    }

    pub async fn probe(&self, monitor: &MonitorSpec, organization_id: &Uuid) -> ProbeOutcome {
        let Some(test_id) = monitor.synthetic_test_id else {
            return ProbeOutcome::error(serde_json::json!({
                "errorMessage": "synthetic monitor has no test configured",
            }));
        };

        let record = match self.tests.get(&test_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return ProbeOutcome::error(serde_json::json!({
                    "errorMessage": format!("synthetic test {test_id} not found"),
                }))
            }
            Err(err) => {
                return ProbeOutcome::error(serde_json::json!({
                    "errorMessage": format!("failed to load synthetic test: {err}"),
                }))
            }
        };

        let script = match BASE64
            .decode(record.script.as_bytes())
            .map_err(|err| err.to_string())
            .and_then(|bytes| String::from_utf8(bytes).map_err(|err| err.to_string()))
        {
            Ok(script) => script,
            Err(err) => {
                return ProbeOutcome::error(serde_json::json!({
                    "errorMessage": format!("synthetic test body is not valid base64: {err}"),
                }))
            }
        };

        let request = PlaywrightExecutionRequest {
            run_id: RunId::new_v4(),
            test_name: record.name.clone(),
            script,
            variables: HashMap::new(),
            secrets: HashMap::new(),
            bypass_concurrency_check: true,
            unique_execution_id: true,
        };

        match self.playwright.execute_test(request).await {
            Ok(result) => {
                if let Err(err) = self
                    .playwright
                    .record_usage(organization_id, result.duration_ms)
                    .await
                {
                    warn!(error = %err, "Synthetic usage metering failed");
                }

                let mut details = serde_json::json!({
                    "testId": test_id,
                    "testName": record.name,
                });
                if let Some(report_url) = &result.report_url {
                    details["reportUrl"] = serde_json::Value::String(report_url.clone());
                }

                if result.success {
                    ProbeOutcome::up(Some(result.duration_ms), details)
                } else {
                    if let Some(error) = &result.error {
                        details["errorMessage"] = serde_json::Value::String(error.clone());
                    }
                    ProbeOutcome::down(Some(result.duration_ms), details)
                }
            }
            Err(err) => ProbeOutcome::error(serde_json::json!({
                "testId": test_id,
                "errorMessage": err.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;
    use vantage_service_base::clients::playwright::{
        InMemoryPlaywrightClient, PlaywrightExecutionResult,
    };
    use vantage_service_base::repo::synthetic_test::{
        InMemorySyntheticTestRepo, SyntheticTestRecord,
    };

    fn monitor(test_id: Option<Uuid>) -> MonitorSpec {
        let mut spec: MonitorSpec = serde_json::from_value(serde_json::json!({
            "id": "9f0c64a2-9e8b-4ab7-b35b-fb98bd23847e",
            "name": "login flow",
            "target": "synthetic",
            "kind": "synthetic",
            "status": "pending"
        }))
        .unwrap();
        spec.synthetic_test_id = test_id;
        spec
    }

    #[test]
    async fn successful_execution_maps_to_up_and_meters_usage() {
        let tests = Arc::new(InMemorySyntheticTestRepo::new());
        let test_id = Uuid::new_v4();
        tests.insert(SyntheticTestRecord {
            test_id,
            name: "login".to_string(),
            script: BASE64.encode("await page.goto('https://example.com')"),
        });

        let playwright = Arc::new(InMemoryPlaywrightClient::new());
        playwright.enqueue_result(Ok(PlaywrightExecutionResult {
            success: true,
            duration_ms: 4321,
            report_url: Some("https://reports/1".to_string()),
            error: None,
        }));

        let probe = SyntheticProbe::new(tests, playwright.clone());
        let organization_id = Uuid::new_v4();
        let outcome = probe.probe(&monitor(Some(test_id)), &organization_id).await;

        assert!(outcome.is_up);
        assert_eq!(outcome.response_time_ms, Some(4321));

        let executed = playwright.executed();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].bypass_concurrency_check);
        assert!(executed[0].unique_execution_id);
        assert!(executed[0].script.contains("page.goto"));

        assert_eq!(playwright.recorded_usage(), vec![(organization_id, 4321)]);
    }

    #[test]
    async fn failed_execution_maps_to_down() {
        let tests = Arc::new(InMemorySyntheticTestRepo::new());
        let test_id = Uuid::new_v4();
        tests.insert(SyntheticTestRecord {
            test_id,
            name: "login".to_string(),
            script: BASE64.encode("x"),
        });

        let playwright = Arc::new(InMemoryPlaywrightClient::new());
        playwright.enqueue_result(Ok(PlaywrightExecutionResult {
            success: false,
            duration_ms: 900,
            report_url: None,
            error: Some("locator timed out".to_string()),
        }));

        let probe = SyntheticProbe::new(tests, playwright);
        let outcome = probe.probe(&monitor(Some(test_id)), &Uuid::new_v4()).await;
        assert!(!outcome.is_up);
        assert_eq!(
            outcome.details["errorMessage"].as_str().unwrap(),
            "locator timed out"
        );
    }

    #[test]
    async fn missing_test_reference_is_an_error() {
        let probe = SyntheticProbe::new(
            Arc::new(InMemorySyntheticTestRepo::new()),
            Arc::new(InMemoryPlaywrightClient::new()),
        );
        let outcome = probe.probe(&monitor(None), &Uuid::new_v4()).await;
        assert_eq!(outcome.status.to_string(), "error");

        let outcome = probe
            .probe(&monitor(Some(Uuid::new_v4())), &Uuid::new_v4())
            .await;
        assert_eq!(outcome.status.to_string(), "error");
        assert!(outcome.details["errorMessage"]
            .as_str()
            .unwrap()
            .contains("not found"));
    }
}
