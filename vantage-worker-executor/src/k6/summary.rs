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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// k6 exits with 99 when a declared threshold fails; its canonical signal.
pub const K6_EXIT_THRESHOLD_FAILURE: i32 = 99;

/// Parsed `--summary-export` document. Only the parts the verdict and the
/// headline metrics need are typed; everything else stays as raw values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct K6Summary {
    #[serde(default)]
    pub metrics: HashMap<String, K6Metric>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct K6Metric {
    #[serde(default)]
    pub thresholds: HashMap<String, ThresholdOutcome>,
    #[serde(flatten)]
    pub values: HashMap<String, serde_json::Value>,
}

impl K6Metric {
    pub fn value(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(|value| value.as_f64())
    }
}

/// Threshold entries appear either as a bare boolean (legacy export) or as
/// an object with an `ok` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdOutcome {
    Flag(bool),
    Detailed { ok: bool },
}

impl ThresholdOutcome {
    pub fn passed(&self) -> bool {
        match self {
            ThresholdOutcome::Flag(ok) => *ok,
            ThresholdOutcome::Detailed { ok } => *ok,
        }
    }
}

impl K6Summary {
    pub fn parse(raw: &str) -> Result<K6Summary, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn has_metrics(&self) -> bool {
        !self.metrics.is_empty()
    }

    pub fn any_threshold_failed(&self) -> bool {
        self.metrics.values().any(|metric| {
            metric
                .thresholds
                .values()
                .any(|outcome| !outcome.passed())
        })
    }

    pub fn check_failures(&self) -> u64 {
        self.metrics
            .get("checks")
            .and_then(|checks| checks.value("fails"))
            .map(|fails| fails as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct K6Verdict {
    pub thresholds_passed: bool,
    pub passed: bool,
}

/// Authoritative pass/fail decision, in priority order: outer timeout, the
/// exit-99 threshold signal, exit-code fallback when no metrics were
/// exported, the per-metric threshold scan, and finally failed checks.
pub fn compute_verdict(
    timed_out: bool,
    exit_code: Option<i32>,
    summary: Option<&K6Summary>,
) -> K6Verdict {
    if timed_out {
        return K6Verdict {
            thresholds_passed: false,
            passed: false,
        };
    }

    if exit_code == Some(K6_EXIT_THRESHOLD_FAILURE) {
        return K6Verdict {
            thresholds_passed: false,
            passed: false,
        };
    }

    let exit_ok = exit_code == Some(0);

    let Some(summary) = summary.filter(|summary| summary.has_metrics()) else {
        return K6Verdict {
            thresholds_passed: exit_ok,
            passed: exit_ok,
        };
    };

    if summary.any_threshold_failed() {
        return K6Verdict {
            thresholds_passed: false,
            passed: false,
        };
    }

    if summary.check_failures() > 0 {
        return K6Verdict {
            thresholds_passed: true,
            passed: false,
        };
    }

    K6Verdict {
        thresholds_passed: true,
        passed: exit_ok,
    }
}

/// The numbers surfaced on run reports and the derived performance rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K6HeadlineMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    /// Requests/second scaled by 100 so it survives integer columns.
    pub request_rate_x100: u64,
    pub avg_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub p99_response_time_ms: f64,
    pub max_vus: u64,
}

pub fn extract_headline_metrics(summary: &K6Summary) -> K6HeadlineMetrics {
    let http_reqs = summary.metrics.get("http_reqs");
    let duration = summary.metrics.get("http_req_duration");
    // http_req_failed is a rate metric; its "passes" are requests for which
    // the failure predicate held.
    let failed = summary.metrics.get("http_req_failed");
    let vus_max = summary.metrics.get("vus_max");

    K6HeadlineMetrics {
        total_requests: http_reqs
            .and_then(|m| m.value("count"))
            .unwrap_or(0.0) as u64,
        failed_requests: failed
            .and_then(|m| m.value("passes").or_else(|| m.value("fails")))
            .unwrap_or(0.0) as u64,
        request_rate_x100: http_reqs
            .and_then(|m| m.value("rate"))
            .map(|rate| (rate * 100.0).round() as u64)
            .unwrap_or(0),
        avg_response_time_ms: duration.and_then(|m| m.value("avg")).unwrap_or(0.0),
        p95_response_time_ms: duration.and_then(|m| m.value("p(95)")).unwrap_or(0.0),
        p99_response_time_ms: duration.and_then(|m| m.value("p(99)")).unwrap_or(0.0),
        max_vus: vus_max
            .and_then(|m| m.value("value").or_else(|| m.value("max")))
            .unwrap_or(0.0) as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn summary_with_threshold(ok: bool) -> K6Summary {
        K6Summary::parse(&format!(
            r#"{{
              "metrics": {{
                "http_req_duration": {{
                  "avg": 120.5, "p(95)": 480.0, "p(99)": 890.0,
                  "thresholds": {{ "p(95)<500": {{ "ok": {ok} }} }}
                }},
                "http_reqs": {{ "count": 1000, "rate": 33.4 }},
                "checks": {{ "passes": 10, "fails": 0 }}
              }}
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn timeout_dominates_everything() {
        let summary = summary_with_threshold(true);
        let verdict = compute_verdict(true, Some(0), Some(&summary));
        assert!(!verdict.passed);
        assert!(!verdict.thresholds_passed);
    }

    #[test]
    fn exit_99_signals_threshold_failure() {
        let verdict = compute_verdict(false, Some(99), None);
        assert!(!verdict.thresholds_passed);
        assert!(!verdict.passed);
    }

    #[test]
    fn missing_summary_falls_back_to_exit_code() {
        let verdict = compute_verdict(false, Some(0), None);
        assert!(verdict.passed);
        let verdict = compute_verdict(false, Some(1), None);
        assert!(!verdict.passed);

        let empty = K6Summary::default();
        let verdict = compute_verdict(false, Some(0), Some(&empty));
        assert!(verdict.passed);
    }

    #[test]
    fn threshold_scan_fails_on_any_not_ok() {
        let verdict = compute_verdict(false, Some(0), Some(&summary_with_threshold(false)));
        assert!(!verdict.thresholds_passed);
        assert!(!verdict.passed);

        let verdict = compute_verdict(false, Some(0), Some(&summary_with_threshold(true)));
        assert!(verdict.thresholds_passed);
        assert!(verdict.passed);
    }

    #[test]
    fn failed_checks_fail_the_run_even_with_passing_thresholds() {
        let summary = K6Summary::parse(
            r#"{
              "metrics": {
                "http_req_duration": {
                  "avg": 10.0,
                  "thresholds": { "p(95)<500": true }
                },
                "checks": { "passes": 8, "fails": 2 }
              }
            }"#,
        )
        .unwrap();
        let verdict = compute_verdict(false, Some(0), Some(&summary));
        assert!(verdict.thresholds_passed);
        assert!(!verdict.passed);
    }

    #[test]
    fn legacy_boolean_thresholds_parse() {
        let summary = K6Summary::parse(
            r#"{ "metrics": { "iteration_duration": { "thresholds": { "p(95)<1000": false } } } }"#,
        )
        .unwrap();
        assert!(summary.any_threshold_failed());
    }

    #[test]
    fn headline_metrics_are_extracted() {
        let summary = K6Summary::parse(
            r#"{
              "metrics": {
                "http_reqs": { "count": 1500, "rate": 25.5 },
                "http_req_failed": { "value": 0.02, "passes": 30, "fails": 1470 },
                "http_req_duration": { "avg": 112.3, "p(95)": 450.1, "p(99)": 712.9 },
                "vus_max": { "value": 50, "min": 50, "max": 50 }
              }
            }"#,
        )
        .unwrap();
        let headline = extract_headline_metrics(&summary);
        assert_eq!(headline.total_requests, 1500);
        assert_eq!(headline.failed_requests, 30);
        assert_eq!(headline.request_rate_x100, 2550);
        assert_eq!(headline.avg_response_time_ms, 112.3);
        assert_eq!(headline.p95_response_time_ms, 450.1);
        assert_eq!(headline.p99_response_time_ms, 712.9);
        assert_eq!(headline.max_vus, 50);
    }
}
