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

use super::sanitize::sanitize_body_snippet;
use super::ssrf::validate_target_url;
use super::status::is_expected_status;
use super::ProbeConfig;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use vantage_common::model::{MonitorSpec, ProbeOutcome};

pub struct HttpProbe {
    config: ProbeConfig,
}

impl HttpProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub async fn probe(&self, monitor: &MonitorSpec) -> ProbeOutcome {
        let url = match validate_target_url(&monitor.target, self.config.allow_internal_targets) {
            Ok(url) => url,
            Err(err) => {
                return ProbeOutcome::error(serde_json::json!({
                    "errorMessage": err.to_string(),
                }))
            }
        };

        let timeout = Duration::from_millis(monitor.timeout_ms());
        let client = match reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(
                self.config.max_redirects,
            ))
            .timeout(timeout)
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                return ProbeOutcome::error(serde_json::json!({
                    "errorMessage": format!("failed to build HTTP client: {err}"),
                }))
            }
        };

        let method = monitor
            .method
            .as_deref()
            .and_then(|raw| reqwest::Method::from_str(&raw.to_ascii_uppercase()).ok())
            .unwrap_or(reqwest::Method::GET);

        let mut request = client.request(method, url);
        for (name, value) in &monitor.request_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(auth) = &monitor.auth {
            request = request.basic_auth(&auth.username, Some(auth.password.reveal()));
        }
        if let Some(body) = &monitor.request_body {
            request = request.body(body.clone());
        }

        let started = tokio::time::Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                let elapsed = started.elapsed().as_millis() as u64;
                let details = serde_json::json!({ "errorMessage": err.to_string() });
                return if err.is_timeout() {
                    ProbeOutcome::timeout(Some(elapsed), details)
                } else {
                    ProbeOutcome::down(Some(elapsed), details)
                };
            }
        };

        let status = response.status().as_u16();
        let (body, truncated) = self.read_body_capped(response).await;
        let elapsed = started.elapsed().as_millis() as u64;

        let status_ok = is_expected_status(status, monitor.expected_status_codes.as_deref());

        let keyword_check = monitor.keyword_in_body.as_ref().map(|keyword| {
            let found = body.to_lowercase().contains(&keyword.to_lowercase());
            (found, found == monitor.keyword_in_body_should_be_present)
        });
        let keyword_ok = keyword_check.map(|(_, ok)| ok).unwrap_or(true);

        let is_up = status_ok && keyword_ok;
        debug!(
            monitor = %monitor.id,
            status,
            status_ok,
            keyword_ok,
            elapsed_ms = elapsed,
            "HTTP probe finished"
        );

        let mut details = serde_json::json!({
            "statusCode": status,
            "responseSizeBytes": body.len(),
        });
        if truncated {
            details["responseTruncated"] = serde_json::Value::Bool(true);
        }
        if let Some(spec) = &monitor.expected_status_codes {
            details["expectedStatusCodes"] = serde_json::Value::String(spec.clone());
        }
        if let Some((found, _)) = keyword_check {
            details["keywordFound"] = serde_json::Value::Bool(found);
        }
        if !is_up {
            if !status_ok {
                details["errorMessage"] =
                    serde_json::Value::String(format!("unexpected status code {status}"));
            } else {
                details["errorMessage"] = serde_json::Value::String(
                    if monitor.keyword_in_body_should_be_present {
                        "expected keyword not found in response body".to_string()
                    } else {
                        "forbidden keyword present in response body".to_string()
                    },
                );
            }
            if !body.is_empty() {
                details["bodySnippet"] =
                    serde_json::Value::String(sanitize_body_snippet(&body));
            }
        }

        if is_up {
            ProbeOutcome::up(Some(elapsed), details)
        } else {
            ProbeOutcome::down(Some(elapsed), details)
        }
    }

    /// Reads at most `max_response_mb`; the remainder of oversized bodies is
    /// discarded without failing the probe.
    async fn read_body_capped(&self, mut response: reqwest::Response) -> (String, bool) {
        let cap = (self.config.max_response_mb as usize) * 1024 * 1024;
        let mut collected: Vec<u8> = Vec::new();
        let mut truncated = false;

        while let Ok(Some(chunk)) = response.chunk().await {
            if collected.len() + chunk.len() > cap {
                collected.extend_from_slice(&chunk[..cap - collected.len()]);
                truncated = true;
                break;
            }
            collected.extend_from_slice(&chunk);
        }

        (String::from_utf8_lossy(&collected).into_owned(), truncated)
    }
}
