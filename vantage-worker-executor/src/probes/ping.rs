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

//! Reachability probe. Raw ICMP would need CAP_NET_RAW inside the worker;
//! TCP connects against 443 and 80 cover the same question for anything
//! that serves traffic.

use super::ssrf::is_internal_host;
use super::ProbeConfig;
use std::time::Duration;
use tokio::net::TcpStream;
use vantage_common::model::{MonitorSpec, ProbeOutcome};

const PING_PORTS: [u16; 2] = [443, 80];

pub struct PingProbe {
    config: ProbeConfig,
}

impl PingProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub async fn probe(&self, monitor: &MonitorSpec) -> ProbeOutcome {
        let host = strip_scheme(&monitor.target);

        if !self.config.allow_internal_targets && is_internal_host(host) {
            return ProbeOutcome::error(serde_json::json!({
                "errorMessage": "target resolves to an internal address",
            }));
        }

        let timeout = Duration::from_millis(monitor.timeout_ms());
        let started = tokio::time::Instant::now();

        for port in PING_PORTS {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            if let Ok(Ok(_)) =
                tokio::time::timeout(remaining, TcpStream::connect((host, port))).await
            {
                let elapsed = started.elapsed().as_millis() as u64;
                return ProbeOutcome::up(
                    Some(elapsed),
                    serde_json::json!({ "reachedPort": port, "method": "tcp" }),
                );
            }
        }

        let elapsed = started.elapsed().as_millis() as u64;
        if started.elapsed() >= timeout {
            ProbeOutcome::timeout(
                Some(elapsed),
                serde_json::json!({
                    "errorMessage": format!("no TCP response from {host} on ports 443/80"),
                }),
            )
        } else {
            ProbeOutcome::down(
                Some(elapsed),
                serde_json::json!({
                    "errorMessage": format!("{host} refused connections on ports 443/80"),
                }),
            )
        }
    }
}

fn strip_scheme(target: &str) -> &str {
    let without_scheme = target
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target);
    without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_scheme)
        .split(':')
        .next()
        .unwrap_or(without_scheme)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn scheme_and_path_are_stripped() {
        assert_eq!(strip_scheme("https://example.com/path?q=1"), "example.com");
        assert_eq!(strip_scheme("example.com:8443/x"), "example.com");
        assert_eq!(strip_scheme("example.com"), "example.com");
    }
}
