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

use super::ssrf::is_internal_host;
use super::ProbeConfig;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use vantage_common::model::{MonitorSpec, PortProtocol, ProbeOutcome};

pub struct PortProbe {
    config: ProbeConfig,
}

impl PortProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub async fn probe(&self, monitor: &MonitorSpec) -> ProbeOutcome {
        let host = monitor.target.trim();
        if host.is_empty() {
            return ProbeOutcome::error(serde_json::json!({
                "errorMessage": "port monitor has no target host",
            }));
        }
        if !self.config.allow_internal_targets && is_internal_host(host) {
            return ProbeOutcome::error(serde_json::json!({
                "errorMessage": "target resolves to an internal address",
            }));
        }
        let Some(port) = monitor.port else {
            return ProbeOutcome::error(serde_json::json!({
                "errorMessage": "port monitor has no port configured",
            }));
        };
        if port == 0 {
            return ProbeOutcome::error(serde_json::json!({
                "errorMessage": "port 0 is not probeable",
            }));
        }

        let protocol = monitor.protocol.unwrap_or(PortProtocol::Tcp);
        let timeout = Duration::from_millis(monitor.timeout_ms());

        match protocol {
            PortProtocol::Tcp => self.probe_tcp(monitor, host, port, timeout).await,
            PortProtocol::Udp => self.probe_udp(host, port, timeout).await,
        }
    }

    async fn probe_tcp(
        &self,
        monitor: &MonitorSpec,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> ProbeOutcome {
        let started = tokio::time::Instant::now();
        let attempt = tokio::time::timeout(timeout, TcpStream::connect((host, port))).await;
        let elapsed = started.elapsed().as_millis() as u64;

        match attempt {
            // Timeout wins over the expect_closed inversion: an unanswered
            // SYN tells us nothing about the port being closed.
            Err(_) => ProbeOutcome::timeout(
                Some(elapsed),
                serde_json::json!({
                    "protocol": "tcp",
                    "port": port,
                    "errorMessage": format!("connection to {host}:{port} timed out"),
                }),
            ),
            Ok(Ok(_stream)) => {
                let details = serde_json::json!({ "protocol": "tcp", "port": port, "connected": true });
                if monitor.expect_closed {
                    ProbeOutcome::down(Some(elapsed), details)
                } else {
                    ProbeOutcome::up(Some(elapsed), details)
                }
            }
            Ok(Err(err)) => {
                let refused = err.kind() == std::io::ErrorKind::ConnectionRefused;
                let details = serde_json::json!({
                    "protocol": "tcp",
                    "port": port,
                    "connected": false,
                    "connectionRefused": refused,
                    "errorMessage": err.to_string(),
                });
                if monitor.expect_closed && refused {
                    ProbeOutcome::up(Some(elapsed), details)
                } else {
                    ProbeOutcome::down(Some(elapsed), details)
                }
            }
        }
    }

    async fn probe_udp(&self, host: &str, port: u16, timeout: Duration) -> ProbeOutcome {
        let started = tokio::time::Instant::now();

        let attempt = tokio::time::timeout(timeout, async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect((host, port)).await?;
            socket.send(b"\x00").await?;

            // A quick ICMP port-unreachable surfaces as a recv error on the
            // connected socket; silence is indistinguishable from delivery.
            let mut buffer = [0u8; 32];
            match tokio::time::timeout(Duration::from_millis(500), socket.recv(&mut buffer)).await
            {
                Ok(Ok(_)) | Err(_) => Ok::<bool, std::io::Error>(true),
                Ok(Err(err)) if err.kind() == std::io::ErrorKind::ConnectionRefused => Ok(false),
                Ok(Err(_)) => Ok(true),
            }
        })
        .await;

        let elapsed = started.elapsed().as_millis() as u64;
        let note = "UDP probing is inherently unreliable: lack of a response does not prove delivery";

        match attempt {
            Err(_) => ProbeOutcome::timeout(
                Some(elapsed),
                serde_json::json!({
                    "protocol": "udp",
                    "port": port,
                    "note": note,
                    "errorMessage": format!("UDP probe of {host}:{port} timed out"),
                }),
            ),
            Ok(Ok(reachable)) => {
                let details = serde_json::json!({
                    "protocol": "udp",
                    "port": port,
                    "reachable": reachable,
                    "note": note,
                });
                if reachable {
                    ProbeOutcome::up(Some(elapsed), details)
                } else {
                    ProbeOutcome::down(Some(elapsed), details)
                }
            }
            Ok(Err(err)) => ProbeOutcome::down(
                Some(elapsed),
                serde_json::json!({
                    "protocol": "udp",
                    "port": port,
                    "note": note,
                    "errorMessage": err.to_string(),
                }),
            ),
        }
    }
}
