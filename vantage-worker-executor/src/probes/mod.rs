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

pub mod http;
pub mod ping;
pub mod port;
pub mod sanitize;
pub mod ssl;
pub mod ssrf;
pub mod status;
pub mod synthetic;

use crate::probes::http::HttpProbe;
use crate::probes::ping::PingProbe;
use crate::probes::port::PortProbe;
use crate::probes::ssl::SslProbe;
use crate::probes::synthetic::SyntheticProbe;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use vantage_common::model::{LocationCode, MonitorKind, MonitorSpec, ProbeOutcome, ResultStatus};
use vantage_common::SafeDisplay;
use vantage_service_base::repo::monitor_result::MonitorResultRepo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Disables the SSRF address-range checks; for deployments probing
    /// their own private infrastructure.
    pub allow_internal_targets: bool,
    pub max_redirects: usize,
    pub max_response_mb: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            allow_internal_targets: false,
            max_redirects: 5,
            max_response_mb: 5,
        }
    }
}

impl SafeDisplay for ProbeConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "allow internal targets: {}, max redirects: {}, max response MB: {}",
            self.allow_internal_targets, self.max_redirects, self.max_response_mb
        )
    }
}

/// Dispatches a monitor check to the runner for its kind. Website monitors
/// compose the HTTP probe with a frequency-gated certificate probe.
pub struct MonitorProber {
    http: HttpProbe,
    ssl: SslProbe,
    ping: PingProbe,
    port: PortProbe,
    synthetic: SyntheticProbe,
    results: Arc<dyn MonitorResultRepo>,
}

impl MonitorProber {
    pub fn new(
        config: ProbeConfig,
        synthetic: SyntheticProbe,
        results: Arc<dyn MonitorResultRepo>,
    ) -> Self {
        Self {
            http: HttpProbe::new(config.clone()),
            ssl: SslProbe,
            ping: PingProbe::new(config.clone()),
            port: PortProbe::new(config),
            synthetic,
            results,
        }
    }

    pub async fn run(
        &self,
        monitor: &MonitorSpec,
        location: LocationCode,
        organization_id: &Uuid,
    ) -> ProbeOutcome {
        match monitor.kind {
            MonitorKind::Http => self.http.probe(monitor).await,
            MonitorKind::Website => self.probe_website(monitor, location).await,
            MonitorKind::Ping => self.ping.probe(monitor).await,
            MonitorKind::Port => self.port.probe(monitor).await,
            MonitorKind::Ssl => self.ssl.probe(monitor).await,
            MonitorKind::Synthetic => self.synthetic.probe(monitor, organization_id).await,
        }
    }

    async fn probe_website(&self, monitor: &MonitorSpec, location: LocationCode) -> ProbeOutcome {
        let mut outcome = self.http.probe(monitor).await;

        if !monitor.enable_ssl_check || !monitor.target.starts_with("https://") {
            return outcome;
        }
        let last_days_remaining = self.last_known_days_remaining(monitor, location).await;
        if !SslProbe::should_check(monitor, last_days_remaining, Utc::now()) {
            debug!(monitor = %monitor.id, "Skipping SSL sub-probe (checked recently)");
            return outcome;
        }

        let ssl_outcome = self.ssl.probe(monitor).await;

        if let Some(certificate) = ssl_outcome.details.get("sslCertificate") {
            outcome.details["sslCertificate"] = certificate.clone();
        }
        if let Some(warning) = ssl_outcome.details.get("warningMessage") {
            outcome.details["warningMessage"] = warning.clone();
        }
        // An expired certificate takes the whole website monitor down even
        // when the HTTP exchange still succeeds.
        if ssl_outcome.status == ResultStatus::Down {
            if let Some(message) = ssl_outcome.details.get("errorMessage") {
                outcome.details["errorMessage"] = message.clone();
            }
            outcome.status = ResultStatus::Down;
            outcome.is_up = false;
        }

        outcome
    }

    async fn last_known_days_remaining(
        &self,
        monitor: &MonitorSpec,
        location: LocationCode,
    ) -> Option<i64> {
        let row = self
            .results
            .latest_for_location(&monitor.id, location)
            .await
            .ok()??;
        let details: serde_json::Value = serde_json::from_str(&row.details).ok()?;
        details
            .get("sslCertificate")
            .and_then(|certificate| certificate.get("daysRemaining"))
            .and_then(|days| days.as_i64())
    }
}
