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

//! Certificate probe. The TLS handshake accepts any certificate so that an
//! expired or mis-issued one can still be inspected; the chain verdict a
//! strict verifier would have produced is recorded alongside.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;
use vantage_common::model::{MonitorSpec, ProbeOutcome};
use x509_certificate::X509Certificate;

pub const DEFAULT_SSL_PORT: u16 = 443;

/// Everything surfaced under `details.sslCertificate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SslCertificateDetails {
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub days_remaining: i64,
    pub issuer_cn: Option<String>,
    pub subject_cn: Option<String>,
    pub serial_number: String,
    pub fingerprint_sha256: String,
    pub subject_alt_names: Vec<String>,
    pub authorized: bool,
    pub authorization_error: Option<String>,
}

pub struct SslProbe;

impl SslProbe {
    /// Smart re-check frequency: the closer the expiry, the tighter the
    /// band. `last_days_remaining` comes from the previous stored result;
    /// with no history the probe always runs.
    pub fn should_check(
        monitor: &MonitorSpec,
        last_days_remaining: Option<i64>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last_check) = monitor.last_ssl_check_at else {
            return true;
        };
        let Some(days) = last_days_remaining else {
            return true;
        };

        let interval = if days <= monitor.ssl_warning_threshold_days {
            ChronoDuration::hours(1)
        } else if days <= monitor.ssl_warning_threshold_days * 2 {
            ChronoDuration::hours(6)
        } else {
            ChronoDuration::seconds(monitor.ssl_check_frequency_seconds as i64)
        };

        now - last_check >= interval
    }

    pub async fn probe(&self, monitor: &MonitorSpec) -> ProbeOutcome {
        let (host, port) = match Self::host_and_port(&monitor.target) {
            Ok(pair) => pair,
            Err(message) => {
                return ProbeOutcome::error(serde_json::json!({ "errorMessage": message }))
            }
        };

        let started = tokio::time::Instant::now();
        let timeout = Duration::from_millis(monitor.timeout_ms());

        let result = tokio::time::timeout(timeout, Self::fetch_certificate(&host, port)).await;
        let elapsed = started.elapsed().as_millis() as u64;

        match result {
            Err(_) => ProbeOutcome::timeout(
                Some(elapsed),
                serde_json::json!({ "errorMessage": format!("TLS handshake to {host}:{port} timed out") }),
            ),
            Ok(Err(message)) => ProbeOutcome::down(
                Some(elapsed),
                serde_json::json!({ "errorMessage": message }),
            ),
            Ok(Ok(certificate)) => Self::evaluate(monitor, certificate, elapsed),
        }
    }

    fn evaluate(
        monitor: &MonitorSpec,
        certificate: SslCertificateDetails,
        elapsed_ms: u64,
    ) -> ProbeOutcome {
        let now = Utc::now();
        let mut details = serde_json::json!({ "sslCertificate": &certificate });

        if now < certificate.valid_from {
            details["errorMessage"] =
                serde_json::Value::String("certificate is not yet valid".to_string());
            return ProbeOutcome::error(details);
        }
        if now > certificate.valid_to {
            details["errorMessage"] =
                serde_json::Value::String("certificate has expired".to_string());
            return ProbeOutcome::down(Some(elapsed_ms), details);
        }
        if certificate.days_remaining <= monitor.ssl_warning_threshold_days {
            details["warningMessage"] = serde_json::Value::String(format!(
                "certificate expires in {} days",
                certificate.days_remaining
            ));
        }

        ProbeOutcome::up(Some(elapsed_ms), details)
    }

    fn host_and_port(target: &str) -> Result<(String, u16), String> {
        let url = if target.contains("://") {
            Url::parse(target)
        } else {
            Url::parse(&format!("https://{target}"))
        }
        .map_err(|err| format!("invalid target: {err}"))?;

        let host = url
            .host_str()
            .ok_or_else(|| "target has no host".to_string())?
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_SSL_PORT);
        Ok((host, port))
    }

    async fn fetch_certificate(host: &str, port: u16) -> Result<SslCertificateDetails, String> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|err| format!("connection to {host}:{port} failed: {err}"))?;

        let verifier = Arc::new(RecordingVerifier::new()?);
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_no_client_auth();

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|err| format!("invalid server name {host}: {err}"))?;

        let connector = TlsConnector::from(Arc::new(config));
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|err| format!("TLS handshake failed: {err}"))?;

        let (_, connection) = stream.get_ref();
        let peer_certificates = connection
            .peer_certificates()
            .ok_or_else(|| "server presented no certificate".to_string())?;
        let end_entity = peer_certificates
            .first()
            .ok_or_else(|| "server presented an empty chain".to_string())?;

        let (authorized, authorization_error) = verifier.verdict();
        Self::parse_certificate(end_entity.as_ref(), authorized, authorization_error)
    }

    fn parse_certificate(
        der: &[u8],
        authorized: bool,
        authorization_error: Option<String>,
    ) -> Result<SslCertificateDetails, String> {
        let certificate = X509Certificate::from_der(der)
            .map_err(|err| format!("unparseable certificate: {err}"))?;

        let valid_from = certificate.validity_not_before();
        let valid_to = certificate.validity_not_after();
        let now = Utc::now();
        let days_remaining = ((valid_to - now).num_seconds() as f64 / 86_400.0).ceil() as i64;

        let fingerprint = {
            let digest = Sha256::digest(der);
            digest
                .iter()
                .map(|byte| format!("{byte:02X}"))
                .collect::<Vec<_>>()
                .join(":")
        };

        debug!(
            subject = ?certificate.subject_common_name(),
            days_remaining,
            "Parsed server certificate"
        );

        Ok(SslCertificateDetails {
            valid_from,
            valid_to,
            days_remaining,
            issuer_cn: certificate.issuer_common_name(),
            subject_cn: certificate.subject_common_name(),
            serial_number: hex::encode(
                certificate
                    .as_ref()
                    .tbs_certificate
                    .serial_number
                    .as_slice(),
            ),
            fingerprint_sha256: fingerprint,
            subject_alt_names: san_dns_names(&certificate),
            authorized,
            authorization_error,
        })
    }
}

// OID 2.5.29.17 (subjectAltName) in DER-encoded form.
const SAN_OID: &[u8] = &[85, 29, 17];

/// DNS entries of the subjectAltName extension. GeneralNames encodes
/// dNSName with context tag 0x82 followed by a short-form length; names
/// longer than 127 bytes do not occur in practice.
fn san_dns_names(certificate: &X509Certificate) -> Vec<String> {
    let mut names = Vec::new();
    let tbs = &certificate.as_ref().tbs_certificate;
    let Some(extensions) = &tbs.extensions else {
        return names;
    };

    for extension in extensions.iter() {
        if extension.id.as_ref() != SAN_OID {
            continue;
        }
        let payload = extension.value.to_bytes();
        let bytes = payload.as_ref();
        let mut i = 0;
        while i + 1 < bytes.len() {
            if bytes[i] == 0x82 {
                let len = bytes[i + 1] as usize;
                if len < 0x80 && i + 2 + len <= bytes.len() {
                    if let Ok(name) = std::str::from_utf8(&bytes[i + 2..i + 2 + len]) {
                        names.push(name.to_string());
                    }
                    i += 2 + len;
                    continue;
                }
            }
            i += 1;
        }
    }
    names
}

/// Accepts every certificate while remembering what a strict WebPKI
/// verifier would have said.
#[derive(Debug)]
struct RecordingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    outcome: Mutex<Option<Result<(), String>>>,
}

impl RecordingVerifier {
    fn new() -> Result<Self, String> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|err| format!("failed to build certificate verifier: {err}"))?;
        Ok(Self {
            inner,
            outcome: Mutex::new(None),
        })
    }

    fn verdict(&self) -> (bool, Option<String>) {
        match self.outcome.lock().unwrap().clone() {
            Some(Ok(())) => (true, None),
            Some(Err(error)) => (false, Some(error)),
            None => (false, Some("verification was not performed".to_string())),
        }
    }
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let result = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );
        *self.outcome.lock().unwrap() = Some(match &result {
            Ok(_) => Ok(()),
            Err(err) => Err(err.to_string()),
        });
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;
    use vantage_common::model::{MonitorKind, MonitorStatus};

    fn monitor(warning_days: i64, last_check: Option<DateTime<Utc>>) -> MonitorSpec {
        let mut spec: MonitorSpec = serde_json::from_value(serde_json::json!({
            "id": "9f0c64a2-9e8b-4ab7-b35b-fb98bd23847e",
            "name": "cert watch",
            "target": "https://example.com",
            "kind": "ssl",
            "status": "up"
        }))
        .unwrap();
        spec.ssl_warning_threshold_days = warning_days;
        spec.last_ssl_check_at = last_check;
        assert_eq!(spec.kind, MonitorKind::Ssl);
        assert_eq!(spec.status, MonitorStatus::Up);
        spec
    }

    fn certificate(days_remaining: i64) -> SslCertificateDetails {
        let now = Utc::now();
        SslCertificateDetails {
            valid_from: now - ChronoDuration::days(30),
            valid_to: now + ChronoDuration::days(days_remaining),
            days_remaining,
            issuer_cn: Some("Test CA".to_string()),
            subject_cn: Some("example.com".to_string()),
            serial_number: "0102".to_string(),
            fingerprint_sha256: "AA:BB".to_string(),
            subject_alt_names: vec!["example.com".to_string()],
            authorized: true,
            authorization_error: None,
        }
    }

    #[test]
    fn within_warning_threshold_is_up_with_warning() {
        let outcome = SslProbe::evaluate(&monitor(30, None), certificate(10), 42);
        assert!(outcome.is_up);
        let warning = outcome.details["warningMessage"].as_str().unwrap();
        assert!(warning.contains("10 days"));
        assert_eq!(
            outcome.details["sslCertificate"]["daysRemaining"]
                .as_i64()
                .unwrap(),
            10
        );
    }

    #[test]
    fn expired_certificate_is_down() {
        let mut cert = certificate(0);
        cert.valid_to = Utc::now() - ChronoDuration::days(2);
        cert.days_remaining = -2;
        let outcome = SslProbe::evaluate(&monitor(30, None), cert, 42);
        assert!(!outcome.is_up);
        assert_eq!(outcome.status.to_string(), "down");
    }

    #[test]
    fn not_yet_valid_certificate_is_error() {
        let mut cert = certificate(300);
        cert.valid_from = Utc::now() + ChronoDuration::days(1);
        let outcome = SslProbe::evaluate(&monitor(30, None), cert, 42);
        assert_eq!(outcome.status.to_string(), "error");
    }

    #[test]
    fn healthy_certificate_is_up_without_warning() {
        let outcome = SslProbe::evaluate(&monitor(30, None), certificate(200), 42);
        assert!(outcome.is_up);
        assert!(outcome.details.get("warningMessage").is_none());
    }

    #[test]
    fn smart_frequency_bands() {
        let now = Utc::now();
        let recently = Some(now - ChronoDuration::minutes(30));
        let hours_ago = Some(now - ChronoDuration::hours(7));
        let yesterday = Some(now - ChronoDuration::hours(25));

        // Within the warning band: hourly.
        assert!(!SslProbe::should_check(
            &monitor(30, recently),
            Some(10),
            now
        ));
        assert!(SslProbe::should_check(
            &monitor(30, hours_ago),
            Some(10),
            now
        ));

        // Twice the warning band: six-hourly.
        assert!(!SslProbe::should_check(
            &monitor(30, recently),
            Some(45),
            now
        ));
        assert!(SslProbe::should_check(
            &monitor(30, hours_ago),
            Some(45),
            now
        ));

        // Far from expiry: configured frequency (daily by default).
        assert!(!SslProbe::should_check(
            &monitor(30, hours_ago),
            Some(300),
            now
        ));
        assert!(SslProbe::should_check(
            &monitor(30, yesterday),
            Some(300),
            now
        ));

        // No history: always check.
        assert!(SslProbe::should_check(&monitor(30, None), Some(300), now));
        assert!(SslProbe::should_check(
            &monitor(30, recently),
            None,
            now
        ));
    }
}
