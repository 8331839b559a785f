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

//! Target-URL validation. Monitor targets come from end users; without this
//! guard a probe is an open proxy into the worker's network.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetValidationError {
    #[error("invalid URL: {0}")]
    Malformed(String),
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("suspicious URL pattern: {0}")]
    SuspiciousPattern(String),
    #[error("target resolves to an internal address")]
    InternalAddress,
}

/// Parses and validates a monitor target. `allow_internal` disables the
/// address-range checks for self-hosted deployments probing their own
/// infrastructure.
pub fn validate_target_url(raw: &str, allow_internal: bool) -> Result<Url, TargetValidationError> {
    let trimmed = raw.trim();
    let lowered = trimmed.to_ascii_lowercase();

    for scheme in ["javascript:", "data:", "file:"] {
        if lowered.starts_with(scheme) {
            return Err(TargetValidationError::SuspiciousPattern(scheme.to_string()));
        }
    }
    if trimmed.matches('@').count() > 1 {
        return Err(TargetValidationError::SuspiciousPattern(
            "multiple @ characters".to_string(),
        ));
    }
    if trimmed.contains("..") {
        return Err(TargetValidationError::SuspiciousPattern(
            "path traversal".to_string(),
        ));
    }

    let url =
        Url::parse(trimmed).map_err(|err| TargetValidationError::Malformed(err.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(TargetValidationError::UnsupportedProtocol(
                other.to_string(),
            ))
        }
    }

    let Some(host) = url.host_str() else {
        return Err(TargetValidationError::Malformed("missing host".to_string()));
    };

    if !allow_internal && is_internal_host(host) {
        return Err(TargetValidationError::InternalAddress);
    }

    Ok(url)
}

pub fn is_internal_host(host: &str) -> bool {
    let host = host.trim_matches(|c| c == '[' || c == ']');

    if let Ok(ip) = host.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => is_internal_v4(v4),
            IpAddr::V6(v6) => is_internal_v6(v6),
        };
    }

    let lowered = host.to_ascii_lowercase();
    lowered == "localhost"
        || lowered.ends_with(".localhost")
        || lowered.ends_with(".local")
        || lowered.ends_with(".internal")
}

fn is_internal_v4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()                                        // 127.0.0.0/8
        || ip.is_private()                                  // RFC 1918
        || ip.is_link_local()                               // 169.254.0.0/16
        || ip.is_unspecified()
        || octets[0] == 0                                   // current network
        || (octets[0] == 100 && (64..128).contains(&octets[1])) // CGNAT 100.64.0.0/10
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 2)    // RFC 5737
        || (octets[0] == 198 && octets[1] == 51 && octets[2] == 100) // RFC 5737
        || (octets[0] == 203 && octets[1] == 0 && octets[2] == 113)  // RFC 5737
        || (octets[0] == 198 && (octets[1] == 18 || octets[1] == 19)) // benchmarking
}

fn is_internal_v6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    let segments = ip.segments();
    // fe80::/10 link-local, fc00::/7 unique-local, 2001:db8::/32 docs
    (segments[0] & 0xffc0) == 0xfe80
        || (segments[0] & 0xfe00) == 0xfc00
        || (segments[0] == 0x2001 && segments[1] == 0x0db8)
        || ip.to_ipv4_mapped().map(is_internal_v4).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn accepts_public_http_targets() {
        assert!(validate_target_url("https://example.com/health", false).is_ok());
        assert!(validate_target_url("http://93.184.216.34:8080/", false).is_ok());
    }

    #[test]
    fn rejects_non_http_protocols() {
        assert!(matches!(
            validate_target_url("ftp://example.com", false),
            Err(TargetValidationError::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            validate_target_url("javascript:alert(1)", false),
            Err(TargetValidationError::SuspiciousPattern(_))
        ));
        assert!(matches!(
            validate_target_url("data:text/html,x", false),
            Err(TargetValidationError::SuspiciousPattern(_))
        ));
        assert!(matches!(
            validate_target_url("file:///etc/passwd", false),
            Err(TargetValidationError::SuspiciousPattern(_))
        ));
    }

    #[test]
    fn rejects_credential_smuggling_and_traversal() {
        assert!(matches!(
            validate_target_url("https://user@evil.com@example.com/", false),
            Err(TargetValidationError::SuspiciousPattern(_))
        ));
        assert!(matches!(
            validate_target_url("https://example.com/../../admin", false),
            Err(TargetValidationError::SuspiciousPattern(_))
        ));
    }

    #[test]
    fn rejects_every_internal_v4_range() {
        for addr in [
            "http://127.0.0.1/",
            "http://10.1.2.3/",
            "http://172.16.0.1/",
            "http://172.31.255.255/",
            "http://192.168.1.1/",
            "http://100.64.0.1/",
            "http://100.127.255.254/",
            "http://169.254.169.254/latest/meta-data/",
            "http://192.0.2.7/",
            "http://198.51.100.20/",
            "http://203.0.113.99/",
            "http://198.18.0.1/",
            "http://0.0.0.0/",
        ] {
            assert_eq!(
                validate_target_url(addr, false),
                Err(TargetValidationError::InternalAddress),
                "{addr} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_internal_hostnames() {
        for addr in [
            "http://localhost/",
            "http://db.local/",
            "http://metadata.google.internal/",
        ] {
            assert_eq!(
                validate_target_url(addr, false),
                Err(TargetValidationError::InternalAddress),
                "{addr} should be rejected"
            );
        }
    }

    #[test]
    fn allow_internal_bypasses_range_checks_only() {
        assert!(validate_target_url("http://127.0.0.1:8080/", true).is_ok());
        assert!(validate_target_url("http://192.168.0.1/", true).is_ok());
        // Pattern checks still apply.
        assert!(validate_target_url("javascript:alert(1)", true).is_err());
    }

    #[test]
    fn internal_v6_ranges() {
        assert!(is_internal_host("::1"));
        assert!(is_internal_host("[::1]"));
        assert!(is_internal_host("fe80::1"));
        assert!(is_internal_host("fd00::1"));
        assert!(is_internal_host("2001:db8::1"));
        assert!(!is_internal_host("2606:4700:4700::1111"));
    }
}
