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

//! Expected-status expressions: `2xx`-style wildcards, `A-B` ranges and
//! comma-separated exact codes. An empty expression means 200-299.

#[derive(Debug, Clone, PartialEq, Eq)]
enum StatusPattern {
    /// `2xx` - any code in [200, 299].
    Wildcard(u16),
    Range(u16, u16),
    Exact(u16),
}

impl StatusPattern {
    fn matches(&self, code: u16) -> bool {
        match self {
            StatusPattern::Wildcard(century) => code / 100 == *century,
            StatusPattern::Range(low, high) => (*low..=*high).contains(&code),
            StatusPattern::Exact(exact) => code == *exact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedStatusSpec {
    patterns: Vec<StatusPattern>,
}

impl ExpectedStatusSpec {
    pub fn parse(spec: &str) -> Result<ExpectedStatusSpec, String> {
        let trimmed = spec.trim();
        if trimmed.is_empty() {
            return Ok(ExpectedStatusSpec {
                patterns: vec![StatusPattern::Range(200, 299)],
            });
        }

        let mut patterns = Vec::new();
        for entry in trimmed.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let lowered = entry.to_ascii_lowercase();
            if let Some(century) = lowered.strip_suffix("xx") {
                let century: u16 = century
                    .parse()
                    .map_err(|_| format!("Invalid status wildcard: {entry}"))?;
                if !(1..=5).contains(&century) {
                    return Err(format!("Invalid status wildcard: {entry}"));
                }
                patterns.push(StatusPattern::Wildcard(century));
            } else if let Some((low, high)) = entry.split_once('-') {
                let low: u16 = low
                    .trim()
                    .parse()
                    .map_err(|_| format!("Invalid status range: {entry}"))?;
                let high: u16 = high
                    .trim()
                    .parse()
                    .map_err(|_| format!("Invalid status range: {entry}"))?;
                if low > high {
                    return Err(format!("Inverted status range: {entry}"));
                }
                patterns.push(StatusPattern::Range(low, high));
            } else {
                let exact: u16 = entry
                    .parse()
                    .map_err(|_| format!("Invalid status code: {entry}"))?;
                patterns.push(StatusPattern::Exact(exact));
            }
        }

        if patterns.is_empty() {
            return Err(format!("Empty status expression: {spec}"));
        }

        Ok(ExpectedStatusSpec { patterns })
    }

    pub fn matches(&self, code: u16) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(code))
    }
}

/// Whether `code` satisfies the monitor's expected-status expression. An
/// unparseable expression falls back to the 200-299 default rather than
/// failing the probe.
pub fn is_expected_status(code: u16, spec: Option<&str>) -> bool {
    let spec = spec.unwrap_or("");
    match ExpectedStatusSpec::parse(spec) {
        Ok(parsed) => parsed.matches(code),
        Err(_) => (200..=299).contains(&code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn empty_spec_means_2xx() {
        assert!(is_expected_status(200, None));
        assert!(is_expected_status(299, Some("")));
        assert!(is_expected_status(204, Some("   ")));
        assert!(!is_expected_status(301, None));
        assert!(!is_expected_status(500, Some("")));
    }

    #[test]
    fn wildcards() {
        let spec = ExpectedStatusSpec::parse("2xx").unwrap();
        assert!(spec.matches(200));
        assert!(spec.matches(250));
        assert!(!spec.matches(300));

        assert!(is_expected_status(404, Some("4xx")));
        assert!(is_expected_status(503, Some("5XX")));
        assert!(is_expected_status(302, Some("3xx")));
    }

    #[test]
    fn ranges_are_inclusive() {
        let spec = ExpectedStatusSpec::parse("200-204").unwrap();
        assert!(spec.matches(200));
        assert!(spec.matches(204));
        assert!(!spec.matches(205));
    }

    #[test]
    fn comma_separated_lists_combine() {
        let spec = ExpectedStatusSpec::parse("200, 301-302, 4xx").unwrap();
        assert!(spec.matches(200));
        assert!(spec.matches(301));
        assert!(spec.matches(302));
        assert!(spec.matches(418));
        assert!(!spec.matches(201));
        assert!(!spec.matches(303));
        assert!(!spec.matches(500));
    }

    #[test]
    fn invalid_specs_are_rejected() {
        assert!(ExpectedStatusSpec::parse("6xx").is_err());
        assert!(ExpectedStatusSpec::parse("abc").is_err());
        assert!(ExpectedStatusSpec::parse("300-200").is_err());
        assert!(ExpectedStatusSpec::parse(",").is_err());
    }

    #[test]
    fn matching_is_deterministic_and_monotone_within_ranges() {
        let spec = ExpectedStatusSpec::parse("400-499").unwrap();
        for code in 400..=499 {
            assert!(spec.matches(code));
        }
        assert!(!spec.matches(399));
        assert!(!spec.matches(500));
    }
}
