//! Content-unit admission policy.
//!
//! Applied by the engine before any sink call: units whose payload length is
//! outside `[min_len, max_len]`, units flagged as automated, and units whose
//! path contains an excluded segment never reach the sink.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Deserialize;

use crate::models::ContentUnit;

/// Thresholds for one kind of content unit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AdmissionPolicy {
    #[serde(default = "default_min_len")]
    pub min_len: usize,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    /// Path segments (or `/`-joined segment runs such as `pub/static`) that exclude a unit.
    #[serde(default)]
    pub excluded_path_segments: BTreeSet<String>,
}

fn default_min_len() -> usize {
    20
}

fn default_max_len() -> usize {
    100_000
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            min_len: default_min_len(),
            max_len: default_max_len(),
            excluded_path_segments: BTreeSet::new(),
        }
    }
}

/// Outcome of checking a unit against its policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    TooShort(usize),
    TooLong(usize),
    Automated,
    ExcludedPath(String),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

impl fmt::Display for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Admission::Admitted => write!(f, "admitted"),
            Admission::TooShort(len) => write!(f, "too short ({} chars)", len),
            Admission::TooLong(len) => write!(f, "too long ({} chars)", len),
            Admission::Automated => write!(f, "automated"),
            Admission::ExcludedPath(segment) => write!(f, "excluded path segment '{}'", segment),
        }
    }
}

impl AdmissionPolicy {
    pub fn new(min_len: usize, max_len: usize) -> Self {
        Self {
            min_len,
            max_len,
            excluded_path_segments: BTreeSet::new(),
        }
    }

    pub fn excluding<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_path_segments
            .extend(segments.into_iter().map(Into::into));
        self
    }

    pub fn check(&self, unit: &ContentUnit) -> Admission {
        if unit.automated {
            return Admission::Automated;
        }
        if let Some(path) = &unit.path {
            if let Some(segment) = self.excluded_segment(path) {
                return Admission::ExcludedPath(segment.to_string());
            }
        }
        let len = unit.text_len();
        if len < self.min_len {
            return Admission::TooShort(len);
        }
        if len > self.max_len {
            return Admission::TooLong(len);
        }
        Admission::Admitted
    }

    fn excluded_segment(&self, path: &str) -> Option<&str> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        self.excluded_path_segments
            .iter()
            .map(String::as_str)
            .find(|excluded| {
                let needle: Vec<&str> = excluded.split('/').filter(|p| !p.is_empty()).collect();
                !needle.is_empty() && parts.windows(needle.len()).any(|w| w == needle.as_slice())
            })
    }
}

/// Policies keyed by unit `source_type`, with a fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionRules {
    pub fallback: AdmissionPolicy,
    pub by_source_type: BTreeMap<String, AdmissionPolicy>,
}

impl AdmissionRules {
    pub fn uniform(policy: AdmissionPolicy) -> Self {
        Self {
            fallback: policy,
            by_source_type: BTreeMap::new(),
        }
    }

    pub fn with(mut self, source_type: &str, policy: AdmissionPolicy) -> Self {
        self.by_source_type.insert(source_type.to_string(), policy);
        self
    }

    pub fn policy_for(&self, source_type: &str) -> &AdmissionPolicy {
        self.by_source_type
            .get(source_type)
            .unwrap_or(&self.fallback)
    }

    pub fn check(&self, unit: &ContentUnit) -> Admission {
        self.policy_for(&unit.key.source_type).check(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UnitKey;

    fn unit(text_len: usize) -> ContentUnit {
        ContentUnit::new(UnitKey::new("code", "repo", "f"), "x".repeat(text_len))
    }

    #[test]
    fn length_band_is_inclusive() {
        let policy = AdmissionPolicy::new(20, 1000);
        assert_eq!(policy.check(&unit(10)), Admission::TooShort(10));
        assert_eq!(policy.check(&unit(20)), Admission::Admitted);
        assert_eq!(policy.check(&unit(1000)), Admission::Admitted);
        assert_eq!(policy.check(&unit(1001)), Admission::TooLong(1001));
    }

    #[test]
    fn automated_units_rejected_regardless_of_length() {
        let policy = AdmissionPolicy::new(0, 1000);
        assert_eq!(policy.check(&unit(50).automated(true)), Admission::Automated);
    }

    #[test]
    fn excluded_segments_match_whole_segments() {
        let policy = AdmissionPolicy::new(0, 1000).excluding(["vendor", "pub/static"]);
        assert_eq!(
            policy.check(&unit(50).at_path("vendor/lib/a.php")),
            Admission::ExcludedPath("vendor".to_string())
        );
        assert_eq!(
            policy.check(&unit(50).at_path("app/pub/static/x.js")),
            Admission::ExcludedPath("pub/static".to_string())
        );
        assert!(policy.check(&unit(50).at_path("src/vendored.php")).is_admitted());
        assert!(policy.check(&unit(50).at_path("pub/app.js")).is_admitted());
    }

    #[test]
    fn rules_fall_back_for_unknown_types() {
        let rules = AdmissionRules::uniform(AdmissionPolicy::new(5, 10))
            .with("commit", AdmissionPolicy::new(20, 100));
        let commit = ContentUnit::new(UnitKey::new("commit", "r", "abc"), "short msg");
        let message = ContentUnit::new(UnitKey::new("message", "c", "1"), "short msg");
        assert_eq!(rules.check(&commit), Admission::TooShort(9));
        assert!(rules.check(&message).is_admitted());
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: AdmissionPolicy = serde_json::from_str(r#"{"min_len": 100}"#).unwrap();
        assert_eq!(policy.min_len, 100);
        assert_eq!(policy.max_len, 100_000);
        assert!(policy.excluded_path_segments.is_empty());
    }
}
