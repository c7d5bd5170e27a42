//! Release version ordering and range predicates

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Dotted numeric release version (`6.2`, `36.4.3`)
///
/// Parsing stops at the first non-numeric component, so `5.1.3-rev1`
/// compares as `5.1.3`. Trailing zeros are insignificant: `6.2 == 6.2.0`.
#[derive(Debug, Clone, Eq)]
pub struct ReleaseVersion(Vec<u32>);

impl ReleaseVersion {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = Vec::new();
        for component in value.trim().split('.') {
            let digits: String = component.chars().take_while(char::is_ascii_digit).collect();
            if digits.is_empty() {
                break;
            }
            parts.push(digits.parse().ok()?);
            if digits.len() != component.len() {
                break;
            }
        }
        if parts.is_empty() {
            return None;
        }
        while parts.len() > 1 && parts.last() == Some(&0) {
            parts.pop();
        }
        Some(Self(parts))
    }
}

impl PartialEq for ReleaseVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for ReleaseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReleaseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| {
                let a = self.0.get(i).copied().unwrap_or(0);
                let b = other.0.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

/// Half-open version range `[min, below)`; a missing bound is unbounded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub below: Option<String>,
}

impl VersionRange {
    /// Every version
    pub fn any() -> Self {
        Self::default()
    }

    pub fn between(min: &str, below: &str) -> Self {
        Self {
            min: Some(min.to_string()),
            below: Some(below.to_string()),
        }
    }

    pub fn at_least(min: &str) -> Self {
        Self {
            min: Some(min.to_string()),
            below: None,
        }
    }

    pub fn below(below: &str) -> Self {
        Self {
            min: None,
            below: Some(below.to_string()),
        }
    }

    /// Whether `version` falls in the range; unparseable versions never match
    /// a bounded range
    pub fn contains(&self, version: &str) -> bool {
        if self.min.is_none() && self.below.is_none() {
            return true;
        }
        let Some(version) = ReleaseVersion::parse(version) else {
            return false;
        };
        let above_min = match self.min.as_deref().map(ReleaseVersion::parse) {
            Some(Some(min)) => version >= min,
            Some(None) => false,
            None => true,
        };
        let under_max = match self.below.as_deref().map(ReleaseVersion::parse) {
            Some(Some(below)) => version < below,
            Some(None) => false,
            None => true,
        };
        above_min && under_max
    }
}
