//! Artifact location encoding and retention policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// Local and remote working files older than this are deleted.
pub const RETENTION_DAYS: u64 = 7;

pub const RETENTION: Duration = Duration::from_secs(RETENTION_DAYS * 24 * 60 * 60);

/// Where a compiled artifact lives: a backend target and an absolute path on it.
///
/// Persisted as `"<target>:<path>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    pub target: String,
    pub path: String,
}

impl ArtifactLocation {
    pub fn new(target: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            path: path.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.target, self.path)
    }

    pub fn parse(encoded: &str) -> Result<Self> {
        let (target, path) = encoded.split_once(':').ok_or_else(|| {
            Error::InvalidInput(format!("artifact location without target: {}", encoded))
        })?;
        if target.is_empty() || path.is_empty() {
            return Err(Error::InvalidInput(format!(
                "malformed artifact location: {}",
                encoded
            )));
        }
        Ok(Self::new(target, path))
    }
}

impl std::fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.target, self.path)
    }
}

impl std::str::FromStr for ArtifactLocation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_format() {
        let loc = ArtifactLocation::new("sova-engine", "/dldata/complect_x/dldata.ie2");
        assert_eq!(loc.encode(), "sova-engine:/dldata/complect_x/dldata.ie2");
        assert_eq!(loc.to_string(), loc.encode());
    }

    #[test]
    fn test_parse_encode_roundtrip() {
        for (target, path) in [
            ("a", "/x"),
            ("compiler-1", "/dldata/complect_20240101-000000_abc/dldata.ie2"),
            ("k8s.prod", "relative/path"),
        ] {
            let loc = ArtifactLocation::new(target, path);
            let parsed = ArtifactLocation::parse(&loc.encode()).unwrap();
            assert_eq!(parsed.target, target);
            assert_eq!(parsed.path, path);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ArtifactLocation::parse("no-colon").is_err());
        assert!(ArtifactLocation::parse(":/path").is_err());
        assert!(ArtifactLocation::parse("target:").is_err());
    }

    #[test]
    fn test_retention_is_seven_days() {
        assert_eq!(RETENTION.as_secs(), 604_800);
    }
}
