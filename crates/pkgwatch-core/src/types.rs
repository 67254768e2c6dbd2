//! Core type definitions for the analysis pipeline

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Message attribute carrying the package name
pub const META_NAME: &str = "name";
/// Message attribute carrying the ecosystem tag
pub const META_ECOSYSTEM: &str = "ecosystem";
/// Message attribute carrying the version (may be absent)
pub const META_VERSION: &str = "version";

/// Package registries the pipeline knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Ecosystem {
    /// npm registry
    #[serde(rename = "npm")]
    Npm,
    /// Python Package Index
    #[serde(rename = "pypi")]
    PyPI,
    /// RubyGems
    #[serde(rename = "rubygems")]
    RubyGems,
    /// crates.io
    #[serde(rename = "crates.io", alias = "crates")]
    CratesIo,
    /// Packagist (PHP)
    #[serde(rename = "packagist")]
    Packagist,
}

impl Ecosystem {
    /// Every known ecosystem
    pub const ALL: [Ecosystem; 5] = [
        Ecosystem::Npm,
        Ecosystem::PyPI,
        Ecosystem::RubyGems,
        Ecosystem::CratesIo,
        Ecosystem::Packagist,
    ];

    /// Wire tag used in messages, object keys and index documents
    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::Npm => "npm",
            Ecosystem::PyPI => "pypi",
            Ecosystem::RubyGems => "rubygems",
            Ecosystem::CratesIo => "crates.io",
            Ecosystem::Packagist => "packagist",
        }
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ecosystem {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "npm" => Ok(Ecosystem::Npm),
            "pypi" => Ok(Ecosystem::PyPI),
            "rubygems" => Ok(Ecosystem::RubyGems),
            "crates.io" | "crates" => Ok(Ecosystem::CratesIo),
            "packagist" => Ok(Ecosystem::Packagist),
            other => Err(PipelineError::UnsupportedEcosystem(other.to_string())),
        }
    }
}

/// The (ecosystem, name, version) triple identifying one analyzable unit.
///
/// All three fields are non-empty; there is no way to build or deserialize
/// an identifier that violates this, and no way to mutate one afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", try_from = "RawIdentifier")]
pub struct PackageIdentifier {
    ecosystem: Ecosystem,
    name: String,
    version: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawIdentifier {
    ecosystem: Ecosystem,
    name: String,
    version: String,
}

impl TryFrom<RawIdentifier> for PackageIdentifier {
    type Error = PipelineError;

    fn try_from(raw: RawIdentifier) -> Result<Self> {
        PackageIdentifier::new(raw.ecosystem, raw.name, raw.version)
    }
}

impl PackageIdentifier {
    /// Build an identifier, rejecting empty name or version
    pub fn new(
        ecosystem: Ecosystem,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let version = version.into();
        if name.trim().is_empty() {
            return Err(PipelineError::InvalidIdentifier(format!(
                "{} package with empty name",
                ecosystem
            )));
        }
        if version.trim().is_empty() {
            return Err(PipelineError::InvalidIdentifier(format!(
                "{}/{} has no version",
                ecosystem, name
            )));
        }
        Ok(Self {
            ecosystem,
            name,
            version,
        })
    }

    pub fn ecosystem(&self) -> Ecosystem {
        self.ecosystem
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Dispatch body for this identifier
    pub fn job_body(&self) -> JobBody {
        JobBody {
            name: self.name.clone(),
            version: self.version.clone(),
            ecosystem: self.ecosystem.as_str().to_string(),
        }
    }
}

/// Canonical form `<ecosystem>-<name>-<version>`. Fields are joined
/// verbatim, so names containing `-` make the form ambiguous.
impl fmt::Display for PackageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.ecosystem, self.name, self.version)
    }
}

/// Body of an analysis job message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobBody {
    pub name: String,
    /// Empty means "resolve to latest when the job is consumed"
    #[serde(default)]
    pub version: String,
    /// Ecosystem tag
    #[serde(rename = "Type")]
    pub ecosystem: String,
}

/// Package section of a completion notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NotificationPackage {
    pub name: String,
    pub version: String,
    pub ecosystem: String,
}

/// Published once a result has been uploaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompletionNotification {
    pub package: NotificationPackage,
}

impl From<&PackageIdentifier> for CompletionNotification {
    fn from(id: &PackageIdentifier) -> Self {
        Self {
            package: NotificationPackage {
                name: id.name().to_string(),
                version: id.version().to_string(),
                ecosystem: id.ecosystem().as_str().to_string(),
            },
        }
    }
}

/// Severity levels for static-analysis findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Strong indication of a hidden payload
    Critical = 0,
    /// Significant obfuscation
    High = 1,
    /// Worth a closer look
    Medium = 2,
    /// Weak signal on its own
    Low = 3,
    /// Informational
    #[default]
    Info = 4,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::High => write!(f, "HIGH"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::Low => write!(f, "LOW"),
            Severity::Info => write!(f, "INFO"),
        }
    }
}

/// Category of a static-analysis finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Encoded or escaped content
    Obfuscation,
    /// Hard-coded network endpoints
    NetworkIndicator,
    /// High-entropy string data
    Entropy,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Obfuscation => write!(f, "Obfuscation"),
            Category::NetworkIndicator => write!(f, "Network Indicator"),
            Category::Entropy => write!(f, "Entropy"),
        }
    }
}

/// Where in a scanned file a finding was raised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// File path as reported by the scan
    pub file: String,
    /// Line number (1-indexed) when known
    pub line: Option<usize>,
    /// Offending text, truncated for display
    pub snippet: Option<String>,
}

/// A single static-analysis finding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Finding type identifier (e.g., "OBF-001")
    pub id: String,
    pub severity: Severity,
    pub category: Category,
    /// Short title describing the signal
    pub title: String,
    /// Longer explanation
    pub description: String,
    pub location: Location,
    /// Additional metadata
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_string() {
        let id = PackageIdentifier::new(Ecosystem::Npm, "left-pad", "1.0.0").unwrap();
        assert_eq!(id.to_string(), "npm-left-pad-1.0.0");
    }

    #[test]
    fn test_dashed_names_kept_verbatim() {
        let id = PackageIdentifier::new(Ecosystem::PyPI, "a-b", "1-2").unwrap();
        assert_eq!(id.to_string(), "pypi-a-b-1-2");
    }

    #[test]
    fn test_empty_fields_rejected() {
        assert!(PackageIdentifier::new(Ecosystem::Npm, "", "1.0.0").is_err());
        assert!(PackageIdentifier::new(Ecosystem::Npm, "left-pad", " ").is_err());
    }

    #[test]
    fn test_ecosystem_parsing() {
        assert_eq!("npm".parse::<Ecosystem>().unwrap(), Ecosystem::Npm);
        assert_eq!("PyPI".parse::<Ecosystem>().unwrap(), Ecosystem::PyPI);
        assert_eq!("crates".parse::<Ecosystem>().unwrap(), Ecosystem::CratesIo);
        assert!(matches!(
            "maven".parse::<Ecosystem>(),
            Err(PipelineError::UnsupportedEcosystem(_))
        ));
        for eco in Ecosystem::ALL {
            assert_eq!(eco.as_str().parse::<Ecosystem>().unwrap(), eco);
        }
    }

    #[test]
    fn test_job_body_wire_form() {
        let id = PackageIdentifier::new(Ecosystem::RubyGems, "rails", "7.1.0").unwrap();
        let json = serde_json::to_value(id.job_body()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"Name": "rails", "Version": "7.1.0", "Type": "rubygems"})
        );

        let body: JobBody = serde_json::from_str(r#"{"Name":"rails","Type":"rubygems"}"#).unwrap();
        assert!(body.version.is_empty());
    }

    #[test]
    fn test_identifier_deserialization_validates() {
        let ok: PackageIdentifier = serde_json::from_str(
            r#"{"Ecosystem":"crates.io","Name":"serde","Version":"1.0.0"}"#,
        )
        .unwrap();
        assert_eq!(ok.ecosystem(), Ecosystem::CratesIo);

        let bad = serde_json::from_str::<PackageIdentifier>(
            r#"{"Ecosystem":"npm","Name":"","Version":"1.0.0"}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_notification_wire_form() {
        let id = PackageIdentifier::new(Ecosystem::Npm, "left-pad", "1.0.0").unwrap();
        let json = serde_json::to_value(CompletionNotification::from(&id)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"Package": {"Name": "left-pad", "Version": "1.0.0", "Ecosystem": "npm"}})
        );
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical < Severity::High);
        assert!(Severity::Low < Severity::Info);
    }
}
