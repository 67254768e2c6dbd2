//! Package-manager capabilities per ecosystem
//!
//! Each supported ecosystem knows which sandbox image analyzes its packages,
//! how to invoke the analysis inside it, and how to ask the registry for the
//! latest published version.

use crate::error::{PipelineError, Result};
use crate::types::{Ecosystem, PackageIdentifier};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Which kind of analysis a sandbox run performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    /// Install and import the package while tracing its behaviour
    Dynamic,
    /// Extract string literals from the package sources without running them
    Static,
}

impl AnalysisMode {
    fn phase(&self) -> &'static str {
        match self {
            AnalysisMode::Dynamic => "all",
            AnalysisMode::Static => "strings",
        }
    }
}

/// What the worker needs to know about an ecosystem
#[async_trait]
pub trait PackageManager: Send + Sync {
    fn ecosystem(&self) -> Ecosystem;

    /// Sandbox image reference
    fn image(&self) -> &str;

    /// Command line run inside the image
    fn command(&self, id: &PackageIdentifier, mode: AnalysisMode) -> Vec<String>;

    /// Ask the registry for the latest version of `name`
    async fn latest_version(&self, name: &str) -> Result<String>;
}

/// Registry endpoints and sandbox layout for one ecosystem
struct RegistryDefaults {
    ecosystem: Ecosystem,
    image: &'static str,
    command_path: &'static str,
    registry_url: &'static str,
}

const REGISTRIES: &[RegistryDefaults] = &[
    RegistryDefaults {
        ecosystem: Ecosystem::Npm,
        image: "pkgwatch/sandbox-node",
        command_path: "/usr/local/bin/analyze.js",
        registry_url: "https://registry.npmjs.org",
    },
    RegistryDefaults {
        ecosystem: Ecosystem::PyPI,
        image: "pkgwatch/sandbox-python",
        command_path: "/usr/local/bin/analyze.py",
        registry_url: "https://pypi.org",
    },
    RegistryDefaults {
        ecosystem: Ecosystem::RubyGems,
        image: "pkgwatch/sandbox-ruby",
        command_path: "/usr/local/bin/analyze.rb",
        registry_url: "https://rubygems.org",
    },
    RegistryDefaults {
        ecosystem: Ecosystem::CratesIo,
        image: "pkgwatch/sandbox-rust",
        command_path: "/usr/local/bin/analyze-crate.py",
        registry_url: "https://crates.io",
    },
    RegistryDefaults {
        ecosystem: Ecosystem::Packagist,
        image: "pkgwatch/sandbox-php",
        command_path: "/usr/local/bin/analyze.php",
        registry_url: "https://repo.packagist.org",
    },
];

/// Package manager backed by the ecosystem's public registry API
pub struct HttpPackageManager {
    ecosystem: Ecosystem,
    image: String,
    command_path: String,
    registry_url: String,
    http: reqwest::Client,
}

impl HttpPackageManager {
    /// Built-in manager for `ecosystem`, images tagged with `image_tag`
    pub fn for_ecosystem(ecosystem: Ecosystem, image_tag: &str, http: reqwest::Client) -> Self {
        let defaults = REGISTRIES
            .iter()
            .find(|s| s.ecosystem == ecosystem)
            .unwrap_or(&REGISTRIES[0]);
        Self {
            ecosystem,
            image: format!("{}:{}", defaults.image, image_tag),
            command_path: defaults.command_path.to_string(),
            registry_url: defaults.registry_url.to_string(),
            http,
        }
    }

    /// Point registry lookups somewhere else (mirrors, tests)
    pub fn with_registry_url(mut self, url: impl Into<String>) -> Self {
        self.registry_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn version_url(&self, name: &str) -> String {
        match self.ecosystem {
            Ecosystem::Npm => format!("{}/{}", self.registry_url, name),
            Ecosystem::PyPI => format!("{}/pypi/{}/json", self.registry_url, name),
            Ecosystem::RubyGems => format!("{}/api/v1/gems/{}.json", self.registry_url, name),
            Ecosystem::CratesIo => format!("{}/api/v1/crates/{}/versions", self.registry_url, name),
            Ecosystem::Packagist => format!("{}/p2/{}.json", self.registry_url, name),
        }
    }
}

#[async_trait]
impl PackageManager for HttpPackageManager {
    fn ecosystem(&self) -> Ecosystem {
        self.ecosystem
    }

    fn image(&self) -> &str {
        &self.image
    }

    fn command(&self, id: &PackageIdentifier, mode: AnalysisMode) -> Vec<String> {
        vec![
            self.command_path.clone(),
            "--version".to_string(),
            id.version().to_string(),
            mode.phase().to_string(),
            id.name().to_string(),
        ]
    }

    async fn latest_version(&self, name: &str) -> Result<String> {
        let url = self.version_url(name);
        debug!("Resolving latest version from {}", url);

        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PipelineError::NotFound(format!(
                "{} package '{}'",
                self.ecosystem, name
            )));
        }
        let body = response.error_for_status()?.bytes().await?;
        parse_latest_version(self.ecosystem, name, &body)
    }
}

#[derive(Deserialize)]
struct NpmPackument {
    #[serde(rename = "dist-tags")]
    dist_tags: HashMap<String, String>,
}

#[derive(Deserialize)]
struct PypiProject {
    info: PypiInfo,
}

#[derive(Deserialize)]
struct PypiInfo {
    version: String,
}

#[derive(Deserialize)]
struct GemInfo {
    version: String,
}

#[derive(Deserialize)]
struct CrateVersions {
    versions: Vec<CrateVersion>,
}

#[derive(Deserialize)]
struct CrateVersion {
    num: String,
}

#[derive(Deserialize)]
struct PackagistPackages {
    packages: HashMap<String, Vec<PackagistRelease>>,
}

#[derive(Deserialize)]
struct PackagistRelease {
    version: String,
    time: Option<String>,
}

/// Pull the latest version out of a registry response body
pub fn parse_latest_version(ecosystem: Ecosystem, name: &str, body: &[u8]) -> Result<String> {
    let version = match ecosystem {
        Ecosystem::Npm => {
            let doc: NpmPackument = serde_json::from_slice(body)?;
            doc.dist_tags.get("latest").cloned()
        }
        Ecosystem::PyPI => {
            let doc: PypiProject = serde_json::from_slice(body)?;
            Some(doc.info.version)
        }
        Ecosystem::RubyGems => {
            let doc: GemInfo = serde_json::from_slice(body)?;
            Some(doc.version)
        }
        Ecosystem::CratesIo => {
            let doc: CrateVersions = serde_json::from_slice(body)?;
            doc.versions.into_iter().next().map(|v| v.num)
        }
        Ecosystem::Packagist => {
            let doc: PackagistPackages = serde_json::from_slice(body)?;
            doc.packages.get(name).and_then(|releases| {
                releases
                    .iter()
                    .filter_map(|r| {
                        let time = chrono::DateTime::parse_from_rfc3339(r.time.as_deref()?).ok()?;
                        Some((time, &r.version))
                    })
                    .max_by_key(|(time, _)| *time)
                    .map(|(_, version)| version.clone())
            })
        }
    };

    version
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| PipelineError::NotFound(format!("latest version of {} package '{}'", ecosystem, name)))
}

/// Supported ecosystems and their managers
#[derive(Default)]
pub struct ManagerRegistry {
    managers: HashMap<Ecosystem, Arc<dyn PackageManager>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry-backed managers for every known ecosystem
    pub fn with_defaults(image_tag: &str, http: reqwest::Client) -> Self {
        let mut registry = Self::new();
        for eco in Ecosystem::ALL {
            registry.register(Arc::new(HttpPackageManager::for_ecosystem(
                eco,
                image_tag,
                http.clone(),
            )));
        }
        registry
    }

    pub fn register(&mut self, manager: Arc<dyn PackageManager>) {
        self.managers.insert(manager.ecosystem(), manager);
    }

    pub fn get(&self, ecosystem: Ecosystem) -> Option<Arc<dyn PackageManager>> {
        self.managers.get(&ecosystem).cloned()
    }

    /// Parse an ecosystem tag and look up its manager
    pub fn lookup(&self, tag: &str) -> Result<Arc<dyn PackageManager>> {
        let ecosystem: Ecosystem = tag.parse()?;
        self.get(ecosystem)
            .ok_or_else(|| PipelineError::UnsupportedEcosystem(tag.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_npm_dist_tags() {
        let body = br#"{"name":"left-pad","dist-tags":{"latest":"1.3.0","next":"2.0.0-rc"}}"#;
        assert_eq!(parse_latest_version(Ecosystem::Npm, "left-pad", body).unwrap(), "1.3.0");
    }

    #[test]
    fn test_npm_without_latest_tag() {
        let body = br#"{"dist-tags":{"beta":"0.1.0"}}"#;
        assert!(matches!(
            parse_latest_version(Ecosystem::Npm, "x", body),
            Err(PipelineError::NotFound(_))
        ));
    }

    #[test]
    fn test_pypi_and_rubygems() {
        let pypi = br#"{"info":{"name":"requests","version":"2.31.0"},"releases":{}}"#;
        assert_eq!(parse_latest_version(Ecosystem::PyPI, "requests", pypi).unwrap(), "2.31.0");
        let gem = br#"{"name":"rails","version":"7.1.2","downloads":1}"#;
        assert_eq!(parse_latest_version(Ecosystem::RubyGems, "rails", gem).unwrap(), "7.1.2");
    }

    #[test]
    fn test_crates_takes_first_version() {
        let body = br#"{"versions":[{"num":"1.0.200"},{"num":"1.0.199"}]}"#;
        assert_eq!(parse_latest_version(Ecosystem::CratesIo, "serde", body).unwrap(), "1.0.200");
        assert!(parse_latest_version(Ecosystem::CratesIo, "serde", br#"{"versions":[]}"#).is_err());
    }

    #[test]
    fn test_packagist_latest_by_time() {
        let body = br#"{"packages":{"monolog/monolog":[
            {"version":"3.4.0","time":"2023-06-21T08:46:11+00:00"},
            {"version":"3.5.0","time":"2023-10-27T15:32:31+00:00"},
            {"version":"2.9.2","time":"2023-10-27T15:25:26+00:00"}
        ]}}"#;
        assert_eq!(
            parse_latest_version(Ecosystem::Packagist, "monolog/monolog", body).unwrap(),
            "3.5.0"
        );
    }

    #[test]
    fn test_command_template() {
        let mgr = HttpPackageManager::for_ecosystem(Ecosystem::PyPI, "v2", reqwest::Client::new());
        let id = PackageIdentifier::new(Ecosystem::PyPI, "requests", "2.31.0").unwrap();
        assert_eq!(mgr.image(), "pkgwatch/sandbox-python:v2");
        assert_eq!(
            mgr.command(&id, AnalysisMode::Dynamic),
            vec!["/usr/local/bin/analyze.py", "--version", "2.31.0", "all", "requests"]
        );
        assert_eq!(mgr.command(&id, AnalysisMode::Static)[3], "strings");
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ManagerRegistry::with_defaults("latest", reqwest::Client::new());
        assert!(registry.lookup("npm").is_ok());
        assert!(registry.lookup("crates").is_ok());
        assert!(matches!(
            registry.lookup("cpan"),
            Err(PipelineError::UnsupportedEcosystem(_))
        ));

        let empty = ManagerRegistry::new();
        assert!(matches!(
            empty.lookup("npm"),
            Err(PipelineError::UnsupportedEcosystem(_))
        ));
    }
}
