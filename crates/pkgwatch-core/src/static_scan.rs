//! Static-analysis verdicts built from string-level signals
//!
//! Input is the set of string literals found in a package's files, either
//! reported by the static sandbox run or extracted locally from a file.
//! Each string goes through the detectors in [`crate::obfuscation`]; hits
//! become [`Finding`]s and the most severe one sets the verdict.

use crate::error::{PipelineError, Result};
use crate::obfuscation;
use crate::types::{Category, Finding, Location, PackageIdentifier, Severity};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

lazy_static! {
    static ref STRING_LITERAL: Regex = Regex::new(
        r#""((?:[^"\\\n]|\\.)*)"|'((?:[^'\\\n]|\\.)*)'|`((?:[^`\\]|\\.)*)`"#
    ).unwrap();
}

/// Encoded candidates at least this long are rated high
const LONG_PAYLOAD: usize = 100;
/// Hex runs at least this long become findings
const LONG_HEX: usize = 32;
/// Strings at least this long are checked for entropy
const ENTROPY_MIN_LEN: usize = 40;
/// Entropy (nats) above which a long string is reported
const ENTROPY_THRESHOLD: f64 = 3.5;
/// Snippets are cut to this many characters
const SNIPPET_LEN: usize = 80;

/// A string literal and, when known, the line it starts on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedString {
    pub value: String,
    pub line: Option<usize>,
}

/// Strings found in one file
#[derive(Debug, Clone, PartialEq)]
pub struct FileStrings {
    pub path: String,
    pub strings: Vec<ExtractedString>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StringReport {
    #[serde(default)]
    files: Vec<ReportFile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReportFile {
    path: String,
    #[serde(default)]
    strings: Vec<String>,
}

/// Read the `{"Files": [{"Path", "Strings"}]}` report of a static sandbox run
pub fn parse_string_report(doc: &serde_json::Value) -> Result<Vec<FileStrings>> {
    let report: StringReport = serde_json::from_value(doc.clone())
        .map_err(|e| PipelineError::Sandbox(format!("Unexpected static report shape: {}", e)))?;
    Ok(report
        .files
        .into_iter()
        .map(|f| FileStrings {
            path: f.path,
            strings: f
                .strings
                .into_iter()
                .map(|value| ExtractedString { value, line: None })
                .collect(),
        })
        .collect())
}

/// Pull quoted string literals out of source text.
///
/// Files without any literal are treated as data: every non-empty line is
/// returned instead.
pub fn extract_string_literals(source: &str) -> Vec<ExtractedString> {
    let line_of = |offset: usize| source[..offset].bytes().filter(|&b| b == b'\n').count() + 1;

    let literals: Vec<ExtractedString> = STRING_LITERAL
        .captures_iter(source)
        .filter_map(|caps| {
            let m = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3))?;
            if m.as_str().is_empty() {
                return None;
            }
            Some(ExtractedString {
                value: m.as_str().to_string(),
                line: Some(line_of(m.start())),
            })
        })
        .collect();

    if !literals.is_empty() {
        return literals;
    }

    source
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| ExtractedString {
            value: l.trim().to_string(),
            line: Some(i + 1),
        })
        .collect()
}

/// Detector hits for one file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSignals {
    pub path: String,
    pub string_count: usize,
    /// Mean normalised entropy across the file's strings
    pub mean_entropy: f64,
    pub base64: Vec<String>,
    pub hex: Vec<String>,
    pub ip_addresses: Vec<String>,
    pub urls: Vec<String>,
    pub escaped: Vec<String>,
    pub high_entropy: Vec<String>,
}

/// Outcome of a static analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticVerdict {
    /// Most severe finding, `Info` when there are none
    pub severity: Severity,
    pub suspicious: bool,
    pub findings: Vec<Finding>,
    pub files: Vec<FileSignals>,
}

impl StaticVerdict {
    pub fn count_by_severity(&self) -> std::collections::BTreeMap<Severity, usize> {
        let mut counts = std::collections::BTreeMap::new();
        for finding in &self.findings {
            *counts.entry(finding.severity).or_insert(0) += 1;
        }
        counts
    }
}

/// Static analysis result as uploaded by the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StaticRecord {
    pub package: PackageIdentifier,
    /// The static table is partitioned on this field
    pub created: DateTime<Utc>,
    pub verdict: StaticVerdict,
}

impl StaticRecord {
    pub fn new(package: PackageIdentifier, verdict: StaticVerdict) -> Self {
        Self {
            package,
            created: Utc::now(),
            verdict,
        }
    }
}

fn snippet(s: &str) -> String {
    if s.chars().count() <= SNIPPET_LEN {
        s.to_string()
    } else {
        let cut: String = s.chars().take(SNIPPET_LEN).collect();
        format!("{}...", cut)
    }
}

fn finding(
    id: &str,
    severity: Severity,
    category: Category,
    title: &str,
    description: String,
    file: &str,
    line: Option<usize>,
    text: &str,
) -> Finding {
    Finding {
        id: id.to_string(),
        severity,
        category,
        title: title.to_string(),
        description,
        location: Location {
            file: file.to_string(),
            line,
            snippet: Some(snippet(text)),
        },
        metadata: serde_json::json!({ "length": text.len() }),
    }
}

/// Run every detector over every string and build the verdict
pub fn assess(files: &[FileStrings]) -> StaticVerdict {
    let mut findings = Vec::new();
    let mut signals = Vec::with_capacity(files.len());

    for file in files {
        let mut sig = FileSignals {
            path: file.path.clone(),
            string_count: file.strings.len(),
            ..Default::default()
        };
        let mut entropy_sum = 0.0;

        for s in &file.strings {
            let text = s.value.as_str();
            entropy_sum += obfuscation::normalised_entropy(text);

            for encoded in obfuscation::find_encoded_substrings(text) {
                let severity = if encoded.len() >= LONG_PAYLOAD {
                    Severity::High
                } else {
                    Severity::Medium
                };
                findings.push(finding(
                    "OBF-001",
                    severity,
                    Category::Obfuscation,
                    "Base64-encoded data",
                    format!("{} characters of what looks like base64", encoded.len()),
                    &file.path,
                    s.line,
                    &encoded,
                ));
                sig.base64.push(encoded);
            }

            if obfuscation::is_highly_escaped(text) {
                findings.push(finding(
                    "OBF-002",
                    Severity::Medium,
                    Category::Obfuscation,
                    "Escape-sequence encoded string",
                    format!(
                        "{} escape sequences make up most of the string",
                        obfuscation::escape_sequence_count(text)
                    ),
                    &file.path,
                    s.line,
                    text,
                ));
                sig.escaped.push(text.to_string());
            }

            for hex in obfuscation::find_hex_substrings(text) {
                if hex.len() >= LONG_HEX {
                    findings.push(finding(
                        "OBF-003",
                        Severity::Low,
                        Category::Obfuscation,
                        "Long hex string",
                        format!("{} hex digits in a row", hex.len()),
                        &file.path,
                        s.line,
                        &hex,
                    ));
                }
                sig.hex.push(hex);
            }

            for ip in obfuscation::find_ipv4_addresses(text) {
                findings.push(finding(
                    "NET-001",
                    Severity::Medium,
                    Category::NetworkIndicator,
                    "Hard-coded IP address",
                    format!("Literal address {}", ip),
                    &file.path,
                    s.line,
                    &ip,
                ));
                sig.ip_addresses.push(ip);
            }

            for url in obfuscation::find_urls(text) {
                findings.push(finding(
                    "NET-002",
                    Severity::Info,
                    Category::NetworkIndicator,
                    "Hard-coded URL",
                    format!("Literal URL {}", url),
                    &file.path,
                    s.line,
                    &url,
                ));
                sig.urls.push(url);
            }

            if text.len() >= ENTROPY_MIN_LEN && obfuscation::string_entropy(text) >= ENTROPY_THRESHOLD {
                findings.push(finding(
                    "ENT-001",
                    Severity::Low,
                    Category::Entropy,
                    "High-entropy string",
                    format!(
                        "Entropy {:.2} nats over {} characters",
                        obfuscation::string_entropy(text),
                        text.len()
                    ),
                    &file.path,
                    s.line,
                    text,
                ));
                sig.high_entropy.push(text.to_string());
            }
        }

        if !file.strings.is_empty() {
            sig.mean_entropy = entropy_sum / file.strings.len() as f64;
        }
        signals.push(sig);
    }

    findings.sort_by(|a, b| a.severity.cmp(&b.severity));
    let severity = findings
        .first()
        .map(|f| f.severity)
        .unwrap_or(Severity::Info);
    debug!("Static assessment: {} findings, verdict {}", findings.len(), severity);

    StaticVerdict {
        severity,
        suspicious: severity <= Severity::Medium,
        findings,
        files: signals,
    }
}

/// Static scan of a single local file
pub fn scan_file(path: &Path) -> Result<StaticVerdict> {
    let bytes = std::fs::read(path)?;
    let source = String::from_utf8_lossy(&bytes);
    let file = FileStrings {
        path: path.display().to_string(),
        strings: extract_string_literals(&source),
    };
    Ok(assess(&[file]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(strings: &[&str]) -> FileStrings {
        FileStrings {
            path: "index.js".into(),
            strings: strings
                .iter()
                .map(|s| ExtractedString {
                    value: s.to_string(),
                    line: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_extract_literals() {
        let src = "const a = \"hello\";\nlet b = 'wor\\'ld';\nconst c = `tmpl`;\nconst d = \"\";\n";
        let lits = extract_string_literals(src);
        let values: Vec<&str> = lits.iter().map(|l| l.value.as_str()).collect();
        assert_eq!(values, vec!["hello", "wor\\'ld", "tmpl"]);
        assert_eq!(lits[1].line, Some(2));
    }

    #[test]
    fn test_data_file_falls_back_to_lines() {
        let lits = extract_string_literals("first line\n\n  second  \n");
        assert_eq!(lits.len(), 2);
        assert_eq!(lits[1].value, "second");
        assert_eq!(lits[1].line, Some(3));
    }

    #[test]
    fn test_clean_strings_are_info() {
        let verdict = assess(&[file(&["hello world", "use strict"])]);
        assert!(verdict.findings.is_empty());
        assert_eq!(verdict.severity, Severity::Info);
        assert!(!verdict.suspicious);
        assert_eq!(verdict.files[0].string_count, 2);
    }

    #[test]
    fn test_payload_and_ip() {
        let payload = "aGVsbG8gd29ybGQgdGhpcyBpcyBhIHRlc3Q=";
        let verdict = assess(&[file(&[payload, "10.13.37.1"])]);

        assert_eq!(verdict.severity, Severity::Medium);
        assert!(verdict.suspicious);
        assert_eq!(verdict.files[0].base64, vec![payload.to_string()]);
        assert_eq!(verdict.files[0].ip_addresses, vec!["10.13.37.1".to_string()]);
        let ids: Vec<&str> = verdict.findings.iter().map(|f| f.id.as_str()).collect();
        assert!(ids.contains(&"OBF-001"));
        assert!(ids.contains(&"NET-001"));
    }

    #[test]
    fn test_long_payload_is_high() {
        let payload = "QUJDREVGR0hJSktMTU5PUFFSU1RVVldYWVphYmNkZWZnaGlqa2xtbm9wcXJzdHV2d3h5ejAxMjM0NTY3ODkrLw".repeat(2);
        let verdict = assess(&[file(&[&payload])]);
        assert_eq!(verdict.severity, Severity::High);
        assert_eq!(verdict.count_by_severity().get(&Severity::High), Some(&1));
    }

    #[test]
    fn test_escaped_string() {
        let verdict = assess(&[file(&[r"\x72\x65\x71\x75\x69\x72\x65"])]);
        assert_eq!(verdict.findings[0].id, "OBF-002");
        assert_eq!(verdict.files[0].escaped.len(), 1);
    }

    #[test]
    fn test_parse_string_report() {
        let doc = serde_json::json!({
            "Files": [
                {"Path": "setup.py", "Strings": ["import os", "aGVsbG8gd29ybGQgdGhpcyBpcyBhIHRlc3Q="]},
                {"Path": "empty.py"}
            ]
        });
        let files = parse_string_report(&doc).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].strings.len(), 2);
        assert!(files[1].strings.is_empty());

        assert!(parse_string_report(&serde_json::json!({"Files": "nope"})).is_err());
    }

    #[test]
    fn test_scan_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("install.js");
        std::fs::write(
            &path,
            "const u = \"https://cdn.example.com/x.js\";\nconst p = \"U29tZVNlY3JldFZhbHVl\";\n",
        )
        .unwrap();

        let verdict = scan_file(&path).unwrap();
        let obf = verdict.findings.iter().find(|f| f.id == "OBF-001").unwrap();
        assert_eq!(obf.location.line, Some(2));
        assert_eq!(verdict.files[0].urls, vec!["https://cdn.example.com/x.js".to_string()]);
    }
}
