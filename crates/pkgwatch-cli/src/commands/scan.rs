//! Scan command implementation

use crate::output::{self, OutputFormat};
use anyhow::{Context, Result};
use colored::Colorize;
use pkgwatch_core::static_scan::{scan_file, StaticVerdict};
use pkgwatch_core::Severity;
use std::path::PathBuf;

/// Run the static detectors on one file and print the verdict
pub fn run(path: PathBuf, format: OutputFormat) -> Result<()> {
    if !path.is_file() {
        anyhow::bail!("Not a file: {}", path.display());
    }

    tracing::info!("Scanning: {}", path.display());
    let verdict = scan_file(&path).with_context(|| format!("Scan of {} failed", path.display()))?;

    println!("{}", output::format_verdict(&verdict, format)?);
    if matches!(format, OutputFormat::Text) {
        print_summary(&path, &verdict);
    }
    Ok(())
}

fn print_summary(path: &std::path::Path, verdict: &StaticVerdict) {
    let counts = verdict.count_by_severity();

    let high = counts.get(&Severity::High).unwrap_or(&0);
    let medium = counts.get(&Severity::Medium).unwrap_or(&0);
    let low = counts.get(&Severity::Low).unwrap_or(&0);
    let info = counts.get(&Severity::Info).unwrap_or(&0);
    let strings: usize = verdict.files.iter().map(|f| f.string_count).sum();

    println!();
    println!("{}", "=".repeat(60));
    println!("File: {}", path.display().to_string().bold());
    println!("Strings examined: {}", strings);
    println!();

    if verdict.findings.is_empty() {
        println!("{}", "No suspicious strings found.".green().bold());
    } else {
        println!(
            "Found {} signal(s):",
            verdict.findings.len().to_string().bold()
        );
        if *high > 0 {
            println!("  {} {}", high.to_string().yellow().bold(), "HIGH".yellow());
        }
        if *medium > 0 {
            println!("  {} {}", medium.to_string().cyan(), "MEDIUM".cyan());
        }
        if *low > 0 {
            println!("  {} LOW", low);
        }
        if *info > 0 {
            println!("  {} {}", info, "INFO".dimmed());
        }
    }
    println!("{}", "=".repeat(60));
}
