//! Output formatting for verdicts and load jobs

use anyhow::Result;
use colored::Colorize;
use pkgwatch_core::loader::{JobState, JobStatus, RecordError};
use pkgwatch_core::static_scan::StaticVerdict;
use pkgwatch_core::Finding;

use crate::commands::banner;

/// Record errors printed before the list is cut short
const MAX_PRINTED_ERRORS: usize = 50;

/// Output format options
#[derive(Clone, Copy)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Format a static verdict according to the specified format
pub fn format_verdict(verdict: &StaticVerdict, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(format_text(verdict)),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(verdict)?),
    }
}

fn format_text(verdict: &StaticVerdict) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "\n{} {}\n",
        "Verdict:".bold(),
        banner::severity_badge(&verdict.severity)
    ));
    output.push_str(&format!("{}\n\n", "=".repeat(60)));

    if verdict.findings.is_empty() {
        output.push_str(&format!("{}\n", "Nothing suspicious found.".green()));
        return output;
    }

    for finding in &verdict.findings {
        output.push_str(&format_finding(finding));
        output.push('\n');
    }
    output
}

fn format_finding(finding: &Finding) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "{} {} {}\n",
        banner::severity_badge(&finding.severity),
        finding.id.bold(),
        finding.title
    ));
    output.push_str(&format!("    {}\n", finding.description));

    match finding.location.line {
        Some(line) => output.push_str(&format!("    Location: {}:{}\n", finding.location.file, line)),
        None => output.push_str(&format!("    Location: {}\n", finding.location.file)),
    }

    if let Some(ref snippet) = finding.location.snippet {
        output.push_str(&format!("    Value: {}\n", snippet.dimmed()));
    }

    output
}

/// Print a load job's summary
pub fn print_job_status(status: &JobStatus) {
    let state = match status.state {
        JobState::Succeeded => status.state.to_string().green().bold(),
        JobState::Failed => status.state.to_string().red().bold(),
        JobState::Pending | JobState::Running => status.state.to_string().yellow().bold(),
    };

    println!("{:<14} {}", "Job:", status.job_id.bold());
    println!("{:<14} {}", "State:", state);
    println!("{:<14} {}", "Table:", status.table);
    println!("{:<14} {}", "Source:", status.source);
    println!("{:<14} v{}", "Schema:", status.schema_version);
    println!("{:<14} {}", "Created:", status.created_at.to_rfc3339());
    if let Some(finished) = status.finished_at {
        println!("{:<14} {}", "Finished:", finished.to_rfc3339());
    }
    if status.state == JobState::Succeeded {
        println!("{:<14} {}", "Objects:", status.objects);
        println!("{:<14} {}", "Rows loaded:", status.rows_loaded.to_string().bold());
    }
    if let Some(digest) = &status.source_digest {
        println!("{:<14} {}", "Digest:", digest.dimmed());
    }
    if let Some(reason) = &status.failure {
        println!("{:<14} {}", "Failure:", reason.red());
    }

    if status.bad_records > 0 {
        println!();
        println!(
            "{} {} bad record(s)",
            banner::status_warn(),
            status.bad_records
        );
        print_record_errors(&status.errors);
    }
}

/// Print per-record load errors
pub fn print_record_errors(errors: &[RecordError]) {
    if errors.is_empty() {
        return;
    }
    banner::print_divider();
    for error in errors.iter().take(MAX_PRINTED_ERRORS) {
        println!(
            "  {}#{} {}",
            error.object.white(),
            error.index,
            error.message.dimmed()
        );
    }
    if errors.len() > MAX_PRINTED_ERRORS {
        println!(
            "  {}",
            format!("... and {} more", errors.len() - MAX_PRINTED_ERRORS).dimmed()
        );
    }
    banner::print_divider();
}
