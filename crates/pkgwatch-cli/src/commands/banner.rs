//! CLI banner and branding
//!
//! Shared look for every subcommand.

use colored::Colorize;
use pkgwatch_core::Severity;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Print the main banner
pub fn print_banner() {
    println!();
    println!("{}", "╔═╗╦╔═╔═╗╦ ╦╔═╗╔╦╗╔═╗╦ ╦".cyan());
    println!("{}", "╠═╝╠╩╗║ ╦║║║╠═╣ ║ ║  ╠═╣".cyan());
    println!("{}", "╩  ╩ ╩╚═╝╚╩╝╩ ╩ ╩ ╚═╝╩ ╩".cyan());
    println!();
    println!("  {} v{}", "pkgwatch".white().bold(), VERSION);
    println!();
}

/// Print a compact header for subcommands
pub fn print_header(title: &str) {
    println!();
    println!("{} {}", "pkgwatch".cyan().bold(), format!("| {}", title).dimmed());
    println!("{}", "=".repeat(60).dimmed());
}

/// Print a section divider
pub fn print_divider() {
    println!("{}", "-".repeat(60).dimmed());
}

/// Severity badge
pub fn severity_badge(severity: &Severity) -> String {
    match severity {
        Severity::Critical => format!("{}", " CRITICAL ".on_red().white().bold()),
        Severity::High => format!("{}", " HIGH ".on_yellow().black().bold()),
        Severity::Medium => format!("{}", " MEDIUM ".on_cyan().black()),
        Severity::Low => format!("{}", " LOW ".on_white().black()),
        Severity::Info => format!("{}", " INFO ".dimmed()),
    }
}

/// Status indicators
pub fn status_ok() -> String {
    format!("{}", "[OK]".green().bold())
}

pub fn status_warn() -> String {
    format!("{}", "[WARN]".yellow().bold())
}

pub fn status_fail() -> String {
    format!("{}", "[FAIL]".red().bold())
}
