//! Version command implementation

use colored::Colorize;
use pkgwatch_core::{Ecosystem, PipelineConfig};
use super::banner;

/// Print versions, supported registries and the effective configuration
pub fn run(config: &PipelineConfig) {
    banner::print_banner();

    println!("{}", "Components:".white().bold());
    println!("  CLI:     v{}", env!("CARGO_PKG_VERSION"));
    println!("  Core:    v{}", pkgwatch_core::VERSION);
    println!();

    println!("{}", "Registries:".white().bold());
    for ecosystem in Ecosystem::ALL {
        println!(
            "  {} {:<10} window {}s",
            "-".dimmed(),
            ecosystem.as_str(),
            config.feed_window(ecosystem).num_seconds()
        );
    }
    println!();

    println!("{}", "Configuration:".white().bold());
    print_setting("Job topic", config.job_topic.as_deref());
    print_setting("Subscription", config.worker_subscription.as_deref());
    print_setting("Notifications", config.notification_topic.as_deref());
    print_setting("Results", config.results_bucket.as_deref());
    print_setting("Static results", config.static_results_bucket.as_deref());
    println!("  {:<15} {}", "Warehouse", config.warehouse_dir.display());
    println!("  {:<15} {}", "Index", config.index_dir.display());
    println!("  {:<15} {}", "Port", config.port);
    println!("  {:<15} {}", "Image tag", config.image_tag);
    println!();
}

fn print_setting(label: &str, value: Option<&str>) {
    match value {
        Some(v) => println!("  {:<15} {}", label, v),
        None => println!("  {:<15} {}", label, "not set".dimmed()),
    }
}
