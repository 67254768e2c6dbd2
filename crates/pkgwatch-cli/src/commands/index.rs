//! Index command - rebuild the indicator index from stored results

use anyhow::{Context, Result};
use colored::Colorize;
use std::sync::Arc;

use pkgwatch_core::index::{Collection, IndexBuilder};
use pkgwatch_core::query::MemoryIndex;
use pkgwatch_core::PipelineConfig;

use super::banner;

/// Rebuild the index and save it to the configured directory
pub async fn run(config: &PipelineConfig) -> Result<()> {
    let bucket = config.require_results_bucket()?;
    let store = bucket.open().context("Failed to open results bucket")?;
    let index = Arc::new(MemoryIndex::new());

    banner::print_header("Index Build");
    println!("{} {}", "Source:".dimmed(), bucket);
    println!();

    let stats = IndexBuilder::new(store, index.clone())
        .build()
        .await
        .context("Index build failed")?;
    index
        .save(&config.index_dir)
        .with_context(|| format!("Failed to save index to {}", config.index_dir.display()))?;

    for collection in Collection::ALL {
        println!(
            "  {:<10} {} documents",
            collection.to_string(),
            index.len(collection).to_string().bold()
        );
    }
    println!();
    let status = if stats.skipped > 0 {
        banner::status_warn()
    } else {
        banner::status_ok()
    };
    println!(
        "{} {} results indexed, {} skipped",
        status, stats.results, stats.skipped
    );
    println!("{} {}", "Saved to:".dimmed(), config.index_dir.display());
    Ok(())
}
