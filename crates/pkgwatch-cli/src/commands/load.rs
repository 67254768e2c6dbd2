//! Load command - replace a table with the current contents of a results bucket

use anyhow::{Context, Result};
use colored::Colorize;

use pkgwatch_core::loader::{load_batch, AnalysisKind, LoadTarget, LocalWarehouse};
use pkgwatch_core::{LoadError, PipelineConfig, PipelineError};

use super::banner;
use crate::output;

/// Run one batch load and print its outcome
pub async fn run(config: &PipelineConfig, kind: AnalysisKind) -> Result<()> {
    let bucket = match kind {
        AnalysisKind::Dynamic => config.require_results_bucket()?,
        AnalysisKind::Static => config.require_static_results_bucket()?,
    };
    let source = bucket.open().context("Failed to open results bucket")?;
    let target = LoadTarget::for_kind(kind, source, config.max_bad_records)
        .context("Failed to build load target")?;
    let warehouse = LocalWarehouse::open(&config.warehouse_dir).with_context(|| {
        format!("Failed to open warehouse at {}", config.warehouse_dir.display())
    })?;

    banner::print_header(&format!("Load {}", kind));
    println!("{} {}", "Source:".dimmed(), bucket);
    println!("{} {}", "Table:".dimmed(), target.table);
    println!();

    match load_batch(&warehouse, &target).await {
        Ok(status) => {
            output::print_job_status(&status);
            Ok(())
        }
        Err(PipelineError::Load(e @ LoadError::JobFailed { .. })) => {
            println!("{} {}", banner::status_fail(), e);
            output::print_record_errors(e.record_errors());
            anyhow::bail!("Load of {} results failed", kind)
        }
        Err(e) => Err(e).context("Load job could not run"),
    }
}
