//! Job status command - read a load job from the journal

use anyhow::{Context, Result};

use pkgwatch_core::loader::{JobRunner, LocalWarehouse};
use pkgwatch_core::PipelineConfig;

use super::banner;
use crate::output;

/// Print a persisted job's state and errors
pub async fn run(config: &PipelineConfig, job_id: &str) -> Result<()> {
    let warehouse = LocalWarehouse::open(&config.warehouse_dir).with_context(|| {
        format!("Failed to open warehouse at {}", config.warehouse_dir.display())
    })?;
    let status = warehouse
        .status(job_id)
        .await
        .with_context(|| format!("No status for job {}", job_id))?;

    banner::print_header("Job Status");
    output::print_job_status(&status);
    Ok(())
}
