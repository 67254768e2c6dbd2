//! Worker command - consume analysis jobs until interrupted

use anyhow::{Context, Result};
use colored::Colorize;
use std::sync::Arc;
use tokio::sync::watch;

use pkgwatch_core::bus::open_endpoint;
use pkgwatch_core::feeds::FEED_TIMEOUT;
use pkgwatch_core::manager::ManagerRegistry;
use pkgwatch_core::sandbox::PodmanSandbox;
use pkgwatch_core::worker::{run_supervised, RetryPolicy, Worker};
use pkgwatch_core::{http_client, PipelineConfig};

use super::banner;

/// Run the worker loop with bus-failure restarts
pub async fn run(config: &PipelineConfig) -> Result<()> {
    let subscription = config.require_worker_subscription()?;
    let results = config.require_results_bucket()?;
    let static_results = config.static_results_bucket()?;

    let endpoint =
        open_endpoint(subscription, config.ack_deadline()).context("Failed to open subscription")?;
    let http = http_client(FEED_TIMEOUT).context("Failed to create HTTP client")?;
    let managers = Arc::new(ManagerRegistry::with_defaults(&config.image_tag, http));
    let sandbox = Arc::new(PodmanSandbox::new(config.sandbox_timeout()));

    let mut worker = Worker::new(
        endpoint.bus,
        endpoint.name,
        managers,
        sandbox,
        results.open().context("Failed to open results bucket")?,
    )
    .with_lease_renewal(config.ack_deadline());
    if let Some(bucket) = static_results {
        worker = worker.with_static_results(
            bucket.open().context("Failed to open static results bucket")?,
        );
    }
    if let Some(topic) = &config.notification_topic {
        let notify = open_endpoint(topic, config.ack_deadline())
            .context("Failed to open notification topic")?;
        worker = worker.with_notifications(notify.bus, notify.name);
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing current job");
            let _ = stop_tx.send(true);
        }
    });

    banner::print_header("Worker");
    println!("{} {}", "Subscription:".dimmed(), subscription);
    println!("{} {}", "Results:".dimmed(), results);
    println!();

    let stats = run_supervised(&worker, stop_rx, &RetryPolicy::default())
        .await
        .context("Worker stopped after repeated bus failures")?;

    println!();
    println!(
        "{} {} completed, {} discarded, {} left for redelivery",
        banner::status_ok(),
        stats.completed.to_string().green().bold(),
        stats.discarded,
        stats.retried
    );
    Ok(())
}
