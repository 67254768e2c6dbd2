//! Poll command - publish jobs for recently changed packages

use anyhow::{Context, Result};
use colored::Colorize;
use std::time::Duration;

use pkgwatch_core::bus::open_endpoint;
use pkgwatch_core::feeds::{source_for, Poller, FEED_TIMEOUT};
use pkgwatch_core::{http_client, Ecosystem, PipelineConfig};

use super::banner;

/// Run one poll cycle, or keep cycling every `interval` seconds until Ctrl-C
pub async fn run(config: &PipelineConfig, ecosystem: Ecosystem, interval: Option<u64>) -> Result<()> {
    let topic = config.require_job_topic()?;
    let endpoint = open_endpoint(topic, config.ack_deadline()).context("Failed to open job topic")?;
    let http = http_client(FEED_TIMEOUT).context("Failed to create HTTP client")?;
    let source = source_for(ecosystem, http)?;
    let poller = Poller::new(source, endpoint.bus, endpoint.name, config.feed_window(ecosystem));

    let Some(secs) = interval else {
        let published = poller
            .poll()
            .await
            .with_context(|| format!("Poll of {} failed", ecosystem))?;
        println!(
            "{} {} {} jobs published",
            banner::status_ok(),
            ecosystem.to_string().white().bold(),
            published
        );
        return Ok(());
    };

    let pause = Duration::from_secs(secs.max(1));
    config
        .check_poll_interval(ecosystem, pause)
        .context("Choose a shorter --interval or widen the feed window")?;
    tracing::info!("Polling {} every {:?}", ecosystem, pause);
    loop {
        match poller.poll().await {
            Ok(published) => println!(
                "{} {} {} jobs published",
                banner::status_ok(),
                ecosystem.to_string().white().bold(),
                published
            ),
            // The next cycle covers the same window again
            Err(e) => {
                tracing::error!("Poll of {} failed: {}", ecosystem, e);
                println!("{} {} {}", banner::status_fail(), ecosystem, e);
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }
    Ok(())
}
