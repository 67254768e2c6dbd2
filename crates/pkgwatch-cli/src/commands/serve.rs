//! Serve command - indicator search over HTTP

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;

use pkgwatch_core::index::Collection;
use pkgwatch_core::query::{router, MemoryIndex, QueryService};
use pkgwatch_core::PipelineConfig;

/// Serve `POST /query` until Ctrl-C
pub async fn run(config: &PipelineConfig) -> Result<()> {
    let index = Arc::new(
        MemoryIndex::open(&config.index_dir)
            .with_context(|| format!("Failed to load index from {}", config.index_dir.display()))?,
    );
    for collection in Collection::ALL {
        tracing::info!("Loaded {} {} documents", index.len(collection), collection);
    }

    let app = router(Arc::new(QueryService::new(index)));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("Query server failed")?;
    Ok(())
}
