use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::instrument::WithSubscriber;

use dig_cruncher::{Classifier, Config, CountingStore, Pipeline, RedisStore, SqliteStore};

fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    config.validate()?;

    let diagnostics = config.diagnostics()?;
    let _default = tracing::dispatcher::set_default(&diagnostics);
    tracing::info!(
        path = %config.log_file_path.display(),
        workers = config.workers,
        redis = config.redis_url.is_some(),
        "exec start"
    );

    // No store, no start.
    let store: Arc<dyn CountingStore> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisStore::open(url, config.store_connections())
                .context("opening redis counting store")?,
        ),
        None => Arc::new(
            SqliteStore::open(&config.store_path, config.store_connections()).with_context(
                || format!("opening counting store {}", config.store_path.display()),
            )?,
        ),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async move {
        let pipeline = Pipeline::start(
            &config,
            store,
            Classifier::default(),
            diagnostics.clone(),
        )
        .await?;

        let cancel = pipeline.cancellation();
        let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
                cancel.cancel();
            }
            .with_subscriber(diagnostics),
        );

        let stats = pipeline.join().await?;
        tracing::info!(
            lines = stats.lines_read,
            beacons = stats.beacons,
            pv = stats.pv_requests,
            uv = stats.uv_requests,
            store_errors = stats.store_errors,
            "exec end"
        );
        Ok::<_, anyhow::Error>(())
    })
}
