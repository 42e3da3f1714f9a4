use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::Dispatch;

pub mod beacon;
pub mod bucket;
pub mod config;
pub mod counter;
pub mod stats;
pub mod storage;
pub mod store;
pub mod tail;
pub mod taxonomy;
pub mod worker;

pub use config::Config;
pub use stats::{PipelineStats, StatsSnapshot};
pub use store::{CountingStore, MemoryStore, RedisStore, SqliteStore};
pub use taxonomy::Classifier;

use tail::LineSource;
use worker::FanOut;

/// The running pipeline:
/// line source -> workers -> {PV, UV} counters -> storage writer.
///
/// Every stage talks through a bounded queue, so a slow store eventually
/// stalls the line source instead of dropping lines.
pub struct Pipeline {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    stats: Arc<PipelineStats>,
    diagnostics: Dispatch,
}

impl Pipeline {
    /// Check the store, open the log, and spawn every stage.
    ///
    /// Fails without spawning anything if the store doesn't answer or the log
    /// can't be opened. Must be called within a tokio runtime.
    pub async fn start(
        config: &Config,
        store: Arc<dyn CountingStore>,
        classifier: Classifier,
        diagnostics: Dispatch,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        {
            let store = Arc::clone(&store);
            tokio::task::spawn_blocking(move || store.ping())
                .await
                .context("store probe task failed")?
                .context("counting store unavailable")?;
        }
        let source = LineSource::open(
            &config.log_file_path,
            config.from_start,
            config.poll_interval(),
        )
        .with_subscriber(diagnostics.clone())
        .await?
        .with_progress_every(config.progress_every());

        let cancel = CancellationToken::new();
        let stats = Arc::new(PipelineStats::default());
        let (line_tx, line_rx) = mpsc::channel(config.line_queue());
        let (pv_tx, pv_rx) = mpsc::channel(config.count_queue());
        let (uv_tx, uv_rx) = mpsc::channel(config.count_queue());
        let (storage_tx, storage_rx) = mpsc::channel(config.count_queue());

        let mut tasks = JoinSet::new();
        let reader = source.run(line_tx, cancel.clone(), Arc::clone(&stats));
        spawn_logged(&mut tasks, &diagnostics, reader);

        let lines = Arc::new(Mutex::new(line_rx));
        let classifier = Arc::new(classifier);
        let fan_out = FanOut {
            page_views: pv_tx,
            unique_visitors: uv_tx,
        };
        for id in 0..config.workers {
            let worker = worker::run_worker(
                id,
                Arc::clone(&lines),
                Arc::clone(&classifier),
                fan_out.clone(),
                Arc::clone(&stats),
            );
            spawn_logged(&mut tasks, &diagnostics, worker);
        }
        drop(fan_out);

        let pv = counter::run_pv_counter(pv_rx, storage_tx.clone(), Arc::clone(&stats));
        spawn_logged(&mut tasks, &diagnostics, pv);
        let uv = counter::run_uv_counter(
            uv_rx,
            storage_tx,
            Arc::clone(&store),
            config.uv_ttl(),
            Arc::clone(&stats),
        );
        spawn_logged(&mut tasks, &diagnostics, uv);
        let writer = storage::run_writer(storage_rx, Arc::clone(&store), Arc::clone(&stats));
        spawn_logged(&mut tasks, &diagnostics, writer);
        let ping = store::keep_alive(store, config.keepalive(), cancel.clone());
        spawn_logged(&mut tasks, &diagnostics, ping);

        tracing::dispatcher::with_default(&diagnostics, || {
            tracing::info!(
                path = %config.log_file_path.display(),
                workers = config.workers,
                "pipeline started"
            );
        });
        Ok(Self {
            cancel,
            tasks,
            stats,
            diagnostics,
        })
    }

    /// Token that stops the line source; the rest of the pipeline then
    /// drains and exits.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Wait for every stage to finish. Stages only finish after cancellation,
    /// once the queues behind them are empty.
    pub async fn join(mut self) -> anyhow::Result<StatsSnapshot> {
        let mut failed = 0;
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                failed += 1;
                tracing::dispatcher::with_default(&self.diagnostics, || {
                    tracing::error!(error = %e, "pipeline task failed");
                });
            }
        }
        let snapshot = self.stats.snapshot();
        tracing::dispatcher::with_default(&self.diagnostics, || {
            tracing::info!(?snapshot, "pipeline stopped");
        });
        anyhow::ensure!(failed == 0, "{failed} pipeline task(s) failed");
        Ok(snapshot)
    }

    /// Cancel, drain, and wait.
    pub async fn shutdown(self) -> anyhow::Result<StatsSnapshot> {
        self.cancel.cancel();
        self.join().await
    }
}

/// Spawn a stage that logs through `diagnostics`.
fn spawn_logged<F>(tasks: &mut JoinSet<()>, diagnostics: &Dispatch, task: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tasks.spawn(task.with_subscriber(diagnostics.clone()));
}
