//! The storage writer: "onion" expansion of increment requests.
//!
//! A hit on `/movie/12917.html` at 10:42 bumps resource 12917 in the global
//! and the movie-wide sets for that day, that hour and that minute, so
//! roll-ups at any level are already summed when read.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bucket::Granularity;
use crate::counter::{Aggregation, IncrementRequest};
use crate::stats::{bump, PipelineStats};
use crate::store::CountingStore;

/// Keys touched by one request: every granularity, first global
/// (`pv_day_<ts>`) then scoped to the page type (`pv_movie_day_<ts>`).
pub fn expand_keys(request: &IncrementRequest) -> Vec<String> {
    let prefix = request.kind.prefix();
    let ts = request.node.timestamp;
    let global = Granularity::ALL
        .into_iter()
        .map(|g| format!("{prefix}_{}_{}", g.label(), g.bucket(ts)));
    let scoped = Granularity::ALL.into_iter().map(|g| {
        format!(
            "{prefix}_{}_{}_{}",
            request.node.page_type,
            g.label(),
            g.bucket(ts)
        )
    });
    global.chain(scoped).collect()
}

/// Apply one request to every expanded key. Each key is independent: a
/// failure is returned alongside its key and the rest are still attempted.
pub fn apply(
    store: &dyn CountingStore,
    request: &IncrementRequest,
) -> Vec<(String, anyhow::Result<f64>)> {
    let member = request.node.resource_id.to_string();
    expand_keys(request)
        .into_iter()
        .map(|key| {
            let result = match request.aggregation {
                Aggregation::ScoreIncrement => store.increment(&key, request.weight, &member),
            };
            (key, result)
        })
        .collect()
}

/// Write requests until every producer has hung up.
pub async fn run_writer(
    mut requests: mpsc::Receiver<IncrementRequest>,
    store: Arc<dyn CountingStore>,
    stats: Arc<PipelineStats>,
) {
    while let Some(request) = requests.recv().await {
        let kind = request.kind.prefix();
        let resource = request.node.resource_id;
        let store = Arc::clone(&store);
        let results = match tokio::task::spawn_blocking(move || apply(store.as_ref(), &request))
            .await
        {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(kind, resource, error = %e, "storage task failed");
                bump(&stats.store_errors);
                continue;
            }
        };
        for (key, result) in results {
            match result {
                Ok(score) if score > 0.0 => bump(&stats.store_writes),
                Ok(score) => {
                    tracing::error!(%key, resource, score, "storage increment left a non-positive score");
                    bump(&stats.store_errors);
                }
                Err(e) => {
                    tracing::error!(%key, resource, error = %e, "storage increment failed");
                    bump(&stats.store_errors);
                }
            }
        }
    }
    tracing::debug!("storage writer drained");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::counter::CounterKind;
    use crate::store::MemoryStore;
    use crate::taxonomy::Classifier;

    fn request(kind: CounterKind, url: &str) -> IncrementRequest {
        IncrementRequest {
            kind,
            aggregation: Aggregation::ScoreIncrement,
            weight: 1.0,
            // 2021-05-03T01:02:03Z
            node: Classifier::default().classify(url, "1620003723"),
        }
    }

    #[test]
    fn expands_to_six_keys() {
        let keys = expand_keys(&request(CounterKind::PageView, "/movie/12917.html"));
        assert_eq!(
            keys,
            [
                "pv_day_1620000000",
                "pv_hour_1620003600",
                "pv_min_1620003720",
                "pv_movie_day_1620000000",
                "pv_movie_hour_1620003600",
                "pv_movie_min_1620003720",
            ]
        );
        let keys = expand_keys(&request(CounterKind::UniqueVisitor, "/"));
        assert_eq!(keys.len(), 6);
        assert!(keys.iter().all(|k| k.starts_with("uv_")));
        assert_eq!(keys.iter().filter(|k| k.starts_with("uv_home_")).count(), 3);
    }

    #[test]
    fn applies_to_every_key() {
        let store = MemoryStore::new();
        let req = request(CounterKind::PageView, "/list/42.html");
        apply(&store, &req);
        let results = apply(&store, &req);
        assert!(results.iter().all(|(_, r)| matches!(r, Ok(s) if *s == 2.0)));
        for key in expand_keys(&req) {
            assert_eq!(store.score(&key, "42"), Some(2.0), "{key}");
        }
        assert_eq!(store.keys().len(), 6);
    }

    /// Fails every hour-granularity key.
    struct HourlyOutage(MemoryStore);

    impl CountingStore for HourlyOutage {
        fn increment(&self, key: &str, weight: f64, member: &str) -> anyhow::Result<f64> {
            if key.contains("_hour_") {
                anyhow::bail!("hour shard down");
            }
            self.0.increment(key, weight, member)
        }
        fn add_unique(&self, key: &str, element: &str, ttl: Duration) -> anyhow::Result<bool> {
            self.0.add_unique(key, element, ttl)
        }
        fn ping(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn partial_failure_does_not_block_other_keys() {
        let store = HourlyOutage(MemoryStore::new());
        let results = apply(&store, &request(CounterKind::PageView, "/movie/5.html"));
        assert_eq!(results.len(), 6);
        assert_eq!(results.iter().filter(|(_, r)| r.is_err()).count(), 2);
        assert_eq!(store.0.keys().len(), 4);
    }

    #[tokio::test]
    async fn writer_counts_writes_and_errors() {
        let store = Arc::new(HourlyOutage(MemoryStore::new()));
        let stats = Arc::new(PipelineStats::default());
        let (tx, rx) = mpsc::channel(2);
        let writer = tokio::spawn(run_writer(rx, store.clone(), Arc::clone(&stats)));
        tx.send(request(CounterKind::PageView, "/movie/5.html"))
            .await
            .unwrap();
        tx.send(request(CounterKind::UniqueVisitor, "/movie/5.html"))
            .await
            .unwrap();
        drop(tx);
        writer.await.unwrap();

        let snap = stats.snapshot();
        assert_eq!((snap.store_writes, snap.store_errors), (8, 4));
        assert_eq!(store.0.score("uv_movie_min_1620003720", "5"), Some(1.0));
    }
}
