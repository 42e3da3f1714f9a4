//! PV and UV counting stages.
//!
//! Each classified event reaches both stages. PV passes everything through;
//! UV passes a visitor once per day. Both emit [`IncrementRequest`]s for the
//! storage writer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::beacon::VisitorId;
use crate::bucket::Granularity;
use crate::stats::{bump, PipelineStats};
use crate::store::CountingStore;
use crate::taxonomy::TaxonomyNode;

/// One classified hit, shared read-only by the PV and UV stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedEvent {
    pub visitor: VisitorId,
    pub node: TaxonomyNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    PageView,
    UniqueVisitor,
}

impl CounterKind {
    /// Key prefix in the store.
    pub fn prefix(self) -> &'static str {
        match self {
            CounterKind::PageView => "pv",
            CounterKind::UniqueVisitor => "uv",
        }
    }
}

/// How the storage writer applies a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Add the weight to the resource's score in each sorted set.
    ScoreIncrement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncrementRequest {
    pub kind: CounterKind,
    pub aggregation: Aggregation,
    pub weight: f64,
    pub node: TaxonomyNode,
}

impl IncrementRequest {
    fn new(kind: CounterKind, node: TaxonomyNode) -> Self {
        Self {
            kind,
            aggregation: Aggregation::ScoreIncrement,
            weight: 1.0,
            node,
        }
    }
}

/// Forward one PV request per event.
pub async fn run_pv_counter(
    mut events: mpsc::Receiver<Arc<ClassifiedEvent>>,
    requests: mpsc::Sender<IncrementRequest>,
    stats: Arc<PipelineStats>,
) {
    while let Some(event) = events.recv().await {
        let request = IncrementRequest::new(CounterKind::PageView, event.node.clone());
        if requests.send(request).await.is_err() {
            tracing::warn!("storage queue closed, stopping PV counter");
            return;
        }
        bump(&stats.pv_requests);
    }
    tracing::debug!("PV counter drained");
}

/// Approximate-set key holding the visitors seen on `timestamp`'s day.
pub fn uv_membership_key(timestamp: i64) -> String {
    format!("uv_hpll_{}", Granularity::Day.bucket(timestamp))
}

/// Forward a UV request for each visitor's first event of the day.
///
/// Store failures count as "seen": a missed visitor beats a double count.
pub async fn run_uv_counter(
    mut events: mpsc::Receiver<Arc<ClassifiedEvent>>,
    requests: mpsc::Sender<IncrementRequest>,
    store: Arc<dyn CountingStore>,
    ttl: Duration,
    stats: Arc<PipelineStats>,
) {
    while let Some(event) = events.recv().await {
        let key = uv_membership_key(event.node.timestamp);
        let added = {
            let store = Arc::clone(&store);
            let key = key.clone();
            let visitor = event.visitor.clone();
            tokio::task::spawn_blocking(move || store.add_unique(&key, visitor.as_str(), ttl))
                .await
        };
        let first_seen = match added {
            Ok(Ok(added)) => added,
            Ok(Err(e)) => {
                tracing::warn!(%key, visitor = %event.visitor, error = %e, "UV membership check failed");
                false
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "UV membership task failed");
                false
            }
        };
        if !first_seen {
            bump(&stats.uv_suppressed);
            continue;
        }

        let request = IncrementRequest::new(CounterKind::UniqueVisitor, event.node.clone());
        if requests.send(request).await.is_err() {
            tracing::warn!("storage queue closed, stopping UV counter");
            return;
        }
        bump(&stats.uv_requests);
    }
    tracing::debug!("UV counter drained");
}
