//! Parse, identify, classify, fan out. Run as a pool.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::beacon::RawEvent;
use crate::counter::ClassifiedEvent;
use crate::stats::{bump, PipelineStats};
use crate::taxonomy::Classifier;

/// Turn one raw line into a classified event; `None` for non-beacon lines.
pub fn classify_line(classifier: &Classifier, line: &str) -> Option<ClassifiedEvent> {
    let raw = RawEvent::parse(line);
    if raw.is_empty() {
        return None;
    }
    Some(ClassifiedEvent {
        visitor: raw.visitor_id(),
        node: classifier.classify(&raw.target_url, &raw.time),
    })
}

/// Both destinations of a classified event.
#[derive(Clone)]
pub struct FanOut {
    pub page_views: mpsc::Sender<Arc<ClassifiedEvent>>,
    pub unique_visitors: mpsc::Sender<Arc<ClassifiedEvent>>,
}

impl FanOut {
    /// Deliver to both counters. Fails only if a counter has gone away.
    pub async fn send(
        &self,
        event: ClassifiedEvent,
    ) -> Result<(), mpsc::error::SendError<Arc<ClassifiedEvent>>> {
        let event = Arc::new(event);
        self.page_views.send(Arc::clone(&event)).await?;
        self.unique_visitors.send(event).await
    }
}

/// One pool member. Workers share the line queue and exit when it closes.
pub async fn run_worker(
    id: usize,
    lines: Arc<Mutex<mpsc::Receiver<String>>>,
    classifier: Arc<Classifier>,
    fan_out: FanOut,
    stats: Arc<PipelineStats>,
) {
    loop {
        let line = lines.lock().await.recv().await;
        let Some(line) = line else {
            break;
        };
        let Some(event) = classify_line(&classifier, &line) else {
            continue;
        };
        bump(&stats.beacons);
        tracing::trace!(worker = id, ?event, "classified");
        if fan_out.send(event).await.is_err() {
            tracing::warn!(worker = id, "counter queue closed");
            break;
        }
    }
    tracing::debug!(worker = id, "worker drained");
}
