//! Provisr collaborator interfaces
//!
//! The supervision core reports to two optional collaborators: a
//! persistence sink (start/stop events) and a metrics sink (scheduler
//! observations). Both are strictly best-effort: a missing or failing
//! sink never blocks or fails a supervision operation.

mod event;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use event::{CronMetric, ProcessEvent};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Receives start/stop events for history and audit
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn record(&self, event: &ProcessEvent) -> Result<(), String>;
}

/// Receives scheduler gauges and observations
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn observe(&self, metric: &CronMetric) -> Result<(), String>;
}

/// The set of configured sinks, dispatching fire-and-forget
#[derive(Clone, Default)]
pub struct SinkSet {
    persistence: Option<Arc<dyn PersistenceSink>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persistence(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.persistence = Some(sink);
        self
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Hand a process event to the persistence sink on a detached task
    pub fn record(&self, event: ProcessEvent) {
        if let Some(sink) = self.persistence.clone() {
            tokio::spawn(async move {
                if let Err(e) = sink.record(&event).await {
                    warn!("Persistence sink rejected {} event: {}", event.event_type(), e);
                }
            });
        }
    }

    /// Hand a metric to the metrics sink on a detached task
    pub fn observe(&self, metric: CronMetric) {
        if let Some(sink) = self.metrics.clone() {
            tokio::spawn(async move {
                if let Err(e) = sink.observe(&metric).await {
                    warn!("Metrics sink rejected observation for '{}': {}", metric.cronjob(), e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{RecordingMetricsSink, RecordingPersistenceSink};
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_record_reaches_sink() {
        let sink = Arc::new(RecordingPersistenceSink::new());
        let sinks = SinkSet::new().with_persistence(sink.clone());

        sinks.record(ProcessEvent::Started {
            name: "web".to_string(),
            pid: 1,
            started_at: Utc::now(),
        });

        sink.wait_for_events(1).await;
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_sink_is_isolated() {
        let sink = Arc::new(RecordingPersistenceSink::failing());
        let sinks = SinkSet::new().with_persistence(sink.clone());

        // Must not panic or surface the error anywhere
        sinks.record(ProcessEvent::Stopped {
            name: "web".to_string(),
            pid: None,
            stopped_at: Utc::now(),
            last_error: Some("exit 1".to_string()),
        });

        sink.wait_for_calls(1).await;
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_absent_sinks_are_noops() {
        let sinks = SinkSet::new();
        sinks.record(ProcessEvent::Started {
            name: "web".to_string(),
            pid: 1,
            started_at: Utc::now(),
        });
        sinks.observe(CronMetric::ActiveJobs {
            cronjob: "backup".to_string(),
            count: 0,
        });
    }

    #[tokio::test]
    async fn test_observe_reaches_sink() {
        let sink = Arc::new(RecordingMetricsSink::new());
        let sinks = SinkSet::new().with_metrics(sink.clone());

        sinks.observe(CronMetric::JobOutcome {
            cronjob: "backup".to_string(),
            phase: "Succeeded".to_string(),
        });

        sink.wait_for_metrics(1).await;
        assert_eq!(sink.metrics().len(), 1);
    }
}
