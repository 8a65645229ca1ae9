//! Recording sink implementations for tests

use crate::event::{CronMetric, ProcessEvent};
use crate::{MetricsSink, PersistenceSink};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A persistence sink that records every event it receives
#[derive(Default)]
pub struct RecordingPersistenceSink {
    events: Mutex<Vec<ProcessEvent>>,
    calls: AtomicUsize,
    should_fail: bool,
}

impl RecordingPersistenceSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that always rejects, for isolation tests
    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<ProcessEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn has_event_type(&self, event_type: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.event_type() == event_type)
    }

    /// Wait until at least `n` events were recorded (bounded)
    pub async fn wait_for_events(&self, n: usize) {
        for _ in 0..200 {
            if self.events.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until at least `n` record calls were made (bounded)
    pub async fn wait_for_calls(&self, n: usize) {
        for _ in 0..200 {
            if self.call_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl PersistenceSink for RecordingPersistenceSink {
    async fn record(&self, event: &ProcessEvent) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail {
            return Err("mock failure".to_string());
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// A metrics sink that records every observation it receives
#[derive(Default)]
pub struct RecordingMetricsSink {
    metrics: Mutex<Vec<CronMetric>>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> Vec<CronMetric> {
        self.metrics.lock().unwrap().clone()
    }

    /// Wait until at least `n` observations were recorded (bounded)
    pub async fn wait_for_metrics(&self, n: usize) {
        for _ in 0..200 {
            if self.metrics.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl MetricsSink for RecordingMetricsSink {
    async fn observe(&self, metric: &CronMetric) -> Result<(), String> {
        self.metrics.lock().unwrap().push(metric.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_recording_sink_records() {
        let sink = RecordingPersistenceSink::new();
        sink.record(&ProcessEvent::Started {
            name: "web".to_string(),
            pid: 7,
            started_at: Utc::now(),
        })
        .await
        .unwrap();

        assert_eq!(sink.call_count(), 1);
        assert!(sink.has_event_type("start"));
    }

    #[tokio::test]
    async fn test_failing_sink_rejects() {
        let sink = RecordingPersistenceSink::failing();
        let result = sink
            .record(&ProcessEvent::Started {
                name: "web".to_string(),
                pid: 7,
                started_at: Utc::now(),
            })
            .await;
        assert!(result.is_err());
        assert!(sink.events().is_empty());
    }
}
