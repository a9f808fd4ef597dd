//! Batching publisher.
//!
//! Accepted records wait in a FIFO queue and are flushed in groups of
//! `batch_size`. Flush triggers are only evaluated when something is
//! enqueued, so a short batch sits in the queue until the next enqueue or an
//! explicit [`Publisher::flush`]. Every message of a batch is sent on its own;
//! the first failure ends the attempt and everything not yet delivered goes
//! to the offline buffer. There is no retry.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::collector::{BatchHandler, TickBatch};
use crate::config::{ThresholdMap, TransportConfig};
use crate::filter::DownsampleFilter;
use crate::offline::OfflineBuffer;
use crate::reading::PublishRecord;
use crate::transport::{Transport, TransportError};

/// Batching settings for the publisher.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Number of queued records that triggers a flush
    pub batch_size: usize,

    /// Time since the last successful batch after which any enqueue flushes
    pub max_batch_wait: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self::from_transport(&TransportConfig::default())
    }
}

impl PublisherConfig {
    pub fn new(batch_size: usize, max_batch_wait: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_batch_wait,
        }
    }

    pub fn from_transport(config: &TransportConfig) -> Self {
        Self::new(
            config.batch_size,
            Duration::from_secs(config.max_batch_wait_secs),
        )
    }
}

/// Read-only counters for external reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublisherStats {
    /// Messages delivered to the sink
    pub publish_count: u64,

    /// Flush attempts that hit a transport failure
    pub error_count: u64,

    pub queue_size: usize,
    pub offline_buffer_size: usize,

    /// End of the last fully successful batch
    pub last_batch_time: DateTime<Utc>,
}

/// Result of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Queue was empty, nothing to flush
    Empty,

    /// Every message of the batch was delivered
    Delivered(usize),

    /// Delivery stopped at a failure; the rest went to the offline buffer
    Failed { delivered: usize, buffered: usize },
}

/// Result of an explicit offline re-drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedrainOutcome {
    pub delivered: usize,
    pub remaining: usize,
}

struct PublisherState {
    filter: DownsampleFilter,
    queue: VecDeque<PublishRecord>,
    offline: OfflineBuffer,
    publish_count: u64,
    error_count: u64,
    last_batch_time: DateTime<Utc>,
    last_batch_instant: Instant,
}

impl PublisherState {
    fn move_to_offline(&mut self, records: Vec<PublishRecord>) {
        let count = records.len();
        if let Err(e) = self.offline.append(records) {
            error!(error = %e, "Failed to persist offline buffer");
        }
        info!(
            moved = count,
            offline_buffer_size = self.offline.len(),
            "Saved undelivered messages to offline buffer"
        );
    }
}

/// Downsampling, batching publisher bound to one transport.
pub struct Publisher {
    config: PublisherConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<PublisherState>,
}

impl Publisher {
    /// Create a publisher. `offline` should already hold any entries
    /// persisted by a previous run.
    pub fn new(
        config: PublisherConfig,
        transport: Arc<dyn Transport>,
        offline: OfflineBuffer,
    ) -> Self {
        let capacity = config.batch_size.min(1024);
        Self {
            config,
            transport,
            state: Mutex::new(PublisherState {
                filter: DownsampleFilter::new(),
                queue: VecDeque::with_capacity(capacity),
                offline,
                publish_count: 0,
                error_count: 0,
                last_batch_time: Utc::now(),
                last_batch_instant: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Filter `records` and enqueue the accepted ones, flushing if due.
    ///
    /// Error readings are dropped before the filter. Returns the number of
    /// records accepted into the queue.
    pub async fn publish(&self, records: Vec<PublishRecord>, thresholds: &ThresholdMap) -> usize {
        let mut state = self.state.lock().await;

        let mut accepted = 0;
        for record in records {
            if !record.reading.is_ok() {
                continue;
            }
            if state.filter.accept(&record.reading, thresholds) {
                state.queue.push_back(record);
                accepted += 1;
            }
        }

        if accepted == 0 {
            return 0;
        }

        debug!(
            accepted = accepted,
            queue_size = state.queue.len(),
            "Enqueued accepted readings"
        );

        while state.queue.len() >= self.config.batch_size {
            debug!(
                batch_size = self.config.batch_size,
                "Flushing queue: batch size threshold reached"
            );
            self.flush_batch(&mut state).await;
        }

        if !state.queue.is_empty() && state.last_batch_instant.elapsed() >= self.config.max_batch_wait {
            debug!(
                batch_size = state.queue.len(),
                max_batch_wait_secs = self.config.max_batch_wait.as_secs(),
                "Flushing queue: max batch wait elapsed"
            );
            self.flush_batch(&mut state).await;
        }

        accepted
    }

    /// Flush everything in the queue, one batch at a time.
    ///
    /// Must be called at shutdown; a short batch is otherwise never sent.
    pub async fn flush(&self) -> Vec<FlushOutcome> {
        let mut state = self.state.lock().await;
        let mut outcomes = Vec::new();
        while !state.queue.is_empty() {
            outcomes.push(self.flush_batch(&mut state).await);
        }
        outcomes
    }

    /// Send up to `batch_size` records from the front of the queue.
    async fn flush_batch(&self, state: &mut PublisherState) -> FlushOutcome {
        let count = self.config.batch_size.min(state.queue.len());
        if count == 0 {
            return FlushOutcome::Empty;
        }
        let batch: Vec<PublishRecord> = state.queue.drain(..count).collect();

        let mut delivered = 0;
        let mut failure: Option<TransportError> = None;
        for record in &batch {
            match self.send(record).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        state.publish_count += delivered as u64;

        match failure {
            None => {
                state.last_batch_time = Utc::now();
                state.last_batch_instant = Instant::now();
                info!(
                    published = delivered,
                    total = state.publish_count,
                    "Published batch"
                );
                FlushOutcome::Delivered(delivered)
            }
            Some(e) => {
                state.error_count += 1;
                warn!(
                    error = %e,
                    delivered = delivered,
                    undelivered = batch.len() - delivered,
                    error_count = state.error_count,
                    "Batch publish failed"
                );
                let remainder: Vec<PublishRecord> = batch.into_iter().skip(delivered).collect();
                let buffered = remainder.len();
                state.move_to_offline(remainder);
                FlushOutcome::Failed {
                    delivered,
                    buffered,
                }
            }
        }
    }

    async fn send(&self, record: &PublishRecord) -> Result<(), TransportError> {
        let message = record
            .to_message()
            .map_err(|e| TransportError::Rejected(format!("failed to encode message: {}", e)))?;
        self.transport.publish(&message).await
    }

    /// Retry buffered messages, oldest first.
    ///
    /// Stops at the first failure, leaving that message and everything after
    /// it in the buffer. Never called automatically.
    pub async fn redrain_offline(&self) -> RedrainOutcome {
        let mut state = self.state.lock().await;
        let pending = state.offline.take_front(usize::MAX);
        let total = pending.len();

        let mut delivered = 0;
        let mut failure: Option<TransportError> = None;
        for record in &pending {
            match self.send(record).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        state.publish_count += delivered as u64;
        if let Some(e) = failure {
            state.error_count += 1;
            warn!(error = %e, delivered = delivered, "Offline re-drain stopped at failure");
            state
                .offline
                .restore_front(pending.into_iter().skip(delivered).collect());
        }

        if total > 0 {
            if let Err(e) = state.offline.persist() {
                error!(error = %e, "Failed to persist offline buffer");
            }
            info!(
                delivered = delivered,
                remaining = state.offline.len(),
                "Offline buffer re-drain finished"
            );
        }

        RedrainOutcome {
            delivered,
            remaining: state.offline.len(),
        }
    }

    /// Current counters.
    pub async fn stats(&self) -> PublisherStats {
        let state = self.state.lock().await;
        PublisherStats {
            publish_count: state.publish_count,
            error_count: state.error_count,
            queue_size: state.queue.len(),
            offline_buffer_size: state.offline.len(),
            last_batch_time: state.last_batch_time,
        }
    }

    /// Flush remaining messages.
    pub async fn shutdown(&self) {
        info!("Shutting down publisher...");
        let outcomes = self.flush().await;
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, FlushOutcome::Failed { .. }))
            .count();
        info!(batches = outcomes.len(), failed = failed, "Publisher shutdown complete");
    }
}

#[async_trait]
impl BatchHandler for Publisher {
    async fn handle(&self, batch: TickBatch) {
        self.publish(batch.records, &batch.thresholds).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{DeviceMetadata, Reading};
    use crate::sensor::testing::metrics;
    use crate::transport::testing::MockTransport;

    fn device() -> DeviceMetadata {
        DeviceMetadata {
            device_id: "rpi_001".to_string(),
            customer_id: "customer_001".to_string(),
            location: "lab".to_string(),
        }
    }

    fn record(sensor_id: &str, temperature: f64) -> PublishRecord {
        PublishRecord::new(
            Reading::ok(sensor_id, "BMP280", metrics(&[("temperature", temperature)])),
            device(),
        )
    }

    /// `count` records from distinct sensors, so all pass cold start.
    fn distinct_records(count: usize) -> Vec<PublishRecord> {
        (0..count).map(|i| record(&format!("s{}", i), 20.0)).collect()
    }

    fn publisher(batch_size: usize, transport: Arc<MockTransport>) -> Publisher {
        Publisher::new(
            PublisherConfig::new(batch_size, Duration::from_secs(3600)),
            transport,
            OfflineBuffer::in_memory(),
        )
    }

    #[test]
    fn test_publisher_config_from_transport() {
        let config = PublisherConfig::default();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_batch_wait, Duration::from_secs(5));
        assert_eq!(PublisherConfig::new(0, Duration::ZERO).batch_size, 1);
    }

    #[tokio::test]
    async fn test_full_batch_flushes_once() {
        let transport = Arc::new(MockTransport::healthy());
        let publisher = publisher(5, transport.clone());

        let accepted = publisher.publish(distinct_records(5), &ThresholdMap::new()).await;
        assert_eq!(accepted, 5);
        assert_eq!(transport.calls(), 5);

        let stats = publisher.stats().await;
        assert_eq!(stats.publish_count, 5);
        assert_eq!(stats.error_count, 0);
        assert_eq!(stats.queue_size, 0);
    }

    #[tokio::test]
    async fn test_short_batch_waits_for_explicit_flush() {
        let transport = Arc::new(MockTransport::healthy());
        let publisher = publisher(5, transport.clone());

        publisher.publish(distinct_records(3), &ThresholdMap::new()).await;
        assert_eq!(transport.calls(), 0);
        assert_eq!(publisher.stats().await.queue_size, 3);

        let outcomes = publisher.flush().await;
        assert_eq!(outcomes, vec![FlushOutcome::Delivered(3)]);
        assert_eq!(transport.calls(), 3);
        assert_eq!(publisher.stats().await.publish_count, 3);
    }

    #[tokio::test]
    async fn test_batches_preserve_fifo_order() {
        let transport = Arc::new(MockTransport::healthy());
        let publisher = publisher(2, transport.clone());

        publisher.publish(distinct_records(3), &ThresholdMap::new()).await;
        publisher.flush().await;

        let ids: Vec<String> = transport
            .delivered_json()
            .iter()
            .map(|v| v["sensor_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["s0", "s1", "s2"]);
    }

    #[tokio::test]
    async fn test_elapsed_wait_flushes_on_next_enqueue() {
        let transport = Arc::new(MockTransport::healthy());
        let publisher = Publisher::new(
            PublisherConfig::new(100, Duration::from_millis(20)),
            transport.clone(),
            OfflineBuffer::in_memory(),
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        // Elapsing alone does nothing; the enqueue triggers it
        assert_eq!(transport.calls(), 0);

        publisher.publish(distinct_records(2), &ThresholdMap::new()).await;
        assert_eq!(transport.calls(), 2);
        assert_eq!(publisher.stats().await.queue_size, 0);
    }

    #[tokio::test]
    async fn test_total_failure_moves_batch_offline() {
        let transport = Arc::new(MockTransport::failing());
        let publisher = publisher(4, transport.clone());

        publisher.publish(distinct_records(4), &ThresholdMap::new()).await;

        let stats = publisher.stats().await;
        assert_eq!(stats.publish_count, 0);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.offline_buffer_size, 4);
        assert_eq!(stats.queue_size, 0);
        // Single attempt: stops at the first failure, no retries
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_buffers_undelivered_only() {
        let transport = Arc::new(MockTransport::scripted(vec![true, true, false], true));
        let publisher = publisher(4, transport.clone());

        let before = publisher.stats().await.last_batch_time;
        publisher.publish(distinct_records(4), &ThresholdMap::new()).await;

        let stats = publisher.stats().await;
        assert_eq!(stats.publish_count, 2);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.offline_buffer_size, 2);
        assert_eq!(stats.last_batch_time, before);
        assert_eq!(transport.delivered_count(), 2);
    }

    #[tokio::test]
    async fn test_error_readings_never_enqueued() {
        let transport = Arc::new(MockTransport::healthy());
        let publisher = publisher(1, transport.clone());

        let failed = PublishRecord::new(Reading::error("s0", "BMP280", "timeout", 1), device());
        assert_eq!(publisher.publish(vec![failed], &ThresholdMap::new()).await, 0);
        assert_eq!(transport.calls(), 0);

        // The error did not seed a snapshot, so cold start still applies
        let mut limits = ThresholdMap::new();
        limits.insert("temperature".to_string(), 100.0);
        assert_eq!(publisher.publish(vec![record("s0", 20.0)], &limits).await, 1);
    }

    #[tokio::test]
    async fn test_downsampling_applies_per_sensor() {
        let transport = Arc::new(MockTransport::healthy());
        let publisher = publisher(1, transport.clone());
        let mut limits = ThresholdMap::new();
        limits.insert("temperature".to_string(), 0.5);

        assert_eq!(publisher.publish(vec![record("a", 20.0)], &limits).await, 1);
        assert_eq!(publisher.publish(vec![record("a", 20.4)], &limits).await, 0);
        assert_eq!(publisher.publish(vec![record("b", 20.4)], &limits).await, 1);
        assert_eq!(publisher.publish(vec![record("a", 20.6)], &limits).await, 1);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_redrain_after_recovery() {
        let transport = Arc::new(MockTransport::failing());
        let publisher = publisher(3, transport.clone());
        publisher.publish(distinct_records(3), &ThresholdMap::new()).await;
        assert_eq!(publisher.stats().await.offline_buffer_size, 3);

        transport.set_healthy(true);
        let outcome = publisher.redrain_offline().await;
        assert_eq!(
            outcome,
            RedrainOutcome {
                delivered: 3,
                remaining: 0
            }
        );

        let stats = publisher.stats().await;
        assert_eq!(stats.publish_count, 3);
        assert_eq!(stats.offline_buffer_size, 0);

        let ids: Vec<String> = transport
            .delivered_json()
            .iter()
            .map(|v| v["sensor_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["s0", "s1", "s2"]);
    }

    #[tokio::test]
    async fn test_redrain_stops_at_failure() {
        let transport = Arc::new(MockTransport::failing());
        let publisher = publisher(3, transport.clone());
        publisher.publish(distinct_records(3), &ThresholdMap::new()).await;

        let transport_calls = transport.calls();
        let outcome = publisher.redrain_offline().await;
        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.remaining, 3);
        assert_eq!(transport.calls(), transport_calls + 1);
        assert_eq!(publisher.stats().await.error_count, 2);
    }

    #[tokio::test]
    async fn test_offline_buffer_persisted_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.json");
        let transport = Arc::new(MockTransport::failing());
        let publisher = Publisher::new(
            PublisherConfig::new(2, Duration::from_secs(3600)),
            transport,
            OfflineBuffer::open(&path),
        );

        publisher.publish(distinct_records(2), &ThresholdMap::new()).await;
        assert_eq!(OfflineBuffer::open(&path).len(), 2);
    }

    #[tokio::test]
    async fn test_batch_handler_uses_tick_thresholds() {
        let transport = Arc::new(MockTransport::healthy());
        let publisher = publisher(1, transport.clone());
        let mut limits = ThresholdMap::new();
        limits.insert("temperature".to_string(), 1.0);

        publisher
            .handle(TickBatch {
                records: vec![record("a", 20.0)],
                thresholds: limits.clone(),
            })
            .await;
        publisher
            .handle(TickBatch {
                records: vec![record("a", 20.5)],
                thresholds: limits,
            })
            .await;
        assert_eq!(transport.calls(), 1);
    }
}
