//! Edge downsampling.
//!
//! A reading is only worth sending if at least one metric it shares with the
//! last accepted reading of the same sensor moved by more than that metric's
//! threshold.

use std::collections::HashMap;

use tracing::trace;

use crate::config::ThresholdMap;
use crate::reading::{MetricMap, Reading};

/// Per-sensor change-threshold filter.
#[derive(Debug, Default)]
pub struct DownsampleFilter {
    /// Last accepted metric map, keyed by sensor id
    last_accepted: HashMap<String, MetricMap>,
}

impl DownsampleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `reading` differs enough from the last accepted one.
    ///
    /// Does not update any state. A missing threshold counts as 0 and the
    /// comparison is strict, so an unchanged value never passes.
    pub fn should_publish(&self, reading: &Reading, thresholds: &ThresholdMap) -> bool {
        let Some(last) = self.last_accepted.get(&reading.sensor_id) else {
            return true;
        };

        reading.readings.iter().any(|(metric, value)| {
            last.get(metric).is_some_and(|previous| {
                let threshold = thresholds.get(metric).copied().unwrap_or(0.0);
                (value - previous).abs() > threshold
            })
        })
    }

    /// Evaluate `reading` and, if it passes, make it the new snapshot.
    ///
    /// Error readings are rejected without being evaluated.
    pub fn accept(&mut self, reading: &Reading, thresholds: &ThresholdMap) -> bool {
        if !reading.is_ok() {
            return false;
        }

        if !self.should_publish(reading, thresholds) {
            trace!(sensor_id = %reading.sensor_id, "Reading suppressed by downsampling");
            return false;
        }

        self.last_accepted
            .insert(reading.sensor_id.clone(), reading.readings.clone());
        true
    }

    /// Last accepted metric map for a sensor.
    pub fn last_accepted(&self, sensor_id: &str) -> Option<&MetricMap> {
        self.last_accepted.get(sensor_id)
    }

    /// Drop the snapshot for a sensor so its next reading passes.
    pub fn forget(&mut self, sensor_id: &str) {
        self.last_accepted.remove(sensor_id);
    }

    pub fn len(&self) -> usize {
        self.last_accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_accepted.is_empty()
    }
}
