//! Runtime configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StardustResult, ValidationError};

/// Configuration of the threaded [`Stardust`](crate::Stardust) runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StardustConfig {
    /// Scheduler tick: how long change events are buffered before the
    /// engine sees them as one batch.
    pub tx_buffering_ms: u64,
    /// Max queued change events before sources block.
    pub event_queue_capacity: usize,
    /// Max queued control messages (rule operations, source registration).
    pub control_queue_capacity: usize,
    /// Max flushed inputs waiting for the engine thread.
    pub batch_queue_capacity: usize,
}

impl Default for StardustConfig {
    fn default() -> Self {
        Self {
            tx_buffering_ms: 8,
            event_queue_capacity: 4096,
            control_queue_capacity: 1024,
            batch_queue_capacity: 1024,
        }
    }
}

impl StardustConfig {
    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json(json: &str) -> StardustResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            ValidationError::InvalidConfig {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Scheduler tick interval, never zero.
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tx_buffering_ms.max(1))
    }

    /// The configuration with every capacity raised to at least 1.
    #[must_use]
    pub fn clamped(&self) -> Self {
        Self {
            tx_buffering_ms: self.tx_buffering_ms.max(1),
            event_queue_capacity: self.event_queue_capacity.max(1),
            control_queue_capacity: self.control_queue_capacity.max(1),
            batch_queue_capacity: self.batch_queue_capacity.max(1),
        }
    }
}
