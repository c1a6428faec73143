//! Short-lived cache of the bulk sensor push.
//!
//! While sensor spam is running the robot pushes `ALL_SENSORS` at a fixed
//! rate. Reads of individual sensors are answered from the most recent push
//! as long as it is younger than the use-by interval, saving a round trip.

use std::time::Duration;

use tokio::time::Instant;

use rover_types::AttributeType;
use rover_types::sensors::slice_sensor;

use crate::error::{Error, Result};

/// Pushes older than this are ignored unless reconfigured.
pub const DEFAULT_USE_BY: Duration = Duration::from_millis(250);

/// Most recent `ALL_SENSORS` buffer and when it arrived.
#[derive(Debug)]
pub struct ReadCache {
    all_sensors: Option<Vec<u8>>,
    last_updated: Option<Instant>,
    use_by: Duration,
}

impl ReadCache {
    /// Create an empty cache with the given use-by interval.
    pub fn new(use_by: Duration) -> Self {
        Self {
            all_sensors: None,
            last_updated: None,
            use_by,
        }
    }

    /// Replace the cached buffer and timestamp it.
    pub fn update_all_sensors(&mut self, data: &[u8]) {
        self.all_sensors = Some(data.to_vec());
        self.last_updated = Some(Instant::now());
    }

    /// Change how long a push stays valid.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero interval.
    pub fn set_use_by(&mut self, use_by: Duration) -> Result<()> {
        if use_by.is_zero() {
            return Err(Error::invalid_config(
                "read cache use-by interval must be greater than zero",
            ));
        }
        self.use_by = use_by;
        Ok(())
    }

    /// Current use-by interval.
    pub fn use_by(&self) -> Duration {
        self.use_by
    }

    /// Force the next read to miss.
    pub fn invalidate(&mut self) {
        self.all_sensors = None;
    }

    /// Bytes for `attribute` from a fresh push, if any.
    pub fn read(&self, attribute: AttributeType) -> Option<Vec<u8>> {
        let buffer = self.all_sensors.as_deref().filter(|b| !b.is_empty())?;
        let updated = self.last_updated?;
        if updated.elapsed() > self.use_by {
            return None;
        }
        slice_sensor(buffer, attribute).map(<[u8]>::to_vec)
    }
}

impl Default for ReadCache {
    fn default() -> Self {
        Self::new(DEFAULT_USE_BY)
    }
}
