//! Passive operations-per-second measurement.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::clock::{Clock, SystemClock};

/// Minimum time between two reported measurements.
const MEASUREMENT_WINDOW_MS: u64 = 1000;

/// Receives measured rates.
pub trait RateListener: Send + Sync {
    /// Called once per elapsed measurement window.
    fn on_rate_measured(&self, ops_per_second: u64);
}

impl<F> RateListener for F
where
    F: Fn(u64) + Send + Sync,
{
    fn on_rate_measured(&self, ops_per_second: u64) {
        self(ops_per_second)
    }
}

struct MeasurementState {
    ops_since_last_measurement: u64,
    last_measurement_ms: Option<u64>,
}

/// Counts operations and reports their rate roughly once a second.
///
/// Never blocks. The listener runs on the thread whose operation closed
/// the window.
pub struct OpsPerSecondMeasurer {
    clock: Arc<dyn Clock>,
    listener: Box<dyn RateListener>,
    state: Mutex<MeasurementState>,
}

impl OpsPerSecondMeasurer {
    /// Create a measurer on the system clock.
    pub fn new<L: RateListener + 'static>(listener: L) -> Self {
        Self::with_clock(listener, Arc::new(SystemClock::new()))
    }

    /// Create a measurer on an explicit time source.
    pub fn with_clock<L: RateListener + 'static>(listener: L, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            listener: Box::new(listener),
            state: Mutex::new(MeasurementState {
                ops_since_last_measurement: 0,
                last_measurement_ms: None,
            }),
        }
    }

    /// Record a single operation.
    pub fn record_operation(&self) {
        self.record_operations(1);
    }

    /// Record `count` operations at once.
    pub fn record_operations(&self, count: u64) {
        let now = self.clock.now_ms();

        let measured = {
            let mut state = self.state.lock();
            let last = *state.last_measurement_ms.get_or_insert(now);
            state.ops_since_last_measurement += count;

            let elapsed = now.saturating_sub(last);
            if elapsed > MEASUREMENT_WINDOW_MS {
                let rate = state.ops_since_last_measurement * 1000 / elapsed;
                state.ops_since_last_measurement = 0;
                state.last_measurement_ms = Some(now);
                Some((rate, elapsed))
            } else {
                None
            }
        };

        if let Some((rate, elapsed)) = measured {
            trace!(ops_per_second = rate, elapsed_ms = elapsed, "Rate measured");
            self.listener.on_rate_measured(rate);
        }
    }

    /// Operations recorded since the last report.
    pub fn pending_operations(&self) -> u64 {
        self.state.lock().ops_since_last_measurement
    }
}
