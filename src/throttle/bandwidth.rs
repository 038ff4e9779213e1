//! Sub-interval bandwidth throttler.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace};

use super::cancel::CancellationToken;
use super::clock::{Clock, SystemClock};
use crate::error::{Result, ThrottleError};

/// Default number of budget resets per second (50 ms windows).
pub const DEFAULT_SUB_INTERVALS_PER_SECOND: u32 = 20;
/// Finest supported granularity: one reset per millisecond.
const MAX_SUB_INTERVALS_PER_SECOND: u32 = 1000;
/// Upper bound of the random delay added to every wake-up.
const MAX_JITTER_MS: u64 = 1;

/// Construction parameters for a [`BandwidthThrottler`].
#[derive(Debug, Clone)]
pub struct BandwidthConfig {
    /// Ceiling that later rate changes are clamped to
    pub absolute_max_bytes_per_second: u64,
    /// Number of budget resets per second, a divisor of 1000
    pub sub_intervals_per_second: u32,
    /// Share of the rate available to payload bytes, in (0, 1]
    pub payload_fraction: f64,
}

impl BandwidthConfig {
    /// Default parameters for the given absolute maximum.
    pub fn new(absolute_max_bytes_per_second: u64) -> Self {
        Self {
            absolute_max_bytes_per_second,
            sub_intervals_per_second: DEFAULT_SUB_INTERVALS_PER_SECOND,
            payload_fraction: 1.0,
        }
    }

    /// Check that the parameters describe an exact, non-empty schedule.
    pub fn validate(&self) -> Result<()> {
        validate_sub_intervals(self.sub_intervals_per_second)?;
        if !(self.payload_fraction > 0.0 && self.payload_fraction <= 1.0) {
            return Err(ThrottleError::InvalidArgument(format!(
                "payload fraction must be in (0, 1], got {}",
                self.payload_fraction
            )));
        }
        validate_budget(
            adjust(self.absolute_max_bytes_per_second, self.payload_fraction),
            self.sub_intervals_per_second,
        )
    }
}

/// Sub-intervals must split a second into whole, equal milliseconds.
pub(crate) fn validate_sub_intervals(sub_intervals: u32) -> Result<()> {
    if sub_intervals == 0
        || sub_intervals > MAX_SUB_INTERVALS_PER_SECOND
        || MAX_SUB_INTERVALS_PER_SECOND % sub_intervals != 0
    {
        return Err(ThrottleError::InvalidArgument(format!(
            "sub-intervals per second must divide 1000, got {}",
            sub_intervals
        )));
    }
    Ok(())
}

/// Every sub-interval must be able to carry at least one byte.
pub(crate) fn validate_budget(
    adjusted_max_bytes_per_second: u64,
    sub_intervals: u32,
) -> Result<()> {
    if adjusted_max_bytes_per_second < sub_intervals as u64 {
        return Err(ThrottleError::InvalidArgument(format!(
            "rate of {} bytes/s is below one byte per sub-interval ({} per second)",
            adjusted_max_bytes_per_second, sub_intervals
        )));
    }
    Ok(())
}

/// Live budgeting state of a throttler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottlingParams {
    /// Configured ceiling, already clamped to the absolute maximum
    pub max_bytes_per_second: u64,
    /// Ceiling after the payload fraction is applied
    pub adjusted_max_bytes_per_second: u64,
    /// Number of budget resets per second
    pub sub_intervals_per_second: u32,
    /// Bytes still grantable before the next reset
    pub remaining_bytes_in_sub_interval: u64,
    /// Clock time of the next budget reset
    pub next_reset_ms: u64,
    /// Position of the current sub-interval within its second
    pub sub_interval_index: u32,
}

impl ThrottlingParams {
    fn new(max_bytes_per_second: u64, fraction: f64, sub_intervals: u32, now_ms: u64) -> Self {
        let mut params = Self {
            max_bytes_per_second,
            adjusted_max_bytes_per_second: adjust(max_bytes_per_second, fraction),
            sub_intervals_per_second: sub_intervals,
            remaining_bytes_in_sub_interval: 0,
            next_reset_ms: 0,
            sub_interval_index: 0,
        };
        params.start_sub_interval(now_ms);
        params
    }

    /// Length of one sub-interval in milliseconds.
    pub fn interval_ms(&self) -> u64 {
        1000 / self.sub_intervals_per_second as u64
    }

    /// Nominal budget of a sub-interval, rounded down.
    pub fn bytes_per_sub_interval(&self) -> u64 {
        self.adjusted_max_bytes_per_second / self.sub_intervals_per_second as u64
    }

    /// Budget of the sub-interval at `index` within a second.
    ///
    /// Budgets follow the cumulative schedule `floor(adjusted * k / N)`, so
    /// the sub-intervals of every whole second add up to exactly
    /// `adjusted_max_bytes_per_second` and each one gets
    /// `floor(adjusted / N)` or one byte more.
    pub fn budget_for(&self, index: u32) -> u64 {
        let adjusted = self.adjusted_max_bytes_per_second as u128;
        let n = self.sub_intervals_per_second as u128;
        let index = index as u128;
        (adjusted * (index + 1) / n - adjusted * index / n) as u64
    }

    fn start_sub_interval(&mut self, now_ms: u64) {
        self.sub_interval_index = 0;
        self.remaining_bytes_in_sub_interval = self.budget_for(0);
        self.next_reset_ms = now_ms + self.interval_ms();
    }

    /// Refill the budget if the current sub-interval has ended.
    ///
    /// Returns how many sub-intervals elapsed. The reset time stays on its
    /// original grid, and windows that passed without a call are skipped
    /// rather than granted retroactively.
    fn reset_if_expired(&mut self, now_ms: u64) -> u64 {
        if now_ms < self.next_reset_ms {
            return 0;
        }
        let interval = self.interval_ms();
        let elapsed = (now_ms - self.next_reset_ms) / interval + 1;
        self.next_reset_ms += elapsed * interval;
        let n = self.sub_intervals_per_second as u64;
        self.sub_interval_index = ((self.sub_interval_index as u64 + elapsed) % n) as u32;
        self.remaining_bytes_in_sub_interval = self.budget_for(self.sub_interval_index);
        elapsed
    }
}

fn adjust(max_bytes_per_second: u64, fraction: f64) -> u64 {
    (max_bytes_per_second as f64 * fraction).floor() as u64
}

/// Counters describing what a throttler has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthStats {
    /// Number of positive allowances handed out
    pub grants: u64,
    /// Sum of all allowances
    pub bytes_granted: u64,
    /// Number of times a caller had to sleep for the next sub-interval
    pub waits: u64,
    /// Number of sub-intervals elapsed since construction or the last rate change
    pub resets: u64,
}

struct ThrottleState {
    params: ThrottlingParams,
    stats: BandwidthStats,
}

enum Grant {
    Allowed(usize),
    WaitUntil { deadline_ms: u64, interval_ms: u64 },
}

/// Bounds byte throughput by splitting every second into sub-intervals.
///
/// Each sub-interval carries `adjusted_max_bytes_per_second / sub_intervals`
/// bytes of budget, with the remainder spread over the second so that
/// every second adds up to the full rate. Callers that find it exhausted sleep until the next
/// reset. State sits behind a mutex, so one throttler can be shared by
/// several streams through an `Arc` without overdrawing a sub-interval.
/// Grants are not FIFO.
pub struct BandwidthThrottler {
    clock: Arc<dyn Clock>,
    absolute_max_bytes_per_second: u64,
    payload_fraction: f64,
    state: Mutex<ThrottleState>,
}

impl BandwidthThrottler {
    /// Create a throttler on the system clock with default sub-intervals.
    pub fn new(absolute_max_bytes_per_second: u64) -> Result<Self> {
        Self::with_config(
            BandwidthConfig::new(absolute_max_bytes_per_second),
            Arc::new(SystemClock::new()),
        )
    }

    /// Create a throttler with explicit parameters and time source.
    pub fn with_config(config: BandwidthConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let params = ThrottlingParams::new(
            config.absolute_max_bytes_per_second,
            config.payload_fraction,
            config.sub_intervals_per_second,
            clock.now_ms(),
        );

        debug!(
            max_bytes_per_second = params.max_bytes_per_second,
            sub_intervals = params.sub_intervals_per_second,
            budget = params.bytes_per_sub_interval(),
            "Creating bandwidth throttler"
        );

        Ok(Self {
            clock,
            absolute_max_bytes_per_second: config.absolute_max_bytes_per_second,
            payload_fraction: config.payload_fraction,
            state: Mutex::new(ThrottleState {
                params,
                stats: BandwidthStats::default(),
            }),
        })
    }

    /// Change the rate limit, in kilobits per second.
    ///
    /// The new budget applies immediately: the current sub-interval is
    /// restarted with a full allowance at the new rate. Rates that leave a
    /// sub-interval with less than one byte are rejected and the previous
    /// rate stays in force.
    pub fn set_rate_limit_kbps(&self, kbps: i64) -> Result<()> {
        if kbps <= 0 {
            return Err(ThrottleError::InvalidArgument(format!(
                "rate limit must be positive, got {} kbps",
                kbps
            )));
        }

        let requested = (kbps as u64).saturating_mul(1024) / 8;
        let max_bytes_per_second = requested.min(self.absolute_max_bytes_per_second);
        let adjusted = adjust(max_bytes_per_second, self.payload_fraction);
        let now = self.clock.now_ms();

        let mut state = self.state.lock();
        let params = &mut state.params;
        validate_budget(adjusted, params.sub_intervals_per_second)?;
        params.max_bytes_per_second = max_bytes_per_second;
        params.adjusted_max_bytes_per_second = adjusted;
        params.start_sub_interval(now);

        debug!(
            kbps = kbps,
            max_bytes_per_second = max_bytes_per_second,
            clamped = requested > max_bytes_per_second,
            budget = params.budget_for(0),
            "Rate limit changed"
        );
        Ok(())
    }

    /// Block until some bytes may be transferred and return how many.
    ///
    /// The result is between 1 and `requested`. A request of zero bytes
    /// returns zero without waiting.
    pub fn get_allowed_bytes(&self, requested: usize) -> usize {
        loop {
            match self.try_grant(requested) {
                Grant::Allowed(allowed) => return allowed,
                Grant::WaitUntil {
                    deadline_ms,
                    interval_ms,
                } => self.sleep_until(deadline_ms, interval_ms),
            }
        }
    }

    /// Like [`get_allowed_bytes`](Self::get_allowed_bytes), but gives up
    /// with [`ThrottleError::Cancelled`] once `token` is cancelled.
    pub fn get_allowed_bytes_cancellable(
        &self,
        requested: usize,
        token: &CancellationToken,
    ) -> Result<usize> {
        loop {
            match self.try_grant(requested) {
                Grant::Allowed(allowed) => return Ok(allowed),
                Grant::WaitUntil {
                    deadline_ms,
                    interval_ms,
                } => {
                    if token.is_cancelled() {
                        return Err(ThrottleError::Cancelled);
                    }
                    self.sleep_until(deadline_ms, interval_ms);
                }
            }
        }
    }

    fn try_grant(&self, requested: usize) -> Grant {
        if requested == 0 {
            return Grant::Allowed(0);
        }

        let now = self.clock.now_ms();
        let mut state = self.state.lock();

        let elapsed = state.params.reset_if_expired(now);
        state.stats.resets += elapsed;

        let allowed = (requested as u64).min(state.params.remaining_bytes_in_sub_interval);
        if allowed > 0 {
            state.params.remaining_bytes_in_sub_interval -= allowed;
            state.stats.grants += 1;
            state.stats.bytes_granted += allowed;
            trace!(
                requested = requested,
                allowed = allowed,
                remaining = state.params.remaining_bytes_in_sub_interval,
                "Granted bytes"
            );
            return Grant::Allowed(allowed as usize);
        }

        state.stats.waits += 1;
        trace!(
            requested = requested,
            next_reset_ms = state.params.next_reset_ms,
            "Sub-interval budget exhausted"
        );
        Grant::WaitUntil {
            deadline_ms: state.params.next_reset_ms,
            interval_ms: state.params.interval_ms(),
        }
    }

    fn sleep_until(&self, deadline_ms: u64, interval_ms: u64) {
        // Jitter stays shorter than a sub-interval so a wake-up never skips one
        let max_jitter = MAX_JITTER_MS.min(interval_ms - 1);
        let jitter = rand::thread_rng().gen_range(0..=max_jitter);
        let delay = deadline_ms.saturating_sub(self.clock.now_ms()) + jitter;
        if delay > 0 {
            self.clock.sleep(Duration::from_millis(delay));
        }
    }

    /// Current configured ceiling in bytes per second.
    pub fn max_bytes_per_second(&self) -> u64 {
        self.state.lock().params.max_bytes_per_second
    }

    /// Current ceiling after the payload fraction.
    pub fn adjusted_max_bytes_per_second(&self) -> u64 {
        self.state.lock().params.adjusted_max_bytes_per_second
    }

    /// Number of budget resets per second.
    pub fn sub_intervals_per_second(&self) -> u32 {
        self.state.lock().params.sub_intervals_per_second
    }

    /// Nominal budget of a sub-interval, rounded down.
    pub fn bytes_per_sub_interval(&self) -> u64 {
        self.state.lock().params.bytes_per_sub_interval()
    }

    /// Snapshot of the budgeting state.
    pub fn params(&self) -> ThrottlingParams {
        self.state.lock().params.clone()
    }

    /// Snapshot of the grant and wait counters.
    pub fn stats(&self) -> BandwidthStats {
        self.state.lock().stats
    }
}

impl std::fmt::Debug for BandwidthThrottler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BandwidthThrottler")
            .field("absolute_max_bytes_per_second", &self.absolute_max_bytes_per_second)
            .field("payload_fraction", &self.payload_fraction)
            .field("params", &state.params)
            .finish()
    }
}
