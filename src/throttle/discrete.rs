//! Fixed operations-per-second throttling.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::cancel::CancellationToken;
use super::clock::{Clock, SystemClock};
use crate::error::{Result, ThrottleError};

/// Something that delays the caller so that operations stay under a rate.
pub trait Throttler: Send + Sync {
    /// Account for one operation, blocking first if the rate would be exceeded.
    fn throttle(&self);
}

impl<T: Throttler + ?Sized> Throttler for Arc<T> {
    fn throttle(&self) {
        (**self).throttle()
    }
}

struct SegmentState {
    ops_since_sleep: u64,
    last_sleep_ms: Option<u64>,
}

/// Allows a fixed number of operations per discrete time segment.
///
/// Once a segment's quota is used up the next caller sleeps until the
/// segment ends, then a new segment starts from the wake-up time. Callers
/// are serialized while one of them is cooling down.
pub struct DiscreteTimePeriodsThrottler {
    clock: Arc<dyn Clock>,
    ops_per_discrete_segment: u64,
    discrete_segment_ms: u64,
    state: Mutex<SegmentState>,
}

impl DiscreteTimePeriodsThrottler {
    /// Spread `ops_per_second` evenly over `segments_per_second` segments.
    ///
    /// Both the second and the rate must split exactly: `segments_per_second`
    /// has to divide 1000 and `ops_per_second` has to be a positive multiple
    /// of `segments_per_second`. Anything else would silently run at a
    /// different rate than requested.
    pub fn new(ops_per_second: u64, segments_per_second: u32) -> Result<Self> {
        let segments = segments_per_second as u64;
        if segments == 0 || segments > 1000 || 1000 % segments != 0 {
            return Err(ThrottleError::InvalidArgument(format!(
                "segments per second must divide 1000, got {}",
                segments_per_second
            )));
        }
        if ops_per_second % segments != 0 {
            return Err(ThrottleError::InvalidArgument(format!(
                "{} ops/s does not split evenly into {} segments",
                ops_per_second, segments_per_second
            )));
        }
        Self::with_segment(
            ops_per_second / segments,
            1000 / segments,
            Arc::new(SystemClock::new()),
        )
    }

    /// Allow `ops_per_discrete_segment` operations every `discrete_segment_ms`.
    pub fn with_segment(
        ops_per_discrete_segment: u64,
        discrete_segment_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if ops_per_discrete_segment == 0 {
            return Err(ThrottleError::InvalidArgument(
                "operations per segment must be positive".to_string(),
            ));
        }
        if discrete_segment_ms == 0 {
            return Err(ThrottleError::InvalidArgument(
                "segment length must be positive".to_string(),
            ));
        }

        debug!(
            ops_per_segment = ops_per_discrete_segment,
            segment_ms = discrete_segment_ms,
            "Creating discrete time periods throttler"
        );

        Ok(Self {
            clock,
            ops_per_discrete_segment,
            discrete_segment_ms,
            state: Mutex::new(SegmentState {
                ops_since_sleep: 0,
                last_sleep_ms: None,
            }),
        })
    }

    /// Like [`Throttler::throttle`], but returns [`ThrottleError::Cancelled`]
    /// instead of cooling down once `token` is cancelled.
    pub fn throttle_cancellable(&self, token: &CancellationToken) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(sleep_ms) = self.pending_cool_down(&mut state) {
            if sleep_ms > 0 && token.is_cancelled() {
                return Err(ThrottleError::Cancelled);
            }
            self.cool_down(&mut state, sleep_ms);
        }
        state.ops_since_sleep += 1;
        Ok(())
    }

    /// Milliseconds to sleep before the next operation, or `None` while the
    /// current segment still has quota.
    fn pending_cool_down(&self, state: &mut SegmentState) -> Option<u64> {
        let now = self.clock.now_ms();
        let last_sleep_ms = *state.last_sleep_ms.get_or_insert(now);

        if state.ops_since_sleep + 1 > self.ops_per_discrete_segment {
            Some((last_sleep_ms + self.discrete_segment_ms).saturating_sub(now))
        } else {
            None
        }
    }

    fn cool_down(&self, state: &mut SegmentState, sleep_ms: u64) {
        if sleep_ms > 0 {
            trace!(sleep_ms = sleep_ms, "Segment quota used, cooling down");
            self.clock.sleep(Duration::from_millis(sleep_ms));
        }
        state.ops_since_sleep = 0;
        state.last_sleep_ms = Some(self.clock.now_ms());
    }

    /// Operations allowed per segment.
    pub fn ops_per_discrete_segment(&self) -> u64 {
        self.ops_per_discrete_segment
    }

    /// Segment length in milliseconds.
    pub fn discrete_segment_ms(&self) -> u64 {
        self.discrete_segment_ms
    }
}

impl Throttler for DiscreteTimePeriodsThrottler {
    fn throttle(&self) {
        let mut state = self.state.lock();
        if let Some(sleep_ms) = self.pending_cool_down(&mut state) {
            self.cool_down(&mut state, sleep_ms);
        }
        state.ops_since_sleep += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::clock::ManualClock;

    fn manual_throttler(
        ops: u64,
        segment_ms: u64,
    ) -> (Arc<ManualClock>, DiscreteTimePeriodsThrottler) {
        let clock = Arc::new(ManualClock::new(1_000));
        let throttler =
            DiscreteTimePeriodsThrottler::with_segment(ops, segment_ms, clock.clone()).unwrap();
        (clock, throttler)
    }

    #[test]
    fn test_new_splits_rate_into_segments() {
        let throttler = DiscreteTimePeriodsThrottler::new(100, 10).unwrap();
        assert_eq!(throttler.ops_per_discrete_segment(), 10);
        assert_eq!(throttler.discrete_segment_ms(), 100);
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        assert!(DiscreteTimePeriodsThrottler::new(100, 0).is_err());
        // 19 ops over 10 segments would otherwise run at 10 ops/s
        assert!(DiscreteTimePeriodsThrottler::new(19, 10).is_err());
        // 3 segments leave a 333 ms segment, which is 1001 ms per second
        assert!(DiscreteTimePeriodsThrottler::new(99, 3).is_err());
        assert!(DiscreteTimePeriodsThrottler::new(5, 10).is_err());
        assert!(DiscreteTimePeriodsThrottler::new(0, 10).is_err());

        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        assert!(DiscreteTimePeriodsThrottler::with_segment(1, 0, clock).is_err());
    }

    #[test]
    fn test_segment_quota_passes_without_sleeping() {
        let (clock, throttler) = manual_throttler(5, 100);

        for _ in 0..5 {
            throttler.throttle();
        }
        assert_eq!(clock.sleep_count(), 0);
    }

    #[test]
    fn test_exceeding_quota_sleeps_for_segment() {
        let (clock, throttler) = manual_throttler(5, 100);

        for _ in 0..6 {
            throttler.throttle();
        }
        assert_eq!(clock.sleep_count(), 1);
        assert_eq!(clock.slept_ms(), 100);
        assert_eq!(clock.now_ms(), 1_100);
    }

    #[test]
    fn test_never_more_than_quota_per_segment() {
        let (clock, throttler) = manual_throttler(5, 100);

        let mut unslept_run = 0;
        for _ in 0..26 {
            let sleeps_before = clock.sleep_count();
            throttler.throttle();
            if clock.sleep_count() == sleeps_before {
                unslept_run += 1;
            } else {
                unslept_run = 1;
            }
            assert!(unslept_run <= 5);
        }
        assert_eq!(clock.sleep_count(), 5);
    }

    #[test]
    fn test_no_sleep_when_segment_already_passed() {
        let (clock, throttler) = manual_throttler(2, 100);

        throttler.throttle();
        throttler.throttle();
        clock.advance(150);
        throttler.throttle();

        assert_eq!(clock.sleep_count(), 0);
    }

    #[test]
    fn test_cancellable_throttle() {
        let (clock, throttler) = manual_throttler(1, 100);
        let token = CancellationToken::new();

        throttler.throttle_cancellable(&token).unwrap();
        token.cancel();
        assert!(matches!(
            throttler.throttle_cancellable(&token),
            Err(ThrottleError::Cancelled)
        ));
        assert_eq!(clock.sleep_count(), 0);
    }

    #[test]
    fn test_even_split_runs_at_requested_rate() {
        let throttler = DiscreteTimePeriodsThrottler::new(20, 4).unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let throttler = DiscreteTimePeriodsThrottler::with_segment(
            throttler.ops_per_discrete_segment(),
            throttler.discrete_segment_ms(),
            clock.clone(),
        )
        .unwrap();

        // 40 ops at 20 ops/s: the first segment is free, then 7 cool-downs
        for _ in 0..40 {
            throttler.throttle();
        }
        assert_eq!(clock.sleep_count(), 7);
        assert_eq!(clock.now_ms(), 1_750);
    }

    #[test]
    fn test_cancellable_passes_through_quota_and_expired_segments() {
        let (clock, throttler) = manual_throttler(2, 100);
        let token = CancellationToken::new();
        token.cancel();

        throttler.throttle_cancellable(&token).unwrap();
        throttler.throttle_cancellable(&token).unwrap();
        clock.advance(100);
        // Quota used, but the segment is over so nothing would sleep
        throttler.throttle_cancellable(&token).unwrap();
        assert_eq!(clock.sleep_count(), 0);
    }

    #[test]
    fn test_shared_through_arc() {
        let (clock, throttler) = manual_throttler(3, 50);
        let shared: Arc<dyn Throttler> = Arc::new(throttler);

        for _ in 0..4 {
            shared.throttle();
        }
        assert_eq!(clock.sleep_count(), 1);
    }
}
