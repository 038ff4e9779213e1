//! Throttling and rate measurement primitives.

mod bandwidth;
mod cancel;
mod clock;
mod discrete;
mod measurer;

pub use bandwidth::{
    BandwidthConfig, BandwidthStats, BandwidthThrottler, ThrottlingParams,
    DEFAULT_SUB_INTERVALS_PER_SECOND,
};
pub use cancel::CancellationToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use discrete::{DiscreteTimePeriodsThrottler, Throttler};
pub use measurer::{OpsPerSecondMeasurer, RateListener};
