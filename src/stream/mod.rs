//! `std::io` adapters that apply throttlers and measurers to byte streams.

mod copy;
mod measuring;
mod throttled;

pub use copy::copy_until_cancelled;
pub use measuring::BandwidthMeasuringWriter;
pub use throttled::{BandwidthLimitedReader, ThrottledReader, ThrottledWriter};
