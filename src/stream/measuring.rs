//! Rate-measuring writer.

use std::io::{self, Write};
use std::sync::Arc;

use crate::throttle::OpsPerSecondMeasurer;

/// Reports every byte written through it to an [`OpsPerSecondMeasurer`].
///
/// Only bytes the inner writer accepted are counted. The wrapper never
/// blocks or throttles.
pub struct BandwidthMeasuringWriter<W> {
    inner: W,
    measurer: Arc<OpsPerSecondMeasurer>,
}

impl<W: Write> BandwidthMeasuringWriter<W> {
    pub fn new(inner: W, measurer: Arc<OpsPerSecondMeasurer>) -> Self {
        Self { inner, measurer }
    }

    /// Write a single byte and record it.
    pub fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.write_all(&[byte])
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for BandwidthMeasuringWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        if written > 0 {
            self.measurer.record_operations(written as u64);
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::{ManualClock, OpsPerSecondMeasurer};
    use parking_lot::Mutex;

    #[test]
    fn test_measures_single_and_bulk_writes() {
        let clock = Arc::new(ManualClock::new(0));
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let measurer = Arc::new(OpsPerSecondMeasurer::with_clock(
            move |rate: u64| sink.lock().push(rate),
            clock.clone(),
        ));
        let mut writer = BandwidthMeasuringWriter::new(Vec::new(), measurer.clone());

        writer.write_byte(1).unwrap();
        writer.write_all(&[2u8; 1999]).unwrap();
        assert_eq!(measurer.pending_operations(), 2000);
        assert!(reports.lock().is_empty());

        clock.advance(2000);
        writer.write_byte(3).unwrap();

        assert_eq!(*reports.lock(), vec![2001 * 1000 / 2000]);
        assert_eq!(writer.get_ref().len(), 2001);
    }

    #[test]
    fn test_failed_write_is_not_counted() {
        let measurer = Arc::new(OpsPerSecondMeasurer::new(|_rate: u64| {}));
        let mut buf = [0u8; 2];
        let mut writer = BandwidthMeasuringWriter::new(&mut buf[..], measurer.clone());

        writer.write_all(b"ab").unwrap();
        assert!(writer.write_byte(b'c').is_err());
        assert_eq!(measurer.pending_operations(), 2);
    }
}
