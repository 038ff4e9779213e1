//! Blocking copy loop used by the command-line tool.

use std::io::{self, Read, Write};

use tracing::debug;

use crate::error::ThrottleError;
use crate::throttle::CancellationToken;

/// Copy `reader` into `writer` until end of stream, returning the byte count.
///
/// The writer is expected to carry the throttling. The loop checks `token`
/// between reads and stops with a cancellation error once it is set.
pub fn copy_until_cancelled<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    token: &CancellationToken,
) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;

    loop {
        if token.is_cancelled() {
            debug!(bytes = total, "Copy cancelled");
            return Err(ThrottleError::Cancelled.into());
        }
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..read])?;
        total += read as u64;
    }

    writer.flush()?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ThrottledWriter;
    use crate::throttle::{BandwidthConfig, BandwidthThrottler, Clock, ManualClock};
    use std::io::Cursor;
    use std::sync::Arc;

    #[test]
    fn test_copies_everything_through_throttle() {
        let clock = Arc::new(ManualClock::new(0));
        let throttler = Arc::new(
            BandwidthThrottler::with_config(BandwidthConfig::new(2000), clock.clone()).unwrap(),
        );
        let data: Vec<u8> = (0..500u32).map(|i| i as u8).collect();

        let mut reader = Cursor::new(data.clone());
        let mut writer = ThrottledWriter::new(Vec::new(), throttler);
        let token = CancellationToken::new();
        let copied = copy_until_cancelled(&mut reader, &mut writer, 64, &token).unwrap();

        assert_eq!(copied, 500);
        assert_eq!(writer.into_inner(), data);
        // 100 bytes per 50ms window
        assert!(clock.now_ms() >= 200);
    }

    #[test]
    fn test_stops_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();

        let mut reader = Cursor::new(vec![1u8; 10]);
        let mut out = Vec::new();
        let err = copy_until_cancelled(&mut reader, &mut out, 4, &token).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(out.is_empty());
    }
}
