//! Throttling decorators for `std::io` readers and writers.

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::throttle::{BandwidthThrottler, CancellationToken, Throttler};

/// A writer that never moves bytes faster than its [`BandwidthThrottler`].
///
/// Each `write` call waits for one allowance and writes exactly that many
/// bytes, so `write_all` keeps going until the whole buffer is through.
/// `flush` is not throttled. Errors from the inner writer are returned
/// unchanged.
pub struct ThrottledWriter<W> {
    inner: W,
    throttler: Arc<BandwidthThrottler>,
    cancel: Option<CancellationToken>,
}

impl<W: Write> ThrottledWriter<W> {
    /// Wrap `inner`, gating every write through `throttler`.
    pub fn new(inner: W, throttler: Arc<BandwidthThrottler>) -> Self {
        Self {
            inner,
            throttler,
            cancel: None,
        }
    }

    /// Abort waits with an error once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Write a single byte through the throttler.
    pub fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.write_all(&[byte])
    }

    /// The throttler shared by this writer.
    pub fn throttler(&self) -> &Arc<BandwidthThrottler> {
        &self.throttler
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Consume the wrapper and return the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ThrottledWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let allowed = allowance(&self.throttler, self.cancel.as_ref(), buf.len())?;
        self.inner.write_all(&buf[..allowed])?;
        Ok(allowed)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A reader that counts every `read` call as one throttled operation.
///
/// Suited to operation-based limits such as frames per second; the
/// number of bytes per call is left to the caller's buffer size.
pub struct ThrottledReader<R, T> {
    inner: R,
    throttler: T,
}

impl<R: Read, T: Throttler> ThrottledReader<R, T> {
    /// Wrap `inner`, calling `throttler` before every read.
    pub fn new(inner: R, throttler: T) -> Self {
        Self { inner, throttler }
    }

    /// Read a single byte, or `None` at end of stream.
    pub fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Consume the wrapper and return the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read, T: Throttler> Read for ThrottledReader<R, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.throttler.throttle();
        self.inner.read(buf)
    }
}

/// A reader whose reads are truncated to the bandwidth allowance.
///
/// Granted bytes that the inner reader does not deliver (short reads, end
/// of stream) are not refunded.
pub struct BandwidthLimitedReader<R> {
    inner: R,
    throttler: Arc<BandwidthThrottler>,
    cancel: Option<CancellationToken>,
}

impl<R: Read> BandwidthLimitedReader<R> {
    /// Wrap `inner`, gating every read through `throttler`.
    pub fn new(inner: R, throttler: Arc<BandwidthThrottler>) -> Self {
        Self {
            inner,
            throttler,
            cancel: None,
        }
    }

    /// Abort waits with an error once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Consume the wrapper and return the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for BandwidthLimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let allowed = allowance(&self.throttler, self.cancel.as_ref(), buf.len())?;
        self.inner.read(&mut buf[..allowed])
    }
}

fn allowance(
    throttler: &BandwidthThrottler,
    cancel: Option<&CancellationToken>,
    requested: usize,
) -> io::Result<usize> {
    match cancel {
        Some(token) => Ok(throttler.get_allowed_bytes_cancellable(requested, token)?),
        None => Ok(throttler.get_allowed_bytes(requested)),
    }
}
