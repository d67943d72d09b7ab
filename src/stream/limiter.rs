//! Rate limiting wrappers.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::signal::CloseSignal;
use super::{ByteSink, ByteSource};
use crate::config::LimiterConfig;
use crate::error::{Result, StreamRateError};
use crate::ratelimit::TokenBucket;
use crate::units::BitRate;

/// Token bucket plus close signal shared by the limiting reader and writer.
#[derive(Debug)]
struct Throttle {
    bucket: TokenBucket,
    config: LimiterConfig,
    closed: CloseSignal,
}

impl Throttle {
    fn new(rate: BitRate, config: &LimiterConfig) -> Result<Self> {
        Ok(Self {
            bucket: TokenBucket::with_config(rate, config)?,
            config: *config,
            closed: CloseSignal::new(),
        })
    }

    /// Wait until some of `want` bytes may be transferred.
    ///
    /// The returned grant goes back to the bucket unless settled, so a close
    /// during the wait or a dropped caller leaves no debt behind.
    async fn acquire(&self, want: usize) -> Result<PendingGrant<'_>> {
        if self.closed.is_closed() {
            return Err(StreamRateError::Closed);
        }
        let grant = self.bucket.request(Instant::now(), want);
        let pending = PendingGrant {
            bucket: &self.bucket,
            bytes: grant.bytes,
        };
        if !grant.wait.is_zero() {
            if let Err(err) = self.closed.sleep(grant.wait).await {
                debug!(bytes = grant.bytes, "Wait interrupted by close");
                return Err(err);
            }
        }
        Ok(pending)
    }

    fn set_rate(&self, rate: BitRate) -> Result<()> {
        self.bucket.set(
            Some(Instant::now()),
            rate,
            self.config.resolution(),
            self.config.max_wait(),
        )
    }

    /// Mark closed. Returns `false` if already closed.
    fn close(&self) -> bool {
        let first = self.closed.close();
        if first {
            debug!(rate = %self.bucket.limiting_rate(), "Limiter closed");
        }
        first
    }
}

/// Bytes authorized by the bucket and not yet accounted for.
///
/// Dropping it refunds whatever is still held.
#[derive(Debug)]
struct PendingGrant<'a> {
    bucket: &'a TokenBucket,
    bytes: usize,
}

impl PendingGrant<'_> {
    fn bytes(&self) -> usize {
        self.bytes
    }

    /// Keep `used` bytes and refund the rest.
    fn settle(mut self, used: usize) {
        self.bytes = self.bytes.saturating_sub(used);
    }
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.bucket.refund(self.bytes);
        }
    }
}

/// Stop a write that made progress with `Ok(written)`; the error surfaces
/// only when nothing was written.
fn stop_write(written: usize, err: StreamRateError) -> Result<usize> {
    if written == 0 {
        return Err(err);
    }
    debug!(written, error = %err, "Write stopped early");
    Ok(written)
}

/// Limits the bit rate of reads from a source.
///
/// A read waits as needed, then reads at most the granted number of bytes.
/// Bytes granted but not read are returned to the bucket. Concurrent reads
/// are served one at a time.
#[derive(Debug)]
pub struct LimiterReader<S> {
    inner: S,
    throttle: Throttle,
    io_lock: Mutex<()>,
}

impl<S: ByteSource> LimiterReader<S> {
    /// Limit `inner` to `rate` with the default limiter configuration.
    pub fn new(inner: S, rate: BitRate) -> Result<Self> {
        Self::with_config(inner, rate, &LimiterConfig::default())
    }

    /// Limit `inner` to `rate` with the given limiter configuration.
    pub fn with_config(inner: S, rate: BitRate, config: &LimiterConfig) -> Result<Self> {
        Ok(Self {
            inner,
            throttle: Throttle::new(rate, config)?,
            io_lock: Mutex::new(()),
        })
    }

    /// The current limiting bit rate.
    pub fn limiting_bit_rate(&self) -> BitRate {
        self.throttle.bucket.limiting_rate()
    }

    /// Change the limiting bit rate. Tokens accrued so far are kept.
    pub fn set_bit_rate(&self, rate: BitRate) -> Result<()> {
        self.throttle.set_rate(rate)
    }

    /// Close the limiter without closing the wrapped source.
    pub async fn close_single(&self) -> Result<()> {
        self.throttle.close();
        Ok(())
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ByteSource> ByteSource for LimiterReader<S> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let _serial = self.io_lock.lock().await;
        let grant = self.throttle.acquire(buf.len()).await?;
        let result = self.inner.read(&mut buf[..grant.bytes()]).await;
        grant.settle(*result.as_ref().unwrap_or(&0));
        result
    }

    /// Close the limiter, interrupting a pending wait, then the source.
    async fn close(&self) -> Result<()> {
        if self.throttle.close() {
            self.inner.close().await?;
        }
        Ok(())
    }
}

/// Limits the bit rate of writes to a sink.
///
/// A write loops until the whole buffer is written, waiting as needed
/// between chunks. A write that stops early after writing something returns
/// the count written instead of the error. Concurrent writes are served one at a time.
#[derive(Debug)]
pub struct LimiterWriter<S> {
    inner: S,
    throttle: Throttle,
    io_lock: Mutex<()>,
}

impl<S: ByteSink> LimiterWriter<S> {
    /// Limit `inner` to `rate` with the default limiter configuration.
    pub fn new(inner: S, rate: BitRate) -> Result<Self> {
        Self::with_config(inner, rate, &LimiterConfig::default())
    }

    /// Limit `inner` to `rate` with the given limiter configuration.
    pub fn with_config(inner: S, rate: BitRate, config: &LimiterConfig) -> Result<Self> {
        Ok(Self {
            inner,
            throttle: Throttle::new(rate, config)?,
            io_lock: Mutex::new(()),
        })
    }

    /// The current limiting bit rate.
    pub fn limiting_bit_rate(&self) -> BitRate {
        self.throttle.bucket.limiting_rate()
    }

    /// Change the limiting bit rate. Tokens accrued so far are kept.
    pub fn set_bit_rate(&self, rate: BitRate) -> Result<()> {
        self.throttle.set_rate(rate)
    }

    /// Close the limiter without closing the wrapped sink.
    pub async fn close_single(&self) -> Result<()> {
        self.throttle.close();
        Ok(())
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ByteSink> ByteSink for LimiterWriter<S> {
    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let _serial = self.io_lock.lock().await;
        let mut written = 0;
        while written < buf.len() {
            let rest = &buf[written..];
            let grant = match self.throttle.acquire(rest.len()).await {
                Ok(grant) => grant,
                Err(err) => return stop_write(written, err),
            };
            let result = self.inner.write(&rest[..grant.bytes()]).await;
            grant.settle(*result.as_ref().unwrap_or(&0));
            match result {
                Ok(0) => return stop_write(written, StreamRateError::ZeroWrite),
                Ok(n) => written += n,
                Err(err) => return stop_write(written, err),
            }
        }
        Ok(written)
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    /// Close the limiter, interrupting a pending wait, then the sink.
    async fn close(&self) -> Result<()> {
        if self.throttle.close() {
            self.inner.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Sink that accepts at most `chunk` bytes per write and records when.
    #[derive(Debug, Default)]
    struct RecordingSink {
        chunk: Option<usize>,
        data: SyncMutex<Vec<u8>>,
        writes: SyncMutex<Vec<(Instant, usize)>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl ByteSink for RecordingSink {
        async fn write(&self, buf: &[u8]) -> Result<usize> {
            let n = self.chunk.map_or(buf.len(), |c| c.min(buf.len()));
            self.data.lock().extend_from_slice(&buf[..n]);
            self.writes.lock().push((Instant::now(), n));
            Ok(n)
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Source that returns at most `chunk` bytes per read from an endless stream.
    #[derive(Debug)]
    struct ChunkSource {
        chunk: usize,
        closed: AtomicBool,
    }

    #[async_trait]
    impl ByteSource for ChunkSource {
        async fn read(&self, buf: &mut [u8]) -> Result<usize> {
            let n = self.chunk.min(buf.len());
            buf[..n].fill(b'x');
            Ok(n)
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> LimiterConfig {
        LimiterConfig {
            resolution_ms: 1000,
            max_wait_ms: 500,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_drains_at_limit() {
        let writer =
            LimiterWriter::with_config(RecordingSink::default(), BitRate::from_bps(16.0), &config())
                .unwrap();
        let start = Instant::now();

        assert_eq!(writer.write(b"hello").await.unwrap(), 5);

        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(1490) && elapsed <= Duration::from_millis(2500),
            "elapsed {:?}",
            elapsed
        );
        let sink = writer.get_ref();
        assert_eq!(sink.data.lock().as_slice(), b"hello");
        let sizes: Vec<usize> = sink.writes.lock().iter().map(|(_, n)| *n).collect();
        assert_eq!(sizes, vec![2, 1, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_write_loops_and_refunds() {
        let sink = RecordingSink {
            chunk: Some(300),
            ..Default::default()
        };
        let writer = LimiterWriter::with_config(sink, BitRate::from_bps(8_000.0), &config()).unwrap();

        // 1000 tokens are available; three short writes of 300 and one of 100
        // use them all without waiting.
        let start = Instant::now();
        assert_eq!(writer.write(&[0u8; 1000]).await.unwrap(), 1000);
        assert_eq!(start.elapsed(), Duration::ZERO);
        let sizes: Vec<usize> = writer.get_ref().writes.lock().iter().map(|(_, n)| *n).collect();
        assert_eq!(sizes, vec![300, 300, 300, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_write_fails() {
        let sink = RecordingSink {
            chunk: Some(0),
            ..Default::default()
        };
        let writer = LimiterWriter::with_config(sink, BitRate::from_bps(8_000.0), &config()).unwrap();
        let err = writer.write(b"abc").await.unwrap_err();
        assert!(matches!(err, StreamRateError::ZeroWrite));
        // The unused grant went back to the bucket.
        let available = writer.throttle.bucket.available(Instant::now());
        assert!((available - 1000.0).abs() < 1e-6, "available {}", available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_read_refunds() {
        let source = ChunkSource {
            chunk: 100,
            closed: AtomicBool::new(false),
        };
        let reader = LimiterReader::with_config(source, BitRate::from_bps(8_000.0), &config()).unwrap();

        let mut buf = [0u8; 600];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 100);
        let available = reader.throttle.bucket.available(Instant::now());
        assert!((available - 900.0).abs() < 1e-6, "available {}", available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_follow_rate() {
        let source = ChunkSource {
            chunk: usize::MAX,
            closed: AtomicBool::new(false),
        };
        let reader = LimiterReader::with_config(source, BitRate::from_bps(8_000.0), &config()).unwrap();

        let start = Instant::now();
        let mut total = 0;
        let mut buf = [0u8; 4096];
        while total < 10_000 {
            total += reader.read(&mut buf).await.unwrap();
        }
        // 1000 bytes of burst, then 1000 bytes per second.
        let elapsed = start.elapsed().as_secs_f64();
        let expected = (total - 1000) as f64 / 1000.0;
        assert!((elapsed - expected).abs() < 0.6, "elapsed {} expected {}", elapsed, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_wait_and_refunds() {
        let writer = Arc::new(
            LimiterWriter::with_config(RecordingSink::default(), BitRate::from_bps(16.0), &config())
                .unwrap(),
        );
        // Drain the burst so the next write must wait.
        writer.write(b"ab").await.unwrap();

        let pending = {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move { writer.write(b"c").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.close().await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_closed());
        assert_eq!(writer.get_ref().data.lock().as_slice(), b"ab");
        // The interrupted grant was returned: the pending wait no longer
        // leaves the bucket in debt.
        let available = writer.throttle.bucket.available(Instant::now());
        assert!(available > -1e-6, "available {}", available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_mid_write_reports_progress() {
        let writer = Arc::new(
            LimiterWriter::with_config(RecordingSink::default(), BitRate::from_bps(16.0), &config())
                .unwrap(),
        );

        // 2 bytes go out at once, the third waits half a second.
        let pending = {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move { writer.write(b"hello").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.close().await.unwrap();

        assert_eq!(pending.await.unwrap().unwrap(), 2);
        assert_eq!(writer.get_ref().data.lock().as_slice(), b"he");
        assert!(writer.write(b"llo").await.unwrap_err().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_write_returns_grant() {
        let writer =
            LimiterWriter::with_config(RecordingSink::default(), BitRate::from_bps(8_000.0), &config())
                .unwrap();
        writer.write(&[0u8; 1000]).await.unwrap();
        let t0 = Instant::now();

        // The write waits 500ms for its grant and is dropped after 10ms.
        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), writer.write(&[0u8; 500])).await;
        assert!(cancelled.is_err());
        assert_eq!(writer.get_ref().data.lock().len(), 1000);

        // Only the 10ms of accrual is available; the 500 byte grant is gone.
        let available = writer.throttle.bucket.available(Instant::now());
        assert!((available - 10.0).abs() < 1e-6, "available {}", available);

        writer.write(&[0u8; 5]).await.unwrap();
        assert_eq!(t0.elapsed(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_read_returns_grant() {
        let source = ChunkSource {
            chunk: usize::MAX,
            closed: AtomicBool::new(false),
        };
        let reader = LimiterReader::with_config(source, BitRate::from_bps(8_000.0), &config()).unwrap();
        let mut buf = [0u8; 1000];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 1000);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), reader.read(&mut buf)).await;
        assert!(cancelled.is_err());

        let available = reader.throttle.bucket.available(Instant::now());
        assert!((available - 10.0).abs() < 1e-6, "available {}", available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_after_close_fail() {
        let writer =
            LimiterWriter::with_config(RecordingSink::default(), BitRate::from_bps(8_000.0), &config())
                .unwrap();
        writer.close().await.unwrap();
        assert!(writer.get_ref().closed.load(Ordering::SeqCst));
        assert!(writer.write(b"x").await.unwrap_err().is_closed());
        // Closing twice is a no-op.
        writer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_single_leaves_inner_open() {
        let source = ChunkSource {
            chunk: 10,
            closed: AtomicBool::new(false),
        };
        let reader = LimiterReader::with_config(source, BitRate::from_bps(8_000.0), &config()).unwrap();
        reader.close_single().await.unwrap();
        assert!(!reader.get_ref().closed.load(Ordering::SeqCst));

        let mut buf = [0u8; 4];
        assert!(reader.read(&mut buf).await.unwrap_err().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_bit_rate() {
        let reader = LimiterReader::with_config(
            ChunkSource {
                chunk: usize::MAX,
                closed: AtomicBool::new(false),
            },
            BitRate::from_bps(8_000.0),
            &config(),
        )
        .unwrap();
        reader.set_bit_rate(BitRate::from_bps(16_000.0)).unwrap();
        assert_eq!(reader.limiting_bit_rate(), BitRate::from_bps(16_000.0));

        let err = reader.set_bit_rate(BitRate::from_bps(-1.0)).unwrap_err();
        assert!(matches!(err, StreamRateError::InvalidParameter(_)));
        assert_eq!(reader.limiting_bit_rate(), BitRate::from_bps(16_000.0));
    }

    #[test]
    fn test_invalid_rate_rejected() {
        let err = LimiterWriter::new(RecordingSink::default(), BitRate::ZERO).unwrap_err();
        assert!(matches!(err, StreamRateError::InvalidParameter(_)));
    }
}
