//! Limited and measured streams.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;

use super::limiter::{LimiterReader, LimiterWriter};
use super::meter::{MeterReader, MeterWriter};
use super::{ByteSink, ByteSource};
use crate::config::{LimiterConfig, MeterConfig};
use crate::error::Result;
use crate::meter::Total;
use crate::units::BitRate;

/// A source that is both rate limited and measured.
///
/// Reads pass through the limiter and then the meter, so the meter sees the
/// limited rate.
#[derive(Debug)]
pub struct Reader<S> {
    meter: Arc<MeterReader<S>>,
    limiter: LimiterReader<Arc<MeterReader<S>>>,
}

impl<S: ByteSource> Reader<S> {
    /// Limit `inner` to `rate` and measure it, with default configuration.
    pub fn new(inner: S, rate: BitRate) -> Result<Self> {
        Self::with_config(inner, rate, &LimiterConfig::default(), &MeterConfig::default())
    }

    /// Limit and measure `inner` with the given configurations.
    pub fn with_config(
        inner: S,
        rate: BitRate,
        limiter: &LimiterConfig,
        meter: &MeterConfig,
    ) -> Result<Self> {
        let meter = Arc::new(MeterReader::with_config(inner, meter)?);
        let limiter = LimiterReader::with_config(Arc::clone(&meter), rate, limiter)?;
        Ok(Self { meter, limiter })
    }

    /// The current limiting bit rate.
    pub fn limiting_bit_rate(&self) -> BitRate {
        self.limiter.limiting_bit_rate()
    }

    /// Change the limiting bit rate. Tokens accrued so far are kept.
    pub fn set_bit_rate(&self, rate: BitRate) -> Result<()> {
        self.limiter.set_bit_rate(rate)
    }

    /// Start measuring now. Returns `false` if already started.
    pub fn start(&self) -> bool {
        self.meter.start()
    }

    /// Start measuring at `at`. Returns `false` if already started.
    pub fn start_at(&self, at: Instant) -> bool {
        self.meter.start_at(at)
    }

    /// Moving-average bit rate over the sample window.
    pub fn bit_rate(&self) -> BitRate {
        self.meter.bit_rate()
    }

    /// Bytes, elapsed time and average bit rate since the start.
    pub fn total(&self) -> Total {
        self.meter.total()
    }

    /// Stop measuring at `at`, close the source and the limiter.
    pub async fn close_at(&self, at: Instant) -> Result<()> {
        let closed = self.meter.close_at(at).await;
        self.limiter.close_single().await?;
        closed
    }

    /// Stop measuring and limiting without closing the source.
    pub async fn close_single(&self) -> Result<()> {
        self.close_single_at(Instant::now()).await
    }

    /// Stop measuring at `at` and stop limiting, without closing the wrapped stream.
    pub async fn close_single_at(&self, at: Instant) -> Result<()> {
        let closed = self.meter.close_single_at(at).await;
        self.limiter.close_single().await?;
        closed
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        self.meter.get_ref()
    }
}

#[async_trait]
impl<S: ByteSource> ByteSource for Reader<S> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.limiter.read(buf).await
    }

    async fn close(&self) -> Result<()> {
        self.limiter.close().await
    }
}

/// A sink that is both rate limited and measured.
#[derive(Debug)]
pub struct Writer<S> {
    meter: Arc<MeterWriter<S>>,
    limiter: LimiterWriter<Arc<MeterWriter<S>>>,
}

impl<S: ByteSink> Writer<S> {
    /// Limit `inner` to `rate` and measure it, with default configuration.
    pub fn new(inner: S, rate: BitRate) -> Result<Self> {
        Self::with_config(inner, rate, &LimiterConfig::default(), &MeterConfig::default())
    }

    /// Limit and measure `inner` with the given configurations.
    pub fn with_config(
        inner: S,
        rate: BitRate,
        limiter: &LimiterConfig,
        meter: &MeterConfig,
    ) -> Result<Self> {
        let meter = Arc::new(MeterWriter::with_config(inner, meter)?);
        let limiter = LimiterWriter::with_config(Arc::clone(&meter), rate, limiter)?;
        Ok(Self { meter, limiter })
    }

    /// The current limiting bit rate.
    pub fn limiting_bit_rate(&self) -> BitRate {
        self.limiter.limiting_bit_rate()
    }

    /// Change the limiting bit rate. Tokens accrued so far are kept.
    pub fn set_bit_rate(&self, rate: BitRate) -> Result<()> {
        self.limiter.set_bit_rate(rate)
    }

    /// Start measuring now. Returns `false` if already started.
    pub fn start(&self) -> bool {
        self.meter.start()
    }

    /// Start measuring at `at`. Returns `false` if already started.
    pub fn start_at(&self, at: Instant) -> bool {
        self.meter.start_at(at)
    }

    /// Moving-average bit rate over the sample window.
    pub fn bit_rate(&self) -> BitRate {
        self.meter.bit_rate()
    }

    /// Bytes, elapsed time and average bit rate since the start.
    pub fn total(&self) -> Total {
        self.meter.total()
    }

    /// Stop measuring at `at`, close the sink and the limiter.
    pub async fn close_at(&self, at: Instant) -> Result<()> {
        let closed = self.meter.close_at(at).await;
        self.limiter.close_single().await?;
        closed
    }

    /// Stop measuring and limiting without closing the sink.
    pub async fn close_single(&self) -> Result<()> {
        self.close_single_at(Instant::now()).await
    }

    /// Stop measuring at `at` and stop limiting, without closing the wrapped stream.
    pub async fn close_single_at(&self, at: Instant) -> Result<()> {
        let closed = self.meter.close_single_at(at).await;
        self.limiter.close_single().await?;
        closed
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        self.meter.get_ref()
    }
}

#[async_trait]
impl<S: ByteSink> ByteSink for Writer<S> {
    async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.limiter.write(buf).await
    }

    async fn flush(&self) -> Result<()> {
        self.limiter.flush().await
    }

    async fn close(&self) -> Result<()> {
        self.limiter.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::ByteCount;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct CollectSink {
        data: Mutex<Vec<u8>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl ByteSink for CollectSink {
        async fn write(&self, buf: &[u8]) -> Result<usize> {
            self.data.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Endless {
        closed: AtomicBool,
    }

    #[async_trait]
    impl ByteSource for Endless {
        async fn read(&self, buf: &mut [u8]) -> Result<usize> {
            buf.fill(b'z');
            Ok(buf.len())
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn limiter_config() -> LimiterConfig {
        LimiterConfig {
            resolution_ms: 1000,
            max_wait_ms: 500,
        }
    }

    fn meter_config() -> MeterConfig {
        MeterConfig {
            resolution_ms: 500,
            sample_ms: 3000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_meter_sees_limited_rate() {
        let writer = Writer::with_config(
            CollectSink::default(),
            BitRate::from_bps(8_000.0),
            &limiter_config(),
            &meter_config(),
        )
        .unwrap();
        let t0 = Instant::now();
        writer.start_at(t0);

        // 1000 bytes of burst, then 500 bytes per half second.
        writer.write(&[7u8; 7_000]).await.unwrap();
        assert_eq!(t0.elapsed(), Duration::from_secs(6));
        assert_eq!(writer.get_ref().data.lock().len(), 7_000);

        let rate = writer.bit_rate().bps();
        assert!((rate - 8_000.0).abs() < 1e-6, "rate {}", rate);
        let total = writer.total();
        assert_eq!(total.bytes, ByteCount::new(7_000));
        assert_eq!(total.elapsed, Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_chains_through_meter() {
        let writer = Writer::new(CollectSink::default(), BitRate::from_bps(64_000.0)).unwrap();
        writer.write(b"hello").await.unwrap();
        writer.close().await.unwrap();
        assert!(writer.get_ref().closed.load(Ordering::SeqCst));
        assert!(writer.write(b"again").await.unwrap_err().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_close_at_freezes_and_closes_source() {
        let reader = Reader::with_config(
            Endless {
                closed: AtomicBool::new(false),
            },
            BitRate::from_bps(8_000.0),
            &limiter_config(),
            &meter_config(),
        )
        .unwrap();
        let t0 = Instant::now();
        reader.start_at(t0);

        let mut buf = [0u8; 500];
        let mut total = 0;
        while total < 3_000 {
            total += reader.read(&mut buf).await.unwrap();
        }
        let end = Instant::now();
        reader.close_at(end).await.unwrap();
        assert!(reader.get_ref().closed.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(30)).await;
        let frozen = reader.total();
        assert_eq!(frozen.bytes, ByteCount::new(3_000));
        assert_eq!(frozen.elapsed, end - t0);
        assert!(reader.read(&mut buf).await.unwrap_err().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_single_leaves_source_open() {
        let reader = Reader::new(
            Endless {
                closed: AtomicBool::new(false),
            },
            BitRate::from_bps(8_000.0),
        )
        .unwrap();
        let mut buf = [0u8; 10];
        reader.read(&mut buf).await.unwrap();
        reader.close_single().await.unwrap();
        assert!(!reader.get_ref().closed.load(Ordering::SeqCst));
        assert!(reader.read(&mut buf).await.unwrap_err().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_bit_rate_through_combined() {
        let writer = Writer::new(CollectSink::default(), BitRate::from_bps(8_000.0)).unwrap();
        writer.set_bit_rate(BitRate::from_bps(80_000.0)).unwrap();
        assert_eq!(writer.limiting_bit_rate(), BitRate::from_bps(80_000.0));
    }
}
