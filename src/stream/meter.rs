//! Bit rate measuring wrappers.

use async_trait::async_trait;
use tokio::time::Instant;

use super::{ByteSink, ByteSource};
use crate::config::MeterConfig;
use crate::error::{Result, StreamRateError};
use crate::meter::{BitRateMeter, Total};
use crate::units::BitRate;

/// Measures the bit rate of reads from a source.
///
/// Measurement starts with the first read unless started explicitly.
#[derive(Debug)]
pub struct MeterReader<S> {
    inner: S,
    meter: BitRateMeter,
}

impl<S: ByteSource> MeterReader<S> {
    /// Measure `inner` with the default meter configuration.
    pub fn new(inner: S) -> Result<Self> {
        Self::with_config(inner, &MeterConfig::default())
    }

    /// Measure `inner` with the given meter configuration.
    pub fn with_config(inner: S, config: &MeterConfig) -> Result<Self> {
        Ok(Self {
            inner,
            meter: BitRateMeter::with_config(config)?,
        })
    }

    /// Start measuring now. Returns `false` if already started.
    pub fn start(&self) -> bool {
        self.meter.start(Instant::now())
    }

    /// Start measuring at `at`. Returns `false` if already started.
    pub fn start_at(&self, at: Instant) -> bool {
        self.meter.start(at)
    }

    /// Moving-average bit rate over the sample window.
    pub fn bit_rate(&self) -> BitRate {
        self.meter.bit_rate(Instant::now())
    }

    /// Bytes, elapsed time and average bit rate since the start.
    pub fn total(&self) -> Total {
        self.meter.total(Instant::now())
    }

    /// Stop measuring at `at`, then close the source.
    pub async fn close_at(&self, at: Instant) -> Result<()> {
        if self.meter.close(at) {
            self.inner.close().await?;
        }
        Ok(())
    }

    /// Stop measuring without closing the source.
    pub async fn close_single(&self) -> Result<()> {
        self.close_single_at(Instant::now()).await
    }

    /// Stop measuring at `at` without closing the wrapped stream.
    pub async fn close_single_at(&self, at: Instant) -> Result<()> {
        self.meter.close(at);
        Ok(())
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ByteSource> ByteSource for MeterReader<S> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.meter.is_closed() {
            return Err(StreamRateError::Closed);
        }
        self.meter.start(Instant::now());
        let n = self.inner.read(buf).await?;
        if n > 0 {
            self.meter.record(Instant::now(), n as u64);
        }
        Ok(n)
    }

    async fn close(&self) -> Result<()> {
        self.close_at(Instant::now()).await
    }
}

/// Measures the bit rate of writes to a sink.
///
/// Measurement starts with the first write unless started explicitly.
#[derive(Debug)]
pub struct MeterWriter<S> {
    inner: S,
    meter: BitRateMeter,
}

impl<S: ByteSink> MeterWriter<S> {
    /// Measure `inner` with the default meter configuration.
    pub fn new(inner: S) -> Result<Self> {
        Self::with_config(inner, &MeterConfig::default())
    }

    /// Measure `inner` with the given meter configuration.
    pub fn with_config(inner: S, config: &MeterConfig) -> Result<Self> {
        Ok(Self {
            inner,
            meter: BitRateMeter::with_config(config)?,
        })
    }

    /// Start measuring now. Returns `false` if already started.
    pub fn start(&self) -> bool {
        self.meter.start(Instant::now())
    }

    /// Start measuring at `at`. Returns `false` if already started.
    pub fn start_at(&self, at: Instant) -> bool {
        self.meter.start(at)
    }

    /// Moving-average bit rate over the sample window.
    pub fn bit_rate(&self) -> BitRate {
        self.meter.bit_rate(Instant::now())
    }

    /// Bytes, elapsed time and average bit rate since the start.
    pub fn total(&self) -> Total {
        self.meter.total(Instant::now())
    }

    /// Stop measuring at `at`, then close the sink.
    pub async fn close_at(&self, at: Instant) -> Result<()> {
        if self.meter.close(at) {
            self.inner.close().await?;
        }
        Ok(())
    }

    /// Stop measuring without closing the sink.
    pub async fn close_single(&self) -> Result<()> {
        self.close_single_at(Instant::now()).await
    }

    /// Stop measuring at `at` without closing the wrapped stream.
    pub async fn close_single_at(&self, at: Instant) -> Result<()> {
        self.meter.close(at);
        Ok(())
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ByteSink> ByteSink for MeterWriter<S> {
    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.meter.is_closed() {
            return Err(StreamRateError::Closed);
        }
        self.meter.start(Instant::now());
        let n = self.inner.write(buf).await?;
        if n > 0 {
            self.meter.record(Instant::now(), n as u64);
        }
        Ok(n)
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    async fn close(&self) -> Result<()> {
        self.close_at(Instant::now()).await
    }
}
