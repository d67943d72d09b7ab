//! Stream wrappers that limit and measure byte transfers.
//!
//! Every wrapper is itself a [`ByteSource`] or [`ByteSink`], so wrappers
//! compose. [`Reader`] and [`Writer`] are a limiter stacked on a meter.

mod combined;
mod io;
mod limiter;
mod meter;
mod signal;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;

pub use combined::{Reader, Writer};
pub use io::{IoSink, IoSource};
pub use limiter::{LimiterReader, LimiterWriter};
pub use meter::{MeterReader, MeterWriter};

/// Something bytes can be read from.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Read into `buf` and return the number of bytes read.
    ///
    /// `Ok(0)` with a non-empty `buf` means end of stream.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Close the source. Sources with nothing to release do nothing.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Something bytes can be written to.
#[async_trait]
pub trait ByteSink: Send + Sync {
    /// Write from `buf` and return the number of bytes written.
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Close the sink. Sinks with nothing to release do nothing.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: ByteSource + ?Sized> ByteSource for Arc<T> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

#[async_trait]
impl<T: ByteSink + ?Sized> ByteSink for Arc<T> {
    async fn write(&self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf).await
    }

    async fn flush(&self) -> Result<()> {
        (**self).flush().await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}
