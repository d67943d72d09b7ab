//! Adapters from tokio I/O types to byte sources and sinks.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};

use super::{ByteSink, ByteSource};
use crate::error::Result;

/// A [`ByteSource`] over any [`AsyncRead`].
#[derive(Debug)]
pub struct IoSource<R> {
    inner: Mutex<R>,
}

impl<R> IoSource<R> {
    /// Wrap `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Lock and access the wrapped reader.
    pub async fn inner(&self) -> MutexGuard<'_, R> {
        self.inner.lock().await
    }

    /// Unwrap the reader.
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ByteSource for IoSource<R> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        Ok(inner.read(buf).await?)
    }
}

/// A [`ByteSink`] over any [`AsyncWrite`]. Closing shuts the writer down.
#[derive(Debug)]
pub struct IoSink<W> {
    inner: Mutex<W>,
}

impl<W> IoSink<W> {
    /// Wrap `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Lock and access the wrapped writer.
    pub async fn inner(&self) -> MutexGuard<'_, W> {
        self.inner.lock().await
    }

    /// Unwrap the writer.
    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ByteSink for IoSink<W> {
    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        Ok(inner.write(buf).await?)
    }

    async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        Ok(inner.flush().await?)
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        Ok(inner.shutdown().await?)
    }
}
