//! Streamrate - Bit Rate Limiting and Measurement for Byte Streams
//!
//! This crate paces async byte transfers to a configured bit rate with a
//! token bucket, and measures the bit rate actually achieved with a
//! sliding-window meter. Both are available as standalone engines and as
//! wrappers around any [`ByteSource`] or [`ByteSink`].

pub mod config;
pub mod error;
pub mod meter;
pub mod ratelimit;
pub mod stream;
pub mod units;
mod time;

pub use config::{LimiterConfig, MeterConfig, StreamRateConfig};
pub use error::{Result, StreamRateError};
pub use meter::{BitRateMeter, Total};
pub use ratelimit::{Grant, TokenBucket};
pub use stream::{
    ByteSink, ByteSource, IoSink, IoSource, LimiterReader, LimiterWriter, MeterReader,
    MeterWriter, Reader, Writer,
};
pub use units::{BitRate, ByteCount};
