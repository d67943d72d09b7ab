//! Bit rate limiting.

mod limiter;

pub use limiter::{Grant, TokenBucket};
