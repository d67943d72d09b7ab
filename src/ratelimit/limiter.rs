//! Token bucket that paces byte transfers to a bit rate.

use parking_lot::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::LimiterConfig;
use crate::error::{Result, StreamRateError};
use crate::time::{secs_to_duration, signed_secs};
use crate::units::BitRate;

/// The outcome of a [`TokenBucket::request`].
///
/// The caller must wait for `wait` before transferring, after which exactly
/// `bytes` bytes are authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    /// How long to wait before transferring
    pub wait: Duration,
    /// Number of bytes authorized once the wait is over
    pub bytes: usize,
}

impl Grant {
    fn immediate(bytes: usize) -> Self {
        Self {
            wait: Duration::ZERO,
            bytes,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    /// Limiting rate as configured
    limit: BitRate,
    /// Bytes per second
    rate: f64,
    /// Maximum accumulated tokens in bytes
    burst: f64,
    /// Smallest partial transfer worth waiting for
    min_partial: usize,
    /// Seconds needed to accrue one byte
    rate_coef: f64,
    /// `None` until the first request; the bucket starts full
    last_time: Option<Instant>,
    last_token: f64,
}

impl BucketState {
    /// Tokens available at `now`, capped at the burst size.
    fn available(&self, now: Instant) -> f64 {
        match self.last_time {
            None => self.burst,
            Some(last) => {
                let accrued = self.last_token + self.rate * signed_secs(now, last);
                accrued.min(self.burst)
            }
        }
    }
}

/// A token bucket rate limiter measured in bytes.
///
/// Tokens accrue continuously at the limiting rate up to `burst = rate ×
/// resolution`. A request is granted in full when enough tokens are
/// available, partially when at least `min_partial = rate × max_wait` bytes
/// are available, and otherwise the caller is told how long to wait for the
/// smaller of its request and `min_partial`.
///
/// The bucket never sleeps. All methods take `&self` and can be called from
/// several threads at once.
#[derive(Debug)]
pub struct TokenBucket {
    state: RwLock<BucketState>,
}

impl TokenBucket {
    /// Create a token bucket for `rate`.
    pub fn new(rate: BitRate, resolution: Duration, max_wait: Duration) -> Result<Self> {
        let params = Params::derive(rate, resolution, max_wait)?;
        Ok(Self {
            state: RwLock::new(BucketState {
                limit: rate,
                rate: params.rate,
                burst: params.burst,
                min_partial: params.min_partial,
                rate_coef: params.rate_coef,
                last_time: None,
                last_token: 0.0,
            }),
        })
    }

    /// Create a token bucket for `rate` using the resolution and max-wait of `config`.
    pub fn with_config(rate: BitRate, config: &LimiterConfig) -> Result<Self> {
        Self::new(rate, config.resolution(), config.max_wait())
    }

    /// Change the limiting rate.
    ///
    /// When `now` is given, tokens accrued since the last update are settled
    /// under the old rate and burst before the new parameters apply. With
    /// `None` the new parameters apply without any accrual step.
    pub fn set(
        &self,
        now: Option<Instant>,
        rate: BitRate,
        resolution: Duration,
        max_wait: Duration,
    ) -> Result<()> {
        let params = Params::derive(rate, resolution, max_wait)?;

        let mut state = self.state.write();
        // A pending wait leaves last_time in the future; nothing to settle then.
        if let (Some(last), Some(now)) = (state.last_time, now) {
            if now > last {
                state.last_token = state.available(now);
                state.last_time = Some(now);
            }
        }

        debug!(
            old_rate = %state.limit,
            new_rate = %rate,
            burst = params.burst,
            min_partial = params.min_partial,
            "Reconfigured token bucket"
        );

        state.limit = rate;
        state.rate = params.rate;
        state.burst = params.burst;
        state.min_partial = params.min_partial;
        state.rate_coef = params.rate_coef;
        Ok(())
    }

    /// Request permission to transfer `bytes` bytes at `now`.
    pub fn request(&self, now: Instant, bytes: usize) -> Grant {
        if bytes == 0 {
            return Grant::immediate(0);
        }

        let mut state = self.state.write();
        let allowed = state.available(now);
        let allowed_bytes = if allowed > 0.0 { allowed as usize } else { 0 };

        if bytes <= allowed_bytes {
            state.last_time = Some(now);
            state.last_token = allowed - bytes as f64;
            trace!(bytes, remaining = state.last_token, "Granted full request");
            return Grant::immediate(bytes);
        }

        if state.min_partial <= allowed_bytes {
            state.last_time = Some(now);
            state.last_token = allowed - allowed_bytes as f64;
            trace!(
                requested = bytes,
                granted = allowed_bytes,
                "Granted partial request"
            );
            return Grant::immediate(allowed_bytes);
        }

        let window = bytes.min(state.min_partial);
        let wait = secs_to_duration(state.rate_coef * (window as f64 - allowed));
        state.last_time = Some(now + wait);
        state.last_token = 0.0;

        trace!(
            requested = bytes,
            granted = window,
            wait_ms = wait.as_secs_f64() * 1e3,
            "Request must wait for tokens"
        );

        Grant {
            wait,
            bytes: window,
        }
    }

    /// Return `bytes` authorized bytes that were not transferred.
    ///
    /// The refund is not capped at the burst size; the next accrual clamps it.
    pub fn refund(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let mut state = self.state.write();
        state.last_token += bytes as f64;
        trace!(bytes, tokens = state.last_token, "Refunded unused tokens");
    }

    /// The current limiting bit rate.
    pub fn limiting_rate(&self) -> BitRate {
        self.state.read().limit
    }

    /// Maximum accumulated tokens in bytes.
    pub fn burst(&self) -> f64 {
        self.state.read().burst
    }

    /// Smallest partial transfer in bytes that is granted without waiting.
    pub fn min_partial(&self) -> usize {
        self.state.read().min_partial
    }

    /// Tokens available at `now`, without consuming any.
    ///
    /// Negative while a granted wait is still pending.
    pub fn available(&self, now: Instant) -> f64 {
        self.state.read().available(now)
    }
}

/// Bucket parameters derived from a rate, resolution and max-wait.
struct Params {
    rate: f64,
    burst: f64,
    min_partial: usize,
    rate_coef: f64,
}

impl Params {
    fn derive(rate: BitRate, resolution: Duration, max_wait: Duration) -> Result<Self> {
        let bps = rate.bps();
        if bps.is_nan() || bps < 0.0 {
            return Err(StreamRateError::invalid(format!("negative bit rate {}", rate)));
        }
        if bps == 0.0 {
            return Err(StreamRateError::invalid("zero bit rate"));
        }
        if !bps.is_finite() {
            return Err(StreamRateError::invalid("infinite bit rate"));
        }
        if resolution.is_zero() {
            return Err(StreamRateError::invalid("zero resolution"));
        }
        if max_wait.is_zero() {
            return Err(StreamRateError::invalid("zero max-wait"));
        }

        let bytes_per_sec = rate.bytes_per_sec();
        let burst = bytes_per_sec * resolution.as_secs_f64();
        let min_partial = (bytes_per_sec * max_wait.as_secs_f64()) as usize;

        if burst < 1.0 {
            return Err(StreamRateError::invalid(format!(
                "rate and/or resolution is too small: rate={}, resolution={:?}",
                rate, resolution
            )));
        }
        if min_partial < 1 {
            return Err(StreamRateError::invalid(format!(
                "rate and/or max-wait is too small: rate={}, max_wait={:?}",
                rate, max_wait
            )));
        }

        Ok(Self {
            rate: bytes_per_sec,
            burst,
            min_partial,
            rate_coef: 1.0 / bytes_per_sec,
        })
    }
}
