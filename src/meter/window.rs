//! Sliding-window bit rate meter.

use parking_lot::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::ring::BucketRing;
use crate::config::{MeterConfig, MIN_METER_RESOLUTION};
use crate::error::{Result, StreamRateError};
use crate::time::truncate;
use crate::units::{BitRate, ByteCount, BITS_PER_BYTE};

/// Lifetime statistics returned by [`BitRateMeter::total`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Total {
    /// Bytes transferred since the start
    pub bytes: ByteCount,
    /// Time from the start to now, or to the close
    pub elapsed: Duration,
    /// Average bit rate over `elapsed`
    pub rate: BitRate,
}

#[derive(Debug)]
struct MeterState {
    ring: BucketRing,
    started_at: Option<Instant>,
    closed_at: Option<Instant>,
    total_bytes: u64,
}

/// Measures the moving-average bit rate of a stream over a sample window,
/// plus the exact lifetime average.
///
/// The window is split into buckets of `resolution` kept in a fixed ring, so
/// recording is O(1) and the rate is refreshed once per resolution.
#[derive(Debug)]
pub struct BitRateMeter {
    resolution: Duration,
    sample: Duration,
    state: RwLock<MeterState>,
}

impl BitRateMeter {
    /// Create a meter with the given bucket resolution and sample window.
    pub fn new(resolution: Duration, sample: Duration) -> Result<Self> {
        if resolution.is_zero() {
            return Err(StreamRateError::invalid("zero meter resolution"));
        }
        if resolution < MIN_METER_RESOLUTION {
            return Err(StreamRateError::invalid(format!(
                "meter resolution {:?} is below the minimum {:?}",
                resolution, MIN_METER_RESOLUTION
            )));
        }
        if sample.is_zero() {
            return Err(StreamRateError::invalid("zero sample duration"));
        }

        let slots = sample.as_nanos() / resolution.as_nanos();
        if slots < 2 {
            return Err(StreamRateError::invalid(format!(
                "sample duration {:?} is too small (at least {:?})",
                sample,
                resolution * 2
            )));
        }

        // One open bucket in front of the closed ones covering the window
        let ring = BucketRing::new(slots as usize + 1);

        Ok(Self {
            resolution,
            sample,
            state: RwLock::new(MeterState {
                ring,
                started_at: None,
                closed_at: None,
                total_bytes: 0,
            }),
        })
    }

    /// Create a meter from a [`MeterConfig`].
    pub fn with_config(config: &MeterConfig) -> Result<Self> {
        Self::new(config.resolution(), config.sample())
    }

    /// Width of one bucket.
    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    /// Length of the moving-average window.
    pub fn sample(&self) -> Duration {
        self.sample
    }

    /// Start measuring at `now`. Returns `false` if already started.
    pub fn start(&self, now: Instant) -> bool {
        let mut state = self.state.write();
        self.start_locked(&mut state, now)
    }

    fn start_locked(&self, state: &mut MeterState, now: Instant) -> bool {
        if state.started_at.is_some() {
            return false;
        }
        state.started_at = Some(now);
        let cur = state.ring.cur_mut();
        cur.start = Duration::ZERO;
        cur.end = self.resolution;
        debug!(
            resolution_ms = self.resolution.as_millis() as u64,
            sample_ms = self.sample.as_millis() as u64,
            "Meter started"
        );
        true
    }

    /// Stop measuring at `now`. Returns `false` if already closed.
    ///
    /// A meter that was never started is started at `now`.
    pub fn close(&self, now: Instant) -> bool {
        let mut state = self.state.write();
        if state.closed_at.is_some() {
            return false;
        }
        self.start_locked(&mut state, now);
        state.closed_at = Some(now);
        debug!(total_bytes = state.total_bytes, "Meter closed");
        true
    }

    pub fn is_started(&self) -> bool {
        self.state.read().started_at.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed_at.is_some()
    }

    /// Record `bytes` transferred at `now`.
    ///
    /// Records after close are ignored.
    pub fn record(&self, now: Instant, bytes: u64) {
        let mut state = self.state.write();
        if state.closed_at.is_some() {
            trace!(bytes, "Ignoring record on closed meter");
            return;
        }
        self.start_locked(&mut state, now);
        let started_at = state.started_at.unwrap_or(now);
        let elapsed = now.saturating_duration_since(started_at);

        state.total_bytes += bytes;
        if elapsed < state.ring.cur().end {
            state.ring.cur_mut().volume += bytes;
            return;
        }

        let start = truncate(elapsed, self.resolution);
        state.ring.advance(start, start + self.resolution, bytes);
        trace!(
            bucket_start_ms = start.as_millis() as u64,
            bytes,
            "Meter advanced to a new bucket"
        );
    }

    /// The average bit rate over the most recent sample window.
    ///
    /// Zero until the first bucket has closed. Before a full window has been
    /// measured the average is taken over the time actually elapsed.
    pub fn bit_rate(&self, now: Instant) -> BitRate {
        let state = self.state.read();
        let (Some(last), Some(started_at)) = (state.ring.last(), state.started_at) else {
            return BitRate::ZERO;
        };

        let elapsed = now.saturating_duration_since(started_at);
        let cur = state.ring.cur();
        let (newest, sample_end) = if elapsed < cur.end {
            (last, cur.start)
        } else {
            (state.ring.cur_index(), truncate(elapsed, self.resolution))
        };

        let (sample_start, sample_width) = match sample_end.checked_sub(self.sample) {
            Some(start) => (start, self.sample),
            None => (Duration::ZERO, sample_end),
        };
        if sample_width.is_zero() {
            return BitRate::ZERO;
        }

        let sum = state.ring.sum_since(newest, sample_start);
        BitRate::from_bps(sum as f64 * BITS_PER_BYTE / sample_width.as_secs_f64())
    }

    /// Bytes, elapsed time and average bit rate since the start.
    ///
    /// After close the figures are frozen at the close time. All zero until
    /// the first bucket has closed.
    pub fn total(&self, now: Instant) -> Total {
        let state = self.state.read();
        let (Some(_), Some(started_at)) = (state.ring.last(), state.started_at) else {
            return Total::default();
        };

        let end = state.closed_at.unwrap_or(now);
        let elapsed = end.saturating_duration_since(started_at);
        let bytes = ByteCount::new(state.total_bytes);

        let rate = if state.total_bytes == 0 {
            BitRate::ZERO
        } else if elapsed.is_zero() {
            BitRate::from_bps(f64::INFINITY)
        } else {
            BitRate::from_bps(bytes.bits() / elapsed.as_secs_f64())
        };

        Total {
            bytes,
            elapsed,
            rate,
        }
    }

    /// Number of buckets in the ring, including the open one.
    pub fn bucket_count(&self) -> usize {
        self.state.read().ring.len()
    }
}
