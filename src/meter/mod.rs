//! Bit rate measurement.

mod ring;
mod window;

pub use window::{BitRateMeter, Total};
