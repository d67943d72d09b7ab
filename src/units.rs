//! Bit rate and byte count value types.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::StreamRateError;

/// Number of bits in one byte.
pub const BITS_PER_BYTE: f64 = 8.0;

const SI_PREFIXES: [&str; 5] = ["", "k", "M", "G", "T"];

/// A transfer rate in bits per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct BitRate(f64);

impl BitRate {
    /// Zero bits per second.
    pub const ZERO: BitRate = BitRate(0.0);

    /// Create a bit rate from a bits-per-second value.
    pub const fn from_bps(bps: f64) -> Self {
        BitRate(bps)
    }

    /// Create a bit rate from a bytes-per-second value.
    pub fn from_bytes_per_sec(bytes: f64) -> Self {
        BitRate(bytes * BITS_PER_BYTE)
    }

    /// Bits per second.
    pub const fn bps(self) -> f64 {
        self.0
    }

    /// Bytes per second.
    pub fn bytes_per_sec(self) -> f64 {
        self.0 / BITS_PER_BYTE
    }

    /// Whether the rate is unbounded, as reported for a zero-length transfer.
    pub fn is_infinite(self) -> bool {
        self.0.is_infinite()
    }
}

impl fmt::Display for BitRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.0.is_finite() {
            return write!(f, "{} bit/s", self.0);
        }
        let (value, prefix) = scale(self.0);
        if prefix.is_empty() {
            write!(f, "{:.0} bit/s", value)
        } else {
            write!(f, "{:.2} {}bit/s", value, prefix)
        }
    }
}

impl FromStr for BitRate {
    type Err = StreamRateError;

    /// Parses "64kbit/s", "1.5 Mbps", "800", "2MB/s" and similar.
    ///
    /// A lower-case `b` (or no unit) means bits, an upper-case `B` means bytes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);
        let value: f64 = number
            .parse()
            .map_err(|_| StreamRateError::invalid(format!("bad bit rate {:?}", s)))?;

        let unit = unit.trim_start();
        let (multiplier, rest) = match unit.chars().next() {
            Some('k' | 'K') => (1e3, &unit[1..]),
            Some('m' | 'M') => (1e6, &unit[1..]),
            Some('g' | 'G') => (1e9, &unit[1..]),
            Some('t' | 'T') => (1e12, &unit[1..]),
            _ => (1.0, unit),
        };
        let per_unit = match rest {
            "" | "bps" | "b/s" | "bit/s" | "bits/s" => 1.0,
            "Bps" | "B/s" | "byte/s" | "bytes/s" => BITS_PER_BYTE,
            _ => {
                return Err(StreamRateError::invalid(format!(
                    "unknown bit rate unit {:?}",
                    unit
                )))
            }
        };

        Ok(BitRate(value * multiplier * per_unit))
    }
}

impl Serialize for BitRate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.0)
    }
}

impl<'de> Deserialize<'de> for BitRate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(bps) => Ok(BitRate(bps)),
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// An amount of data in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ByteCount(u64);

impl ByteCount {
    /// No bytes.
    pub const ZERO: ByteCount = ByteCount(0);

    /// Create a count of `bytes` bytes.
    pub const fn new(bytes: u64) -> Self {
        ByteCount(bytes)
    }

    /// Number of bytes.
    pub const fn bytes(self) -> u64 {
        self.0
    }

    /// Number of bits.
    pub fn bits(self) -> f64 {
        self.0 as f64 * BITS_PER_BYTE
    }
}

impl From<u64> for ByteCount {
    fn from(bytes: u64) -> Self {
        ByteCount(bytes)
    }
}

impl From<usize> for ByteCount {
    fn from(bytes: usize) -> Self {
        ByteCount(bytes as u64)
    }
}

impl std::ops::Add for ByteCount {
    type Output = ByteCount;

    fn add(self, rhs: ByteCount) -> ByteCount {
        ByteCount(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for ByteCount {
    fn add_assign(&mut self, rhs: ByteCount) {
        self.0 += rhs.0;
    }
}

impl fmt::Display for ByteCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, prefix) = scale(self.0 as f64);
        if prefix.is_empty() {
            write!(f, "{} B", self.0)
        } else {
            write!(f, "{:.2} {}B", value, prefix)
        }
    }
}

fn scale(mut value: f64) -> (f64, &'static str) {
    let mut idx = 0;
    while value.abs() >= 1000.0 && idx + 1 < SI_PREFIXES.len() {
        value /= 1000.0;
        idx += 1;
    }
    (value, SI_PREFIXES[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bit_units() {
        assert_eq!("800".parse::<BitRate>().unwrap().bps(), 800.0);
        assert_eq!("800bps".parse::<BitRate>().unwrap().bps(), 800.0);
        assert_eq!("64kbit/s".parse::<BitRate>().unwrap().bps(), 64_000.0);
        assert_eq!("1.5 Mbps".parse::<BitRate>().unwrap().bps(), 1_500_000.0);
        assert_eq!("2G".parse::<BitRate>().unwrap().bps(), 2e9);
    }

    #[test]
    fn test_parse_byte_units() {
        assert_eq!("2MB/s".parse::<BitRate>().unwrap().bps(), 16_000_000.0);
        assert_eq!("10 Bps".parse::<BitRate>().unwrap().bytes_per_sec(), 10.0);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("fast".parse::<BitRate>().is_err());
        assert!("10 furlongs".parse::<BitRate>().is_err());
        assert!("".parse::<BitRate>().is_err());
        assert!("-5kbps".parse::<BitRate>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(BitRate::from_bps(800.0).to_string(), "800 bit/s");
        assert_eq!(BitRate::from_bps(1_500_000.0).to_string(), "1.50 Mbit/s");
        assert_eq!(BitRate::from_bps(f64::INFINITY).to_string(), "inf bit/s");
        assert_eq!(ByteCount::new(999).to_string(), "999 B");
        assert_eq!(ByteCount::new(2_048).to_string(), "2.05 kB");
    }

    #[test]
    fn test_deserialize_number_or_text() {
        let rate: BitRate = serde_yaml::from_str("16000").unwrap();
        assert_eq!(rate.bps(), 16_000.0);

        let rate: BitRate = serde_yaml::from_str("\"16kbit/s\"").unwrap();
        assert_eq!(rate.bps(), 16_000.0);
    }

    #[test]
    fn test_byte_count_arithmetic() {
        let mut total = ByteCount::ZERO;
        total += ByteCount::from(250usize);
        total += ByteCount::new(750);
        assert_eq!(total.bytes(), 1000);
        assert_eq!(total.bits(), 8000.0);
    }
}
