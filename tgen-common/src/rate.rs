use std::{fmt, str::FromStr, time::Duration};

use thiserror::Error;

const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseRateError {
    #[error("Empty data rate")]
    Empty,
    #[error("Invalid data rate value: {0}")]
    Value(String),
    #[error("Unknown data rate unit: {0}")]
    Unit(String),
    #[error("Data rate overflows u64 bits per second: {0}")]
    Overflow(String),
}

/// A link or application data rate, in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DataRate(u64);

impl DataRate {
    pub const fn from_bps(bps: u64) -> Self {
        Self(bps)
    }

    pub const fn from_kbps(kbps: u64) -> Self {
        Self(kbps * 1_000)
    }

    pub const fn from_mbps(mbps: u64) -> Self {
        Self(mbps * 1_000_000)
    }

    pub const fn from_gbps(gbps: u64) -> Self {
        Self(gbps * 1_000_000_000)
    }

    #[inline]
    pub const fn bps(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Returns the time needed to put `bytes` on the wire at this rate, rounded up
    /// to the nanosecond, so any non-empty payload takes at least 1ns. A zero rate
    /// yields [`Duration::ZERO`].
    pub fn tx_time(&self, bytes: u64) -> Duration {
        if self.0 == 0 {
            return Duration::ZERO;
        }

        let nanos = (u128::from(bytes) * 8 * NANOS_PER_SEC).div_ceil(u128::from(self.0));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bps = self.0;
        if bps >= 1_000_000_000 && bps % 1_000_000_000 == 0 {
            write!(f, "{}Gbps", bps / 1_000_000_000)
        } else if bps >= 1_000_000 && bps % 1_000_000 == 0 {
            write!(f, "{}Mbps", bps / 1_000_000)
        } else if bps >= 1_000 && bps % 1_000 == 0 {
            write!(f, "{}kbps", bps / 1_000)
        } else {
            write!(f, "{bps}bps")
        }
    }
}

impl FromStr for DataRate {
    type Err = ParseRateError;

    /// Parses rates like `5Mbps`, `500kbps`, `64000bps`, `1.5Gb/s` or `2MB/s` (bytes).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseRateError::Empty);
        }

        let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(s.len());
        let (value, unit) = s.split_at(split);

        let value: f64 = value.parse().map_err(|_| ParseRateError::Value(s.to_string()))?;
        if !value.is_finite() || value < 0.0 {
            return Err(ParseRateError::Value(s.to_string()));
        }

        let multiplier = match unit.trim() {
            "" | "bps" | "b/s" => 1.0,
            "kbps" | "Kbps" | "kb/s" | "Kb/s" => 1e3,
            "Mbps" | "Mb/s" => 1e6,
            "Gbps" | "Gb/s" => 1e9,
            "Bps" | "B/s" => 8.0,
            "kBps" | "KBps" | "kB/s" | "KB/s" => 8e3,
            "MBps" | "MB/s" => 8e6,
            "GBps" | "GB/s" => 8e9,
            other => return Err(ParseRateError::Unit(other.to_string())),
        };

        let bps = (value * multiplier).round();
        if bps > u64::MAX as f64 {
            return Err(ParseRateError::Overflow(s.to_string()));
        }

        Ok(Self(bps as u64))
    }
}
