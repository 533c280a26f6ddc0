use std::{sync::Arc, time::Duration};

use thiserror::Error;

use tgen_common::DataRate;

use crate::trace::Trace;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Packet size must be greater than zero")]
    ZeroPacketSize,
    #[error("Data rate must be greater than zero")]
    ZeroDataRate,
    #[error("{0} must be greater than zero when set")]
    ZeroLimit(&'static str),
    #[error("A zero send interval needs a packet or byte limit")]
    Unbounded,
    #[error("Rate changes only apply to constant-rate traffic")]
    NotRateMode,
}

/// Pacing of a constant-rate flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rate {
    /// A fixed gap between consecutive packets.
    Interval(Duration),
    /// A target bit rate; the gap is derived from the packet size on every send.
    DataRate(DataRate),
}

impl Rate {
    /// The gap between two packets of `packet_size` bytes.
    pub fn interval(&self, packet_size: u32) -> Duration {
        match self {
            Self::Interval(interval) => *interval,
            Self::DataRate(rate) => rate.tx_time(u64::from(packet_size)),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::DataRate(rate) if rate.is_zero() => Err(ConfigError::ZeroDataRate),
            _ => Ok(()),
        }
    }
}

impl From<DataRate> for Rate {
    fn from(rate: DataRate) -> Self {
        Self::DataRate(rate)
    }
}

impl From<Duration> for Rate {
    fn from(interval: Duration) -> Self {
        Self::Interval(interval)
    }
}

/// What a generator sends, and when.
#[derive(Debug, Clone, PartialEq)]
pub enum TrafficSpec {
    /// Fixed-size packets paced by a rate.
    ConstantRate { packet_size: u32, rate: Rate },
    /// Packets replayed from a recorded schedule. The trace is shared, never copied.
    TraceReplay(Arc<Trace>),
}

impl TrafficSpec {
    pub fn constant_rate(packet_size: u32, rate: impl Into<Rate>) -> Self {
        Self::ConstantRate { packet_size, rate: rate.into() }
    }

    pub fn trace(trace: impl Into<Arc<Trace>>) -> Self {
        Self::TraceReplay(trace.into())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::ConstantRate { packet_size: 0, .. } => Err(ConfigError::ZeroPacketSize),
            Self::ConstantRate { rate, .. } => rate.validate(),
            // Trace entries are validated on load
            Self::TraceReplay(_) => Ok(()),
        }
    }

    /// Number of packets the spec describes on its own, if finite.
    pub fn len(&self) -> Option<u64> {
        match self {
            Self::ConstantRate { .. } => None,
            Self::TraceReplay(trace) => Some(trace.len() as u64),
        }
    }

    /// Returns `true` if the spec describes no packets at all.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::TraceReplay(trace) if trace.is_empty())
    }
}
