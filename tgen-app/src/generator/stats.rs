use std::{fmt, time::Duration};

use tgen_transport::TransportError;

/// How a generator run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The schedule was exhausted or a configured bound was reached.
    Completed,
    /// The owner called `stop`.
    Stopped,
    /// The transport failed; the run ended early.
    Failed(TransportError),
}

impl Outcome {
    #[inline]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Stopped => f.write_str("stopped"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Counters of a generator run. A snapshot is available at any time through
/// `TrafficGenerator::report`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratorReport {
    /// Packets fully accepted by the transport.
    packets_sent: u64,
    /// Bytes accepted by the transport, including parts of unfinished packets.
    bytes_sent: u64,
    /// Sends the transport accepted only partially.
    partial_sends: u64,
    /// The number of packets the configuration asks for, when known up front.
    total_packets: Option<u64>,
    started_at: Option<Duration>,
    finished_at: Option<Duration>,
    outcome: Option<Outcome>,
}

impl GeneratorReport {
    pub(crate) fn new(total_packets: Option<u64>) -> Self {
        Self { total_packets, ..Default::default() }
    }

    #[inline]
    pub(crate) fn increment_packets(&mut self) {
        self.packets_sent += 1;
    }

    #[inline]
    pub(crate) fn increment_bytes(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    #[inline]
    pub(crate) fn increment_partial(&mut self) {
        self.partial_sends += 1;
    }

    pub(crate) fn set_started(&mut self, at: Duration) {
        self.started_at = Some(at);
    }

    pub(crate) fn set_finished(&mut self, at: Duration, outcome: Outcome) {
        self.finished_at = Some(at);
        self.outcome = Some(outcome);
    }

    #[inline]
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    #[inline]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    #[inline]
    pub fn partial_sends(&self) -> u64 {
        self.partial_sends
    }

    #[inline]
    pub fn total_packets(&self) -> Option<u64> {
        self.total_packets
    }

    #[inline]
    pub fn started_at(&self) -> Option<Duration> {
        self.started_at
    }

    #[inline]
    pub fn finished_at(&self) -> Option<Duration> {
        self.finished_at
    }

    /// `None` while the generator has not finished.
    #[inline]
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Time between start and finish.
    pub fn elapsed(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            _ => None,
        }
    }
}

impl fmt::Display for GeneratorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total_packets {
            Some(total) => write!(f, "sent {}/{} packets", self.packets_sent, total)?,
            None => write!(f, "sent {} packets", self.packets_sent)?,
        }
        write!(f, " ({} bytes", self.bytes_sent)?;
        if self.partial_sends > 0 {
            write!(f, ", {} partial sends", self.partial_sends)?;
        }
        f.write_str(")")?;

        match &self.outcome {
            Some(outcome) => write!(f, ", {outcome}"),
            None => f.write_str(", running"),
        }
    }
}
