use std::{fmt, net::SocketAddr, time::Duration};

use rustc_hash::FxHashMap;

use tgen_wire::probe::Header;

/// Sequence tracking for a single sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    packets: u64,
    bytes: u64,
    /// Packets that carried a probe header.
    sequenced: u64,
    highest_seq: Option<u32>,
    /// Sequenced packets that arrived after a higher sequence number.
    reordered: u64,
}

impl PeerStats {
    fn record(&mut self, bytes: usize, header: Option<&Header>) {
        self.packets += 1;
        self.bytes += bytes as u64;

        let Some(header) = header else { return };
        self.sequenced += 1;
        match self.highest_seq {
            Some(highest) if header.seq < highest => self.reordered += 1,
            _ => self.highest_seq = Some(header.seq),
        }
    }

    #[inline]
    pub fn packets(&self) -> u64 {
        self.packets
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    #[inline]
    pub fn highest_seq(&self) -> Option<u32> {
        self.highest_seq
    }

    #[inline]
    pub fn reordered(&self) -> u64 {
        self.reordered
    }

    /// Estimated number of packets lost: sequence numbers up to the highest one
    /// seen that never arrived. Packets still in flight count as lost.
    pub fn lost(&self) -> u64 {
        self.highest_seq.map_or(0, |highest| (u64::from(highest) + 1).saturating_sub(self.sequenced))
    }
}

/// Counters of a packet sink.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiveStats {
    packets_received: u64,
    bytes_received: u64,
    first_rx_time: Option<Duration>,
    last_rx_time: Option<Duration>,
    /// One-way delays of payloads that carried a probe header.
    delay_samples: Vec<Duration>,
    peers: FxHashMap<SocketAddr, PeerStats>,
}

impl ReceiveStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a payload received at `now`. Payloads that start with a probe header
    /// also yield a delay sample; anything else is only counted.
    pub fn record(&mut self, now: Duration, payload: &[u8], from: SocketAddr) {
        let header = Header::peek(payload);
        if let Some(header) = &header {
            self.delay_samples.push(now.saturating_sub(header.sent_at));
        }

        self.count(now, payload.len(), header.as_ref(), from);
    }

    /// Records a payload without looking for a probe header.
    pub fn record_untimed(&mut self, now: Duration, payload: &[u8], from: SocketAddr) {
        self.count(now, payload.len(), None, from);
    }

    fn count(&mut self, now: Duration, len: usize, header: Option<&Header>, from: SocketAddr) {
        self.packets_received += 1;
        self.bytes_received += len as u64;
        self.first_rx_time.get_or_insert(now);
        self.last_rx_time = Some(now);

        self.peers.entry(from).or_default().record(len, header);
    }

    #[inline]
    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    #[inline]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    #[inline]
    pub fn first_rx_time(&self) -> Option<Duration> {
        self.first_rx_time
    }

    #[inline]
    pub fn last_rx_time(&self) -> Option<Duration> {
        self.last_rx_time
    }

    #[inline]
    pub fn delay_samples(&self) -> &[Duration] {
        &self.delay_samples
    }

    /// Received bits per second between the first and the last packet. `0.0` until
    /// packets have arrived at two distinct times.
    pub fn throughput(&self) -> f64 {
        let (Some(first), Some(last)) = (self.first_rx_time, self.last_rx_time) else {
            return 0.0;
        };

        let span = last.saturating_sub(first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }

        self.bytes_received as f64 * 8.0 / span
    }

    pub fn mean_delay(&self) -> Option<Duration> {
        if self.delay_samples.is_empty() {
            return None;
        }

        let total: u128 = self.delay_samples.iter().map(Duration::as_nanos).sum();
        let mean = total / self.delay_samples.len() as u128;
        Some(Duration::from_nanos(u64::try_from(mean).unwrap_or(u64::MAX)))
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.delay_samples.iter().max().copied()
    }

    /// Mean absolute difference between consecutive delay samples, in arrival
    /// order. `None` with fewer than two samples.
    pub fn mean_jitter(&self) -> Option<Duration> {
        if self.delay_samples.len() < 2 {
            return None;
        }

        let total: u128 = self
            .delay_samples
            .windows(2)
            .map(|pair| (pair[1].max(pair[0]) - pair[1].min(pair[0])).as_nanos())
            .sum();
        let mean = total / (self.delay_samples.len() - 1) as u128;
        Some(Duration::from_nanos(u64::try_from(mean).unwrap_or(u64::MAX)))
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<&PeerStats> {
        self.peers.get(addr)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&SocketAddr, &PeerStats)> {
        self.peers.iter()
    }
}

impl fmt::Display for ReceiveStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received {} packets ({} bytes) from {} peer(s), {:.0} bps",
            self.packets_received,
            self.bytes_received,
            self.peers.len(),
            self.throughput()
        )?;

        if let (Some(mean), Some(max)) = (self.mean_delay(), self.max_delay()) {
            write!(f, ", delay mean {mean:?} max {max:?}")?;
        }

        if let Some(jitter) = self.mean_jitter() {
            write!(f, ", jitter {jitter:?}")?;
        }

        let lost: u64 = self.peers.values().map(PeerStats::lost).sum();
        if lost > 0 {
            write!(f, ", ~{lost} lost")?;
        }

        Ok(())
    }
}
