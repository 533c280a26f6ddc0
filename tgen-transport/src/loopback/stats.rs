/// Counters for everything that crossed a [`Loopback`](super::Loopback) network.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    /// Payloads handed to a bound receiver.
    delivered: u64,
    /// Bytes handed to a bound receiver.
    delivered_bytes: u64,
    /// Datagrams dropped by the configured loss rate.
    lost: u64,
    /// Payloads addressed to nobody.
    unreachable: u64,
}

impl LinkStats {
    #[inline]
    pub(crate) fn increment_delivered(&mut self, bytes: usize) {
        self.delivered += 1;
        self.delivered_bytes += bytes as u64;
    }

    #[inline]
    pub(crate) fn increment_lost(&mut self) {
        self.lost += 1;
    }

    #[inline]
    pub(crate) fn increment_unreachable(&mut self) {
        self.unreachable += 1;
    }

    #[inline]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    #[inline]
    pub fn delivered_bytes(&self) -> u64 {
        self.delivered_bytes
    }

    #[inline]
    pub fn lost(&self) -> u64 {
        self.lost
    }

    #[inline]
    pub fn unreachable(&self) -> u64 {
        self.unreachable
    }
}
