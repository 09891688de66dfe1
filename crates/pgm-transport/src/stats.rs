/// Transport counters, shared between the engine lanes and any observer.
/// All fields are atomic for lock-free reads from other threads.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TransportStats {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub spms_sent: AtomicU64,
    pub naks_sent: AtomicU64,
    pub naks_received: AtomicU64,
    pub ncfs_sent: AtomicU64,
    pub rdata_sent: AtomicU64,
    pub parity_sent: AtomicU64,
    /// Per-packet parse failures, dropped silently.
    pub checksum_failures: AtomicU64,
    pub malformed_packets: AtomicU64,
    /// NAKs for sequences already evicted from the transmit window.
    pub naks_gone: AtomicU64,
    pub rate_deferrals: AtomicU64,
    pub peers_created: AtomicU64,
    pub peers_expired: AtomicU64,
    pub resets: AtomicU64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            spms_sent: self.spms_sent.load(Ordering::Relaxed),
            naks_sent: self.naks_sent.load(Ordering::Relaxed),
            naks_received: self.naks_received.load(Ordering::Relaxed),
            ncfs_sent: self.ncfs_sent.load(Ordering::Relaxed),
            rdata_sent: self.rdata_sent.load(Ordering::Relaxed),
            parity_sent: self.parity_sent.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            naks_gone: self.naks_gone.load(Ordering::Relaxed),
            rate_deferrals: self.rate_deferrals.load(Ordering::Relaxed),
            peers_created: self.peers_created.load(Ordering::Relaxed),
            peers_expired: self.peers_expired.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub spms_sent: u64,
    pub naks_sent: u64,
    pub naks_received: u64,
    pub ncfs_sent: u64,
    pub rdata_sent: u64,
    pub parity_sent: u64,
    pub checksum_failures: u64,
    pub malformed_packets: u64,
    pub naks_gone: u64,
    pub rate_deferrals: u64,
    pub peers_created: u64,
    pub peers_expired: u64,
    pub resets: u64,
}
