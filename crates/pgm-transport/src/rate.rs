/// Token-bucket rate regulation.
///
/// The bucket refills continuously at the configured byte rate and holds
/// at most one second's worth of tokens. Every transmitted packet pays
/// its own length plus the IP header overhead. `check` admits, defers, or
/// refuses without mutating the account; the caller consumes only after
/// the datagram actually went out, under the send lock, so token order
/// matches wire order.

use parking_lot::Mutex;

use std::time::Duration;

use crate::timer::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateCheck {
    /// Enough tokens; transmit now.
    Admit,
    /// Blocking caller should wait this long, then transmit.
    Defer(Duration),
    /// DONTWAIT and the bucket cannot cover the packet.
    WouldBlock,
}

#[derive(Debug)]
struct Bucket {
    tokens: u64,
    last_refill: Timestamp,
}

#[derive(Debug)]
pub struct RateRegulator {
    /// Bytes per second; also the bucket capacity.
    rate: u64,
    /// Per-packet overhead of the IP (and UDP, when encapsulated) header.
    iphdr_len: u64,
    bucket: Mutex<Bucket>,
}

impl RateRegulator {
    pub fn new(rate_bytes_per_sec: u64, iphdr_len: usize) -> Self {
        debug_assert!(rate_bytes_per_sec > 0);
        RateRegulator {
            rate: rate_bytes_per_sec,
            iphdr_len: iphdr_len as u64,
            bucket: Mutex::new(Bucket {
                tokens: rate_bytes_per_sec,
                last_refill: Timestamp::ZERO,
            }),
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Timestamp) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let earned = (self.rate as u128 * elapsed.as_micros()) / 1_000_000;
        bucket.tokens = bucket
            .tokens
            .saturating_add(earned.min(u64::MAX as u128) as u64)
            .min(self.rate);
        bucket.last_refill = now;
    }

    /// Check admission for a packet of `len` bytes. Does not consume.
    ///
    /// With `dontwait` an underfunded bucket answers `WouldBlock` and the
    /// state is untouched; otherwise the deficit is translated into the
    /// wait that would clear it.
    pub fn check(&self, len: usize, now: Timestamp, dontwait: bool) -> RateCheck {
        let need = len as u64 + self.iphdr_len;
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);
        if bucket.tokens >= need {
            return RateCheck::Admit;
        }
        if dontwait {
            return RateCheck::WouldBlock;
        }
        let deficit = need - bucket.tokens;
        let wait_us = (deficit as u128 * 1_000_000).div_ceil(self.rate as u128);
        RateCheck::Defer(Duration::from_micros(wait_us as u64))
    }

    /// Pay for a transmitted packet. Called after a successful send.
    pub fn consume(&self, len: usize, now: Timestamp) {
        let need = len as u64 + self.iphdr_len;
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);
        bucket.tokens = bucket.tokens.saturating_sub(need);
    }
}
