//! QoS: byte token buckets pacing outbound frames per peer.
//!
//! Rates follow the inbound bandwidth the peer advertised:
//!   Default     unpaced (control traffic, sync requests)
//!   Bulk        the full advertised rate
//!   Background  an eighth of it
//!
//! Each frame costs its size in tokens. An empty bucket delays the frame
//! rather than dropping it.

use std::time::{Duration, Instant};

use kindred_core::ItemPriority;

const BURST_SECS: f64 = 0.5;
const BACKGROUND_SHARE: f64 = 8.0;

#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A bucket refilling at `bytes_per_sec`. Zero means unlimited.
    pub fn new(bytes_per_sec: f64) -> Self {
        let (capacity, refill_rate) = if bytes_per_sec <= 0.0 {
            (f64::INFINITY, f64::INFINITY)
        } else {
            (bytes_per_sec * BURST_SECS, bytes_per_sec)
        };
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.refill_rate.is_infinite()
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `bytes` tokens and return how long the caller must wait before
    /// sending. Frames larger than the burst go into debt.
    pub fn reserve(&mut self, bytes: usize) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        self.refill();
        self.tokens -= bytes as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_rate)
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens.min(self.capacity)
    }
}

/// Per-peer pacing across priority classes.
#[derive(Debug)]
pub struct Pacer {
    bulk: TokenBucket,
    background: TokenBucket,
}

impl Pacer {
    /// `bandwidth` is the peer's advertised inbound rate. Zero = unpaced.
    pub fn new(bandwidth: u32) -> Self {
        let rate = f64::from(bandwidth);
        Self {
            bulk: TokenBucket::new(rate),
            background: TokenBucket::new(rate / BACKGROUND_SHARE),
        }
    }

    pub fn delay(&mut self, priority: ItemPriority, bytes: usize) -> Duration {
        match priority {
            ItemPriority::Default => Duration::ZERO,
            ItemPriority::Bulk => self.bulk.reserve(bytes),
            ItemPriority::Background => self.background.reserve(bytes),
        }
    }
}
