//! Process-wide byte-rate ceiling: a shared token bucket paced on 100 ms ticks.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(100);

/// Shared token bucket. Cloning hands out another handle to the same bucket;
/// workers call [`RateLimiter::acquire`] from their blocking read loops before
/// counting a chunk.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    /// Bytes per second; 0 = unlimited.
    limit_bps: u64,
    available: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(limit_kbps: u64) -> Self {
        let limit_bps = limit_kbps.saturating_mul(1024);
        Self {
            inner: Arc::new(Mutex::new(Bucket {
                limit_bps,
                // Start full so the first second is not artificially throttled.
                available: limit_bps as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.inner.lock().unwrap().limit_bps == 0
    }

    /// Blocks (sleeping in 100 ms ticks) until `bytes` fit under the global
    /// per-second budget. Must be called from a blocking thread.
    pub fn acquire(&self, bytes: u64) {
        loop {
            {
                let mut bucket = self.inner.lock().unwrap();
                if bucket.limit_bps == 0 {
                    return;
                }
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.last_refill = Instant::now();
                // Cap the burst at one second of budget; an oversized chunk may
                // still pass whole once enough ticks have accumulated for it.
                let cap = (bucket.limit_bps as f64).max(bytes as f64);
                bucket.available = (bucket.available + elapsed * bucket.limit_bps as f64).min(cap);
                if bucket.available >= bytes as f64 {
                    bucket.available -= bytes as f64;
                    return;
                }
            }
            std::thread::sleep(TICK);
        }
    }
}
