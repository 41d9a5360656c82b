//! Token-bucket throughput cap shared across worker threads.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared rate limiter: tokens represent bytes, refilled continuously at
/// `rate` bytes/sec, bucket capacity capped at `burst` (one chunk's worth).
/// `None` disables limiting entirely (`--limit-rate` unset).
#[derive(Clone)]
pub struct RateLimiter {
    inner: Option<Arc<Mutex<Bucket>>>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(rate_bytes_per_sec: Option<u64>, burst_bytes: u64) -> Self {
        match rate_bytes_per_sec {
            None => RateLimiter {
                inner: None,
                rate: 0.0,
                burst: 0.0,
            },
            Some(rate) => RateLimiter {
                inner: Some(Arc::new(Mutex::new(Bucket {
                    tokens: burst_bytes as f64,
                    last_refill: Instant::now(),
                }))),
                rate: rate as f64,
                burst: burst_bytes as f64,
            },
        }
    }

    pub fn unlimited() -> Self {
        RateLimiter {
            inner: None,
            rate: 0.0,
            burst: 0.0,
        }
    }

    /// Block the calling thread (cooperative sleep, not a syscall-level
    /// throttle) until `size` tokens are available, then consume them.
    pub fn acquire(&self, size: u64) {
        let Some(bucket) = &self.inner else {
            return;
        };

        loop {
            let wait = {
                let mut b = bucket.lock().unwrap();
                refill(&mut b, self.rate, self.burst);

                if b.tokens >= size as f64 {
                    b.tokens -= size as f64;
                    None
                } else {
                    let deficit = size as f64 - b.tokens;
                    Some(Duration::from_secs_f64((deficit / self.rate).max(0.0)))
                }
            };

            match wait {
                None => return,
                Some(d) => std::thread::sleep(d.min(Duration::from_millis(250))),
            }
        }
    }
}

fn refill(bucket: &mut Bucket, rate: f64, burst: f64) {
    let now = Instant::now();
    let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
    bucket.tokens = (bucket.tokens + elapsed * rate).min(burst);
    bucket.last_refill = now;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_blocks() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        limiter.acquire(10_000_000);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn acquire_within_burst_does_not_block() {
        let limiter = RateLimiter::new(Some(1_000_000), 1_000_000);
        let start = Instant::now();
        limiter.acquire(1_000_000);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn acquire_over_burst_blocks_until_refilled() {
        let limiter = RateLimiter::new(Some(1_000_000), 100_000);
        limiter.acquire(100_000); // drain the bucket
        let start = Instant::now();
        limiter.acquire(100_000); // must wait ~0.1s for refill
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
