// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Longest a caller may be parked waiting for tokens. Keeping the sleep
/// short lets pause/cancel flags take effect promptly on throttled
/// transfers.
const MAX_WAIT: Duration = Duration::from_millis(100);

pub struct TokenBucket {
    last_refill_time: Instant,
    tokens: f64,
    fill_rate: f64, // bytes per second; 0 disables the limiter
    capacity: f64,  // burst cap, 2x the fill rate
    enabled: bool,
    observed_speed: f64,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: f64) -> Self {
        TokenBucket {
            last_refill_time: Instant::now(),
            tokens: rate_bytes_per_sec * 2.0,
            fill_rate: rate_bytes_per_sec,
            capacity: rate_bytes_per_sec * 2.0,
            enabled: true,
            observed_speed: 0.0,
        }
    }

    pub fn set_rate(&mut self, new_rate_bps: f64) {
        self.fill_rate = new_rate_bps;
        self.capacity = new_rate_bps * 2.0;
        self.tokens = self.capacity;
        self.last_refill_time = Instant::now();
    }

    pub fn rate(&self) -> f64 {
        self.fill_rate
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_active(&self) -> bool {
        self.enabled && self.fill_rate > 0.0
    }

    pub fn reset(&mut self) {
        self.tokens = self.capacity;
        self.last_refill_time = Instant::now();
    }

    /// Aggregate speed most recently reported by the speed monitor.
    /// Read-only bookkeeping; it does not influence the bucket.
    pub fn observe_speed(&mut self, bytes_per_sec: f64) {
        self.observed_speed = bytes_per_sec;
    }

    pub fn observed_speed(&self) -> f64 {
        self.observed_speed
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill_time);
        self.last_refill_time = now;

        let tokens_to_add = elapsed.as_secs_f64() * self.fill_rate;
        self.tokens = f64::min(self.capacity, self.tokens + tokens_to_add);
    }
}

/// Ask permission to transfer up to `requested` bytes. Returns how many
/// bytes the caller is authorized to move right now: always at least 1
/// while the limiter is active, and exactly `requested` when it is not.
///
/// The sleep happens with the lock released so other workers can drain
/// tokens concurrently.
pub async fn acquire(bucket_arc: &Arc<Mutex<TokenBucket>>, requested: usize) -> usize {
    if requested == 0 {
        return 0;
    }

    let wait_time = {
        let mut bucket = bucket_arc.lock().await;
        if !bucket.is_active() {
            return requested;
        }
        bucket.refill();

        if bucket.tokens >= requested as f64 {
            bucket.tokens -= requested as f64;
            return requested;
        }

        if bucket.tokens >= 1.0 {
            let permitted = bucket.tokens as usize;
            bucket.tokens -= permitted as f64;
            return permitted;
        }

        // Empty bucket: wait roughly long enough for the request to
        // become affordable, bounded by MAX_WAIT.
        let needed = requested as f64 / bucket.fill_rate;
        Duration::from_secs_f64(needed).min(MAX_WAIT)
    }; // lock dropped here

    tokio::time::sleep(wait_time).await;

    let mut bucket = bucket_arc.lock().await;
    if !bucket.is_active() {
        return requested;
    }
    bucket.refill();

    let permitted = (bucket.tokens.min(requested as f64) as usize).max(1);
    bucket.tokens = (bucket.tokens - permitted as f64).max(0.0);
    permitted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_bucket_passes_through() {
        let bucket = Arc::new(Mutex::new(TokenBucket::new(0.0)));
        assert_eq!(acquire(&bucket, 1_000_000).await, 1_000_000);

        let limited = Arc::new(Mutex::new(TokenBucket::new(1024.0)));
        limited.lock().await.set_enabled(false);
        assert_eq!(acquire(&limited, 1_000_000).await, 1_000_000);
    }

    #[tokio::test]
    async fn grants_are_never_zero_while_active() {
        let bucket = Arc::new(Mutex::new(TokenBucket::new(64.0)));
        {
            let mut b = bucket.lock().await;
            b.tokens = 0.0;
        }
        let granted = acquire(&bucket, 4096).await;
        assert!(granted >= 1);
        assert!(granted <= 4096);
    }

    #[tokio::test]
    async fn full_bucket_grants_whole_request() {
        let bucket = Arc::new(Mutex::new(TokenBucket::new(1024.0)));
        assert_eq!(acquire(&bucket, 100).await, 100);
    }

    #[tokio::test]
    async fn throughput_stays_under_rate_plus_burst() {
        // Over a window T the bucket may grant at most rate*T plus the
        // burst capacity it started with.
        let rate = 200_000.0;
        let bucket = Arc::new(Mutex::new(TokenBucket::new(rate)));
        let start = Instant::now();
        let mut granted: u64 = 0;
        while start.elapsed() < Duration::from_millis(500) {
            granted += acquire(&bucket, 65_536).await as u64;
        }
        let elapsed = start.elapsed().as_secs_f64();
        let ceiling = rate * elapsed + rate * 2.0 + 65_536.0;
        assert!(
            (granted as f64) <= ceiling,
            "granted {granted} over {elapsed:.3}s exceeds {ceiling}"
        );
    }

    #[tokio::test]
    async fn set_rate_refills_to_new_burst() {
        let bucket = Arc::new(Mutex::new(TokenBucket::new(100.0)));
        {
            let mut b = bucket.lock().await;
            b.set_rate(50_000.0);
            assert!(b.is_active());
        }
        // Burst cap is now 100k and the bucket starts full, so a 60k
        // request is granted in one shot.
        assert_eq!(acquire(&bucket, 60_000).await, 60_000);
    }
}
