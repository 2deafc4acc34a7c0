use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Spaces outgoing requests by a minimum interval. The provisioning service
/// throttles aggressively; pacing on our side keeps retries from compounding
/// the problem.
#[derive(Debug)]
pub struct RequestPacer {
    last_request: Mutex<Instant>,
    min_interval: Duration,
}

impl RequestPacer {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            last_request: Mutex::new(Instant::now() - Duration::from_millis(min_interval_ms)),
            min_interval: Duration::from_millis(min_interval_ms),
        }
    }

    /// Wait until at least the minimum interval has passed since the last
    /// paced request, then claim the slot.
    pub async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        let elapsed = last.elapsed();
        if elapsed < self.min_interval {
            sleep(self.min_interval - elapsed).await;
        }
        *last = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pacer_enforces_minimum_interval() {
        let pacer = RequestPacer::new(50);
        let start = Instant::now();
        pacer.pace().await;
        pacer.pace().await;
        pacer.pace().await;
        // First call is free, the next two wait out the interval
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_pacer_with_zero_interval_does_not_wait() {
        let pacer = RequestPacer::new(0);
        let start = Instant::now();
        for _ in 0..10 {
            pacer.pace().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
