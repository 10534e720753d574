//! Per-destination send spacing
//!
//! Keeps at least `min_interval` between consecutive sends to the same
//! channel. Callers reserve a slot under the lock and sleep outside it, so
//! concurrent senders to one channel queue up in order while sends to other
//! channels are unaffected.

use crate::ids::ChannelId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Minimum spacing between sends to one channel
pub struct SendThrottle {
    min_interval: Duration,
    next_slot: Mutex<HashMap<ChannelId, Instant>>,
}

impl SendThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// No spacing at all
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Wait until a send to `channel` is allowed
    pub async fn acquire(&self, channel: &ChannelId) {
        if self.min_interval.is_zero() {
            return;
        }

        let slot = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            // Channels whose next slot has passed need no entry
            slots.retain(|_, next| *next > now);
            let slot = slots.get(channel).copied().unwrap_or(now);
            slots.insert(channel.clone(), slot + self.min_interval);
            slot
        };

        if slot > Instant::now() {
            tracing::trace!(channel = %channel, "Throttling send");
            sleep_until(slot).await;
        }
    }
}

#[cfg(test)]
impl SendThrottle {
    async fn tracked_channels(&self) -> usize {
        self.next_slot.lock().await.len()
    }
}

impl Default for SendThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_spacing_per_channel() {
        let throttle = SendThrottle::new(Duration::from_millis(500));
        let a = ChannelId::new("a");
        let b = ChannelId::new("b");
        let start = Instant::now();

        throttle.acquire(&a).await;
        throttle.acquire(&b).await;
        assert!(start.elapsed() < Duration::from_millis(10));

        throttle.acquire(&a).await;
        assert!(start.elapsed() >= Duration::from_millis(500));

        throttle.acquire(&a).await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_channels_are_dropped() {
        let throttle = SendThrottle::new(Duration::from_millis(500));
        for name in ["a", "b", "c"] {
            throttle.acquire(&ChannelId::new(name)).await;
        }
        assert_eq!(throttle.tracked_channels().await, 3);

        tokio::time::advance(Duration::from_secs(1)).await;
        throttle.acquire(&ChannelId::new("d")).await;
        assert_eq!(throttle.tracked_channels().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_waits() {
        let throttle = SendThrottle::disabled();
        let a = ChannelId::new("a");
        let start = Instant::now();
        for _ in 0..5 {
            throttle.acquire(&a).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
