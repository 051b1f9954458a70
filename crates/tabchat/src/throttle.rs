use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Spaces out processing of inbound broadcast envelopes.
///
/// An item is handed back for immediate processing only when nothing is
/// queued and `min_interval` has passed since the last processed item.
/// Everything else waits for [`SignalThrottle::drain_one`], which the
/// participant calls once per drain tick.
#[derive(Debug)]
pub struct SignalThrottle<T> {
    min_interval: Duration,
    last_processed: Option<Instant>,
    pending: VecDeque<T>,
}

impl<T> SignalThrottle<T> {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_processed: None,
            pending: VecDeque::new(),
        }
    }

    pub fn admit(&mut self, now: Instant, item: T) -> Option<T> {
        let spaced = self
            .last_processed
            .is_none_or(|last| now.saturating_duration_since(last) >= self.min_interval);
        if spaced && self.pending.is_empty() {
            self.last_processed = Some(now);
            return Some(item);
        }
        self.pending.push_back(item);
        None
    }

    pub fn drain_one(&mut self, now: Instant) -> Option<T> {
        let item = self.pending.pop_front()?;
        self.last_processed = Some(now);
        Some(item)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
