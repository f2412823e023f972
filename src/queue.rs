use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A single queued notification payload with its local arrival time.
#[derive(Debug, Clone)]
pub struct TimedEntry {
    pub arrived_at: Instant,
    pub payload: Vec<u8>,
}

/// Bounded time-window FIFO for one peer's raw notification payloads.
///
/// Entries older than `freshness_horizon` are evicted lazily on every read,
/// never on `put` alone, so `put` itself can never fail or block on eviction work.
pub struct TimedQueue {
    freshness_horizon: Duration,
    entries: Mutex<VecDeque<TimedEntry>>,
}

impl TimedQueue {
    pub fn new(freshness_horizon: Duration) -> Self {
        Self {
            freshness_horizon,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a freshly-arrived payload. Safe to call from the backend's
    /// notification thread; never blocks for long and never fails.
    pub fn put(&self, payload: Vec<u8>) {
        let mut entries = self.entries.lock().unwrap();
        entries.push_back(TimedEntry {
            arrived_at: Instant::now(),
            payload,
        });
        Self::evict_stale(&mut entries, self.freshness_horizon);
    }

    /// Evict stale entries, then return the newest remaining entry without removing it.
    pub fn peek_newest(&self) -> Option<TimedEntry> {
        let mut entries = self.entries.lock().unwrap();
        Self::evict_stale(&mut entries, self.freshness_horizon);
        entries.back().cloned()
    }

    /// Evict stale entries, then remove and return the oldest remaining entry.
    pub fn pop_oldest(&self) -> Option<TimedEntry> {
        let mut entries = self.entries.lock().unwrap();
        Self::evict_stale(&mut entries, self.freshness_horizon);
        entries.pop_front()
    }

    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    pub fn size(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        Self::evict_stale(&mut entries, self.freshness_horizon);
        entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    fn evict_stale(entries: &mut VecDeque<TimedEntry>, freshness_horizon: Duration) {
        let now = Instant::now();
        while let Some(front) = entries.front() {
            if now.duration_since(front.arrived_at) > freshness_horizon {
                entries.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn empty_queue_has_no_entries() {
        let q = TimedQueue::new(Duration::from_millis(300));
        assert!(q.empty());
        assert_eq!(q.size(), 0);
        assert!(q.peek_newest().is_none());
        assert!(q.pop_oldest().is_none());
    }

    #[test]
    fn put_then_peek_returns_newest_without_removing() {
        let q = TimedQueue::new(Duration::from_millis(300));
        q.put(vec![1]);
        q.put(vec![2]);
        assert_eq!(q.size(), 2);
        let newest = q.peek_newest().unwrap();
        assert_eq!(newest.payload, vec![2]);
        // peek is idempotent: still 2 entries afterwards.
        assert_eq!(q.size(), 2);
    }

    #[test]
    fn pop_oldest_removes_in_fifo_order() {
        let q = TimedQueue::new(Duration::from_millis(300));
        q.put(vec![1]);
        q.put(vec![2]);
        let first = q.pop_oldest().unwrap();
        assert_eq!(first.payload, vec![1]);
        assert_eq!(q.size(), 1);
        let second = q.pop_oldest().unwrap();
        assert_eq!(second.payload, vec![2]);
        assert!(q.empty());
    }

    #[test]
    fn stale_entries_are_evicted_on_read() {
        let q = TimedQueue::new(Duration::from_millis(20));
        q.put(vec![1]);
        sleep(Duration::from_millis(40));
        assert!(q.empty());
        assert!(q.peek_newest().is_none());
    }

    #[test]
    fn clear_drops_all_entries() {
        let q = TimedQueue::new(Duration::from_millis(300));
        q.put(vec![1]);
        q.put(vec![2]);
        q.clear();
        assert!(q.empty());
    }

    #[test]
    fn high_rate_producer_is_bounded_by_freshness_horizon() {
        let q = TimedQueue::new(Duration::from_millis(50));
        for i in 0..100u8 {
            q.put(vec![i]);
        }
        // All entries arrived "now", well within the horizon, so none are evicted yet.
        assert_eq!(q.size(), 100);
        sleep(Duration::from_millis(60));
        // Every entry is now stale; a single read clears the backlog.
        assert!(q.empty());
    }
}
