use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Suppresses repeats of the same key inside a time window
#[derive(Debug)]
pub struct CooldownTracker<K> {
    window: Duration,
    last_fired: HashMap<K, Instant>,
}

impl<K: Eq + Hash> CooldownTracker<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fired: HashMap::new(),
        }
    }

    /// Accept `key` if it has not fired within the window, recording the
    /// acceptance time. Suppressed attempts leave the timestamp untouched.
    pub fn try_fire(&mut self, key: K) -> bool {
        let now = Instant::now();
        match self.last_fired.get(&key) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                self.last_fired.insert(key, now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.last_fired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_suppresses_within_window() {
        let mut tracker = CooldownTracker::new(Duration::from_secs(5));
        assert!(tracker.try_fire(("fight", "Lobby")));
        assert!(!tracker.try_fire(("fight", "Lobby")));
        // different key is independent
        assert!(tracker.try_fire(("fight", "Gate")));
        assert!(tracker.try_fire(("fall", "Lobby")));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!tracker.try_fire(("fight", "Lobby")));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(tracker.try_fire(("fight", "Lobby")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_attempt_does_not_extend_window() {
        let mut tracker = CooldownTracker::new(Duration::from_secs(5));
        assert!(tracker.try_fire("fire"));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!tracker.try_fire("fire"));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(tracker.try_fire("fire"));
        assert_eq!(tracker.len(), 1);
    }
}
