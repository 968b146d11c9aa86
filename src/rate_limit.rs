use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Entries are swept once the map grows past this many keys.
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window counter kept in process memory.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    entries: HashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            entries: HashMap::new(),
        }
    }

    pub fn check(&mut self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&mut self, key: &str, now: Instant) -> Decision {
        if self.entries.len() > SWEEP_THRESHOLD {
            self.sweep(now);
        }
        let window = self.window;
        let entry = self.entries.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }
        if entry.count >= self.limit {
            let elapsed = now.duration_since(entry.started);
            return Decision::Limited {
                retry_after: window.saturating_sub(elapsed),
            };
        }
        entry.count += 1;
        Decision::Allowed {
            remaining: self.limit - entry.count,
        }
    }

    pub fn reset(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn sweep(&mut self, now: Instant) {
        let window = self.window;
        self.entries
            .retain(|_, w| now.duration_since(w.started) < window);
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_after_quota_then_recovers() {
        let mut rl = RateLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        assert_eq!(rl.check_at("k", t0), Decision::Allowed { remaining: 1 });
        assert_eq!(rl.check_at("k", t0), Decision::Allowed { remaining: 0 });
        match rl.check_at("k", t0 + Duration::from_secs(15)) {
            Decision::Limited { retry_after } => assert_eq!(retry_after, Duration::from_secs(45)),
            other => panic!("expected limited, got {:?}", other),
        }
        assert_eq!(
            rl.check_at("k", t0 + Duration::from_secs(60)),
            Decision::Allowed { remaining: 1 }
        );
    }

    #[test]
    fn keys_are_independent_and_resettable() {
        let mut rl = RateLimiter::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(matches!(rl.check_at("a", t0), Decision::Allowed { .. }));
        assert!(matches!(rl.check_at("b", t0), Decision::Allowed { .. }));
        assert!(matches!(rl.check_at("a", t0), Decision::Limited { .. }));
        rl.reset("a");
        assert!(matches!(rl.check_at("a", t0), Decision::Allowed { .. }));
    }

    #[test]
    fn expired_windows_are_swept() {
        let mut rl = RateLimiter::new(1, Duration::from_secs(1));
        let t0 = Instant::now();
        for i in 0..=SWEEP_THRESHOLD {
            rl.check_at(&format!("k{}", i), t0);
        }
        rl.check_at("late", t0 + Duration::from_secs(5));
        assert_eq!(rl.tracked_keys(), 1);
    }
}
