//! Sliding-window send counter keyed by identity.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Per-identity override of the default limit and window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserLimit {
    pub limit: u64,
    pub duration_seconds: u64,
}

/// Where the limit sits relative to the number of sends still in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Refuse once the window already holds `limit` sends, so at most `limit`
    /// are admitted per window (policy path).
    AtLimit,
    /// Refuse only once the window holds more than `limit` sends; a full
    /// window still admits one more (pickup path).
    OverLimit,
}

impl Boundary {
    fn refuses(self, count: u64, limit: u64) -> bool {
        match self {
            Boundary::AtLimit => count >= limit,
            Boundary::OverLimit => count > limit,
        }
    }
}

/// Outcome of one [`RateLimiter::admit`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub limit: u64,
    pub duration_seconds: u64,
    /// Sends in the window after this decision.
    pub count: u64,
}

/// Recorded sends of one identity, oldest first, and the window length they
/// were last admitted against.
struct Window {
    sends: VecDeque<Instant>,
    length: Duration,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        // Timestamps are appended in order, so stale ones sit at the front.
        while let Some(&oldest) = self.sends.front() {
            if now.saturating_duration_since(oldest) < self.length {
                break;
            }
            self.sends.pop_front();
        }
    }
}

/// An identity without an entry and one with an empty history are the same
/// thing; entries are dropped once they empty out.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(
        &self,
        identity: &str,
        defaults: UserLimit,
        overrides: &HashMap<String, UserLimit>,
        boundary: Boundary,
    ) -> Admission {
        self.admit_at(identity, defaults, overrides, boundary, Instant::now())
    }

    /// Prune, check and record in one critical section, evaluated at `now`.
    pub fn admit_at(
        &self,
        identity: &str,
        defaults: UserLimit,
        overrides: &HashMap<String, UserLimit>,
        boundary: Boundary,
        now: Instant,
    ) -> Admission {
        let identity = identity.to_lowercase();
        let UserLimit {
            limit,
            duration_seconds,
        } = overrides.get(&identity).copied().unwrap_or(defaults);
        let length = Duration::from_secs(duration_seconds);

        let mut windows = self.lock();
        let count = match windows.get_mut(&identity) {
            Some(window) => {
                window.length = length;
                window.prune(now);
                window.sends.len() as u64
            }
            None => 0,
        };

        if boundary.refuses(count, limit) {
            if count == 0 {
                windows.remove(&identity);
            }
            return Admission {
                allowed: false,
                limit,
                duration_seconds,
                count,
            };
        }

        windows
            .entry(identity)
            .or_insert_with(|| Window {
                sends: VecDeque::new(),
                length,
            })
            .sends
            .push_back(now);
        Admission {
            allowed: true,
            limit,
            duration_seconds,
            count: count + 1,
        }
    }

    /// Number of sends still in the window per identity, sorted by identity.
    pub fn snapshot(&self) -> Vec<(String, usize)> {
        self.snapshot_at(Instant::now())
    }

    /// Prunes every identity against `now`, forgets the emptied ones and
    /// reports what is left.
    pub fn snapshot_at(&self, now: Instant) -> Vec<(String, usize)> {
        let mut windows = self.lock();
        windows.retain(|_, window| {
            window.prune(now);
            !window.sends.is_empty()
        });

        let mut counts: Vec<(String, usize)> = windows
            .iter()
            .map(|(identity, window)| (identity.clone(), window.sends.len()))
            .collect();
        counts.sort();
        counts
    }

    /// Identities currently holding an entry.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const DEFAULTS: UserLimit = UserLimit {
        limit: 2,
        duration_seconds: 60,
    };

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_at_limit_refuses_with_limit_prior_entries() {
        let limiter = RateLimiter::new();
        let none = HashMap::new();
        let t0 = Instant::now();

        let results: Vec<(bool, u64)> = (0..3)
            .map(|i| {
                let a = limiter.admit_at("alice", DEFAULTS, &none, Boundary::AtLimit, t0 + secs(i));
                (a.allowed, a.count)
            })
            .collect();

        assert_eq!(results, vec![(true, 1), (true, 2), (false, 2)]);
    }

    #[test]
    fn test_over_limit_admits_one_more_then_refuses() {
        let limiter = RateLimiter::new();
        let none = HashMap::new();
        let t0 = Instant::now();

        let results: Vec<(bool, u64)> = (0..4)
            .map(|_| {
                let a = limiter.admit_at("bob@10.0.0.1", DEFAULTS, &none, Boundary::OverLimit, t0);
                (a.allowed, a.count)
            })
            .collect();

        // two prior entries is not more than the limit, so the third still passes
        assert_eq!(results, vec![(true, 1), (true, 2), (true, 3), (false, 3)]);
    }

    #[test]
    fn test_window_prunes_entries_at_or_past_duration() {
        let limiter = RateLimiter::new();
        let none = HashMap::new();
        let t0 = Instant::now();
        let limits = UserLimit {
            limit: 10,
            duration_seconds: 60,
        };

        limiter.admit_at("carol", limits, &none, Boundary::AtLimit, t0);
        limiter.admit_at("carol", limits, &none, Boundary::AtLimit, t0 + secs(30));

        // t0 is exactly 60s old and must be gone; t0+30 is 30s old and stays
        let a = limiter.admit_at("carol", limits, &none, Boundary::AtLimit, t0 + secs(60));
        assert_eq!(a.count, 2);

        // idle for a full window empties the history
        let a = limiter.admit_at("carol", limits, &none, Boundary::AtLimit, t0 + secs(200));
        assert_eq!(a.count, 1);
    }

    #[test]
    fn test_rejected_attempt_is_not_recorded() {
        let limiter = RateLimiter::new();
        let none = HashMap::new();
        let t0 = Instant::now();
        let one = UserLimit {
            limit: 1,
            duration_seconds: 10,
        };

        assert!(limiter.admit_at("dave", one, &none, Boundary::AtLimit, t0).allowed);
        for i in 1..5 {
            let a = limiter.admit_at("dave", one, &none, Boundary::AtLimit, t0 + secs(i));
            assert!(!a.allowed);
            assert_eq!(a.count, 1);
        }
        assert!(limiter.admit_at("dave", one, &none, Boundary::AtLimit, t0 + secs(10)).allowed);
    }

    #[test]
    fn test_identity_is_case_insensitive() {
        let limiter = RateLimiter::new();
        let none = HashMap::new();

        limiter.admit("User@Host", DEFAULTS, &none, Boundary::AtLimit);
        let a = limiter.admit("user@host", DEFAULTS, &none, Boundary::AtLimit);

        assert_eq!(a.count, 2);
        assert_eq!(limiter.snapshot(), vec![("user@host".to_string(), 2)]);
    }

    #[test]
    fn test_override_replaces_defaults() {
        let limiter = RateLimiter::new();
        let mut overrides = HashMap::new();
        overrides.insert(
            "vip".to_string(),
            UserLimit {
                limit: 100,
                duration_seconds: 3600,
            },
        );

        let a = limiter.admit("VIP", DEFAULTS, &overrides, Boundary::AtLimit);
        assert_eq!(a.limit, 100);
        assert_eq!(a.duration_seconds, 3600);

        let a = limiter.admit("other", DEFAULTS, &overrides, Boundary::AtLimit);
        assert_eq!(a.limit, 2);
        assert_eq!(a.duration_seconds, 60);
    }

    #[test]
    fn test_refused_identity_with_empty_history_is_forgotten() {
        let limiter = RateLimiter::new();
        let none = HashMap::new();
        let t0 = Instant::now();
        let short = UserLimit {
            limit: 1,
            duration_seconds: 1,
        };
        let closed = UserLimit {
            limit: 0,
            duration_seconds: 1,
        };

        for i in 0..1000 {
            let user = format!("user{i}");
            assert!(limiter.admit_at(&user, short, &none, Boundary::AtLimit, t0).allowed);
        }
        assert_eq!(limiter.len(), 1000);

        for i in 0..1000 {
            let user = format!("user{i}");
            let a = limiter.admit_at(&user, closed, &none, Boundary::AtLimit, t0 + secs(5));
            assert!(!a.allowed);
            assert_eq!(a.count, 0);
        }
        assert!(limiter.is_empty());

        // never admitted, never stored
        limiter.admit_at("stranger", closed, &none, Boundary::AtLimit, t0);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_snapshot_prunes_expired_sends() {
        let limiter = RateLimiter::new();
        let none = HashMap::new();
        let t0 = Instant::now();

        limiter.admit_at("erin", DEFAULTS, &none, Boundary::AtLimit, t0);
        limiter.admit_at("erin", DEFAULTS, &none, Boundary::AtLimit, t0 + secs(10));
        limiter.admit_at("frank", DEFAULTS, &none, Boundary::AtLimit, t0 + secs(50));

        assert_eq!(
            limiter.snapshot_at(t0 + secs(60)),
            vec![("erin".to_string(), 1), ("frank".to_string(), 1)]
        );
        assert_eq!(limiter.snapshot_at(t0 + secs(75)), vec![("frank".to_string(), 1)]);
        assert_eq!(limiter.len(), 1);
        assert!(limiter.snapshot_at(t0 + secs(200)).is_empty());
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_concurrent_admissions_respect_cap() {
        let limiter = Arc::new(RateLimiter::new());
        let cap = UserLimit {
            limit: 50,
            duration_seconds: 3600,
        };

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    let none = HashMap::new();
                    (0..20)
                        .filter(|_| limiter.admit("shared", cap, &none, Boundary::AtLimit).allowed)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
