use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Route class for rate limiting. Login/signup get the strict tier; health
/// probes never reach the limiter at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Auth,
    Default,
}

/// Sliding one-minute window per `(route class, caller)`.
#[derive(Debug)]
pub struct RateLimiter {
    default_per_minute: u32,
    auth_per_minute: u32,
    windows: Mutex<HashMap<(RouteClass, String), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(default_per_minute: u32, auth_per_minute: u32) -> Self {
        Self {
            default_per_minute,
            auth_per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Records one hit; returns the seconds to wait when over the limit.
    pub fn check(&self, class: RouteClass, key: &str) -> Result<(), u64> {
        let limit = match class {
            RouteClass::Auth => self.auth_per_minute,
            RouteClass::Default => self.default_per_minute,
        } as usize;
        let now = Instant::now();

        let mut windows = self.windows.lock().unwrap();
        let window = windows
            .entry((class, key.to_string()))
            .or_default();
        while let Some(front) = window.front() {
            if now.duration_since(*front) > WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= limit {
            let oldest = window.front().copied().unwrap_or(now);
            let retry_after = WINDOW
                .saturating_sub(now.duration_since(oldest))
                .as_secs()
                .max(1);
            return Err(retry_after);
        }
        window.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allows_up_to_the_limit() {
        let limiter = RateLimiter::new(3, 1);
        assert!(limiter.check(RouteClass::Default, "u1").is_ok());
        assert!(limiter.check(RouteClass::Default, "u1").is_ok());
        assert!(limiter.check(RouteClass::Default, "u1").is_ok());

        let retry = limiter.check(RouteClass::Default, "u1").unwrap_err();
        assert!(retry >= 1);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, 1);
        assert!(limiter.check(RouteClass::Default, "u1").is_ok());
        assert!(limiter.check(RouteClass::Default, "u2").is_ok());
        assert!(limiter.check(RouteClass::Default, "u1").is_err());
    }

    #[test]
    fn auth_tier_is_stricter() {
        let limiter = RateLimiter::new(30, 2);
        assert!(limiter.check(RouteClass::Auth, "ip").is_ok());
        assert!(limiter.check(RouteClass::Auth, "ip").is_ok());
        assert!(limiter.check(RouteClass::Auth, "ip").is_err());
        // The default tier for the same key is unaffected.
        assert!(limiter.check(RouteClass::Default, "ip").is_ok());
    }
}
