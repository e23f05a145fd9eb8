//! Request rate limiting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use http::{HeaderMap, HeaderValue, StatusCode};

/// A simple token bucket rate limiter.
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        // Refill tokens
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Limit definition: at most `max_hits` requests per `time_window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatelimitSettings {
    pub max_hits: u32,
    pub time_window: Duration,
}

impl RatelimitSettings {
    fn refill_rate(&self) -> f64 {
        f64::from(self.max_hits) / self.time_window.as_secs_f64().max(f64::EPSILON)
    }
}

/// Backend rate limit pushed into the state bag by a filter: the limit to
/// apply per backend host, and the status the synthetic rejection carries.
#[derive(Debug, Clone)]
pub struct BackendRatelimit {
    pub settings: RatelimitSettings,
    pub status_code: StatusCode,
}

/// Reported when the global limit rejects a request.
#[derive(Debug, Clone)]
pub struct RatelimitExceeded {
    pub settings: RatelimitSettings,
    pub retry_after: Duration,
}

impl RatelimitExceeded {
    /// Response headers advertising the limit to the client.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "retry-after",
            header_value(self.retry_after.as_secs().max(1)),
        );
        headers.insert("x-rate-limit", header_value(self.settings.max_hits.into()));
        headers.insert(
            "x-rate-limit-duration",
            header_value(self.settings.time_window.as_secs()),
        );
        headers
    }
}

fn header_value(n: u64) -> HeaderValue {
    HeaderValue::from_str(&n.to_string()).expect("numeric header value")
}

/// Registry of token buckets keyed by client or backend identity.
///
/// Externally owned; the engine consults it pre-routing (global limit,
/// keyed by client IP) and post-mapping (backend limit, keyed by
/// `scheme://host`). Concurrent-safe.
pub struct RatelimitRegistry {
    global: Option<RatelimitSettings>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RatelimitRegistry {
    pub fn new(global: Option<RatelimitSettings>) -> Self {
        Self {
            global,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Check the global limit for a client. `None` means allowed.
    pub fn check_global(&self, client: &str) -> Option<RatelimitExceeded> {
        let settings = self.global?;
        if self.acquire(&format!("global:{client}"), settings) {
            return None;
        }
        Some(RatelimitExceeded {
            settings,
            retry_after: settings.time_window,
        })
    }

    /// Check a backend limit for the given `scheme://host` key.
    pub fn allow_backend(&self, settings: RatelimitSettings, key: &str) -> bool {
        self.acquire(&format!("backend:{key}"), settings)
    }

    fn acquire(&self, key: &str, settings: RatelimitSettings) -> bool {
        let capacity = f64::from(settings.max_hits.max(1));
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(capacity));
        bucket.try_acquire(capacity, settings.refill_rate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_hits: u32, secs: u64) -> RatelimitSettings {
        RatelimitSettings {
            max_hits,
            time_window: Duration::from_secs(secs),
        }
    }

    #[test]
    fn global_limit_rejects_after_burst() {
        let registry = RatelimitRegistry::new(Some(settings(2, 60)));

        assert!(registry.check_global("10.0.0.1").is_none());
        assert!(registry.check_global("10.0.0.1").is_none());
        let exceeded = registry.check_global("10.0.0.1").expect("limited");
        assert_eq!(exceeded.settings.max_hits, 2);

        // Other clients have their own bucket.
        assert!(registry.check_global("10.0.0.2").is_none());
    }

    #[test]
    fn no_global_settings_means_no_limit() {
        let registry = RatelimitRegistry::new(None);
        for _ in 0..100 {
            assert!(registry.check_global("10.0.0.1").is_none());
        }
    }

    #[test]
    fn backend_limit_is_keyed_by_host() {
        let registry = RatelimitRegistry::new(None);
        let s = settings(1, 60);

        assert!(registry.allow_backend(s, "http://a.internal"));
        assert!(!registry.allow_backend(s, "http://a.internal"));
        assert!(registry.allow_backend(s, "http://b.internal"));
    }

    #[test]
    fn exceeded_headers_are_complete() {
        let exceeded = RatelimitExceeded {
            settings: settings(10, 60),
            retry_after: Duration::from_secs(60),
        };
        let headers = exceeded.headers();
        assert_eq!(headers.get("retry-after").unwrap(), "60");
        assert_eq!(headers.get("x-rate-limit").unwrap(), "10");
        assert_eq!(headers.get("x-rate-limit-duration").unwrap(), "60");
    }
}
