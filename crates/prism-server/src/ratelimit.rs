//! In-memory token-bucket rate limiter keyed by client IP.
//!
//! Each IP gets a bucket sized for the per-minute allowance with a per-second
//! burst refill. A client that drains its bucket is blocked outright for the
//! configured window, then resumes with a full bucket. Stale buckets are
//! swept by a background task.

use axum::{
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use prism_config::schema::RateLimitConfig;

/// A token bucket for a single client, with a secondary per-second gate.
#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
    second_start: Instant,
    second_count: u32,
}

impl Bucket {
    fn new(burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: Instant::now(),
            blocked_until: None,
            second_start: Instant::now(),
            second_count: 0,
        }
    }

    fn try_consume(&mut self, cfg: &RateLimitConfig) -> Result<(), u64> {
        let now = Instant::now();

        if let Some(until) = self.blocked_until {
            if now < until {
                return Err((until - now).as_secs().max(1));
            }
            // Block expired: start over with a full bucket.
            self.blocked_until = None;
            self.tokens = cfg.per_minute as f64;
        }

        // Per-second burst gate. Tripping it is momentary back-pressure and
        // does not start the long block.
        if now.duration_since(self.second_start) >= Duration::from_secs(1) {
            self.second_start = now;
            self.second_count = 0;
        }
        if self.second_count >= cfg.burst_per_sec {
            return Err(1);
        }

        // Sustained refill of the minute budget.
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let refill_per_sec = cfg.per_minute as f64 / 60.0;
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(cfg.per_minute as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.second_count += 1;
            Ok(())
        } else {
            // Minute budget exhausted: block for the full window.
            self.blocked_until = Some(now + Duration::from_secs(cfg.block_secs));
            Err(cfg.block_secs)
        }
    }
}

/// Shared limiter state, keyed by client IP.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<IpAddr, Bucket>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Ok(()) when allowed, Err(retry_after_secs) when limited.
    pub fn check(&self, ip: IpAddr) -> Result<(), u64> {
        let mut entry = self
            .buckets
            .entry(ip)
            .or_insert_with(|| Bucket::new(self.config.per_minute));
        entry.try_consume(&self.config)
    }

    /// Evict buckets idle longer than the sweep window. Blocked entries are
    /// kept so a block cannot be dodged by going idle.
    pub fn cleanup(&self) {
        let cutoff = Instant::now() - Duration::from_secs(self.config.sweep_idle_secs);
        let now = Instant::now();
        self.buckets.retain(|_ip, bucket| {
            bucket.last_refill > cutoff || bucket.blocked_until.is_some_and(|t| t > now)
        });
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }
}

/// Axum middleware applying the limiter to API routes.
pub async fn rate_limit_middleware(
    axum::extract::Extension(limiter): axum::extract::Extension<RateLimiter>,
    axum::extract::Extension(metrics): axum::extract::Extension<crate::metrics::Metrics>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let ip = extract_client_ip(&req);

    match limiter.check(ip) {
        Ok(()) => next.run(req).await,
        Err(retry_after) => {
            warn!(client_ip = %ip, retry_after, "rate limited");
            metrics.inc_rate_limit_blocks();
            let body = serde_json::json!({
                "error_kind": "rate_limited",
                "retry_after_secs": retry_after,
            });
            let mut resp =
                (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
            if let Ok(value) = retry_after.to_string().parse() {
                resp.headers_mut().insert("retry-after", value);
            }
            resp
        }
    }
}

/// Client IP from X-Forwarded-For, then X-Real-IP, then loopback.
fn extract_client_ip(req: &Request<axum::body::Body>) -> IpAddr {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(val) = forwarded.to_str()
        && let Some(first) = val.split(',').next()
        && let Ok(ip) = first.trim().parse::<IpAddr>()
    {
        return ip;
    }
    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(val) = real_ip.to_str()
        && let Ok(ip) = val.trim().parse::<IpAddr>()
    {
        return ip;
    }
    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    // Burst gate opened wide so the minute-budget tests can fire rapidly.
    fn config(per_minute: u32, block_secs: u64) -> RateLimitConfig {
        RateLimitConfig {
            per_minute,
            burst_per_sec: 10_000,
            block_secs,
            sweep_idle_secs: 600,
        }
    }

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn test_budget_is_enforced() {
        let limiter = RateLimiter::new(config(60, 300));
        for _ in 0..60 {
            assert!(limiter.check(ip(1)).is_ok());
        }
        // The 61st request within the window is blocked.
        let retry = limiter.check(ip(1)).unwrap_err();
        assert!(retry > 0);
    }

    #[test]
    fn test_block_persists_after_exhaustion() {
        let limiter = RateLimiter::new(config(2, 300));
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(1)).is_err());
        // Still blocked on the next attempt, with the block window reported.
        let retry = limiter.check(ip(1)).unwrap_err();
        assert!(retry >= 1 && retry <= 300);
    }

    #[test]
    fn test_different_ips_are_independent() {
        let limiter = RateLimiter::new(config(1, 300));
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(1)).is_err());
        assert!(limiter.check(ip(2)).is_ok());
    }

    #[test]
    fn test_block_expiry_restores_budget() {
        let limiter = RateLimiter::new(config(2, 0));
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(1)).is_err());
        // block_secs = 0: the block expires immediately and the bucket is
        // refilled in full.
        assert!(limiter.check(ip(1)).is_ok());
    }

    #[test]
    fn test_per_second_burst_gate() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_minute: 1_000,
            burst_per_sec: 5,
            block_secs: 300,
            sweep_idle_secs: 600,
        });
        for _ in 0..5 {
            assert!(limiter.check(ip(1)).is_ok());
        }
        // The 6th request in the same second is pushed back for a second,
        // not blocked for the full window.
        assert_eq!(limiter.check(ip(1)).unwrap_err(), 1);
    }

    #[test]
    fn test_cleanup_keeps_blocked_clients() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_minute: 1,
            burst_per_sec: 100,
            block_secs: 600,
            sweep_idle_secs: 0,
        });
        limiter.check(ip(1)).unwrap();
        let _ = limiter.check(ip(1)); // exhausts and blocks
        limiter.check(ip(2)).unwrap(); // idle, unblocked
        limiter.cleanup();
        // Blocked entry survives; eviction applies only to idle clean ones.
        assert!(limiter.check(ip(1)).is_err());
    }
}
