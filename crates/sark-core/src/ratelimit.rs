//! Request admission control.
//!
//! Token bucket per (principal, resource) plus fixed minute/hour/day window
//! ceilings, so a burst can never drain a daily quota. The effective limit is
//! min(role limit, sensitivity limit) scaled by the server-load multiplier.
//! Exempt principals (explicit overrides, health checks) bypass all checks.
//!
//! Internal failures never become request failures: a poisoned bucket lock
//! resolves to a deny with short retry guidance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::model::{Principal, Sensitivity};

/// Server load tiers reported by the host process. The multiplier shrinks
/// limits under pressure and relaxes them when idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadTier {
    Low,
    Normal,
    High,
    Critical,
}

impl LoadTier {
    pub fn multiplier(&self) -> f64 {
        match self {
            LoadTier::Low => 1.5,
            LoadTier::Normal => 1.0,
            LoadTier::High => 0.75,
            LoadTier::Critical => 0.5,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoadTier::Low,
            2 => LoadTier::High,
            3 => LoadTier::Critical,
            _ => LoadTier::Normal,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LoadTier::Low => 0,
            LoadTier::Normal => 1,
            LoadTier::High => 2,
            LoadTier::Critical => 3,
        }
    }
}

/// Limiter configuration. The numbers here are illustrative defaults; every
/// deployment overrides them in gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Per-minute limits by role.
    #[serde(default = "default_role_limits")]
    pub role_limits: HashMap<String, u32>,
    #[serde(default = "default_role_limit")]
    pub default_role_limit: u32,
    /// Per-minute limits by resource sensitivity.
    #[serde(default = "default_sensitivity_limits")]
    pub sensitivity_limits: HashMap<Sensitivity, u32>,
    /// Bound on any rolling 60s window relative to the effective limit.
    /// With bucket capacity equal to the limit, refill over a full window
    /// admits at most `2 x limit`, hence the default.
    #[serde(default = "default_burst_multiplier")]
    pub burst_multiplier: f64,
    /// Fixed-window ceilings. The minute ceiling defaults to the effective
    /// limit itself.
    #[serde(default = "default_hour_ceiling")]
    pub hour_ceiling: u32,
    #[serde(default = "default_day_ceiling")]
    pub day_ceiling: u32,
    /// Principal ids that bypass every check.
    #[serde(default)]
    pub exempt_principals: Vec<String>,
    /// Glob patterns for designated health-check principals.
    #[serde(default = "default_health_check_patterns")]
    pub health_check_patterns: Vec<String>,
}

fn default_role_limits() -> HashMap<String, u32> {
    HashMap::from([
        ("admin".to_string(), 600),
        ("developer".to_string(), 300),
        ("user".to_string(), 100),
    ])
}

fn default_role_limit() -> u32 {
    60
}

fn default_sensitivity_limits() -> HashMap<Sensitivity, u32> {
    HashMap::from([
        (Sensitivity::Low, 600),
        (Sensitivity::Medium, 300),
        (Sensitivity::High, 120),
        (Sensitivity::Critical, 30),
    ])
}

fn default_burst_multiplier() -> f64 {
    2.0
}

fn default_hour_ceiling() -> u32 {
    5_000
}

fn default_day_ceiling() -> u32 {
    50_000
}

fn default_health_check_patterns() -> Vec<String> {
    vec!["health-*".to_string(), "probe-*".to_string()]
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            role_limits: default_role_limits(),
            default_role_limit: default_role_limit(),
            sensitivity_limits: default_sensitivity_limits(),
            burst_multiplier: default_burst_multiplier(),
            hour_ceiling: default_hour_ceiling(),
            day_ceiling: default_day_ceiling(),
            exempt_principals: Vec::new(),
            health_check_patterns: default_health_check_patterns(),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u64,
    pub retry_after: Option<Duration>,
}

impl Admission {
    fn exempt(limit: u32) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: u64::from(limit),
            retry_after: None,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    minute_start: Instant,
    minute_count: u32,
    hour_start: Instant,
    hour_count: u32,
    day_start: Instant,
    day_count: u32,
}

impl BucketState {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            minute_start: now,
            minute_count: 0,
            hour_start: now,
            hour_count: 0,
            day_start: now,
            day_count: 0,
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    load: AtomicU8,
    buckets: DashMap<String, Mutex<BucketState>>,
    health_checks: GlobSet,
}

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3_600);
const DAY: Duration = Duration::from_secs(86_400);

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.health_check_patterns {
            if let Ok(glob) = Glob::new(pattern) {
                builder.add(glob);
            } else {
                tracing::warn!(pattern, "ignoring invalid health-check pattern");
            }
        }
        let health_checks = builder.build().unwrap_or_else(|_| GlobSet::empty());
        Self {
            config,
            load: AtomicU8::new(LoadTier::Normal.as_u8()),
            buckets: DashMap::new(),
            health_checks,
        }
    }

    pub fn set_load_tier(&self, tier: LoadTier) {
        self.load.store(tier.as_u8(), Ordering::Relaxed);
    }

    pub fn load_tier(&self) -> LoadTier {
        LoadTier::from_u8(self.load.load(Ordering::Relaxed))
    }

    fn is_exempt(&self, principal: &Principal) -> bool {
        self.config
            .exempt_principals
            .iter()
            .any(|p| p == &principal.id)
            || self.health_checks.is_match(&principal.id)
    }

    /// Effective per-minute limit for a principal acting on a resource of
    /// the given sensitivity, under current load.
    pub fn effective_limit(&self, principal: &Principal, sensitivity: Sensitivity) -> u32 {
        let role_limit = self
            .config
            .role_limits
            .get(&principal.role)
            .copied()
            .unwrap_or(self.config.default_role_limit);
        let sensitivity_limit = self
            .config
            .sensitivity_limits
            .get(&sensitivity)
            .copied()
            .unwrap_or(self.config.default_role_limit);
        let base = role_limit.min(sensitivity_limit);
        let scaled = (f64::from(base) * self.load_tier().multiplier()).floor();
        (scaled as u32).max(1)
    }

    /// Admit or deny a request. `cost` tokens are consumed when admitted;
    /// partial consumption on a cancelled request upstream is acceptable and
    /// intentional.
    pub fn admit(
        &self,
        principal: &Principal,
        resource: &str,
        sensitivity: Sensitivity,
        cost: u32,
    ) -> Admission {
        let limit = self.effective_limit(principal, sensitivity);
        if self.is_exempt(principal) {
            return Admission::exempt(limit);
        }

        let key = format!("{}:{}", principal.id, resource);
        let now = Instant::now();
        let capacity = f64::from(limit);
        let rate_per_sec = capacity / 60.0;

        let cell = self
            .buckets
            .entry(key)
            .or_insert_with(|| Mutex::new(BucketState::new(capacity, now)));

        let mut state = match cell.lock() {
            Ok(state) => state,
            Err(_) => {
                // A poisoned bucket means a panicked holder; deny briefly
                // rather than guess at the counter state.
                tracing::warn!(principal = %principal.id, "rate limiter state poisoned, denying");
                return Admission {
                    allowed: false,
                    limit,
                    remaining: 0,
                    retry_after: Some(Duration::from_secs(1)),
                };
            }
        };

        // Reborrow to a plain mutable reference so disjoint fields can be
        // borrowed simultaneously (e.g. in roll_window calls below).
        let state = &mut *state;

        // Monotonic refill; saturating_duration_since clamps any negative
        // elapsed to zero.
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * rate_per_sec).min(capacity);
        state.last_refill = now;

        roll_window(&mut state.minute_start, &mut state.minute_count, now, MINUTE);
        roll_window(&mut state.hour_start, &mut state.hour_count, now, HOUR);
        roll_window(&mut state.day_start, &mut state.day_count, now, DAY);

        let cost_f = f64::from(cost);
        let minute_ceiling = limit;

        if state.tokens < cost_f {
            let deficit = cost_f - state.tokens;
            let wait = Duration::from_secs_f64(deficit / rate_per_sec);
            return Admission {
                allowed: false,
                limit,
                remaining: state.tokens.floor() as u64,
                retry_after: Some(wait.max(Duration::from_secs(1))),
            };
        }

        if state.minute_count.saturating_add(cost) > minute_ceiling {
            let reset = MINUTE.saturating_sub(now.saturating_duration_since(state.minute_start));
            return Admission {
                allowed: false,
                limit,
                remaining: 0,
                retry_after: Some(reset.max(Duration::from_secs(1))),
            };
        }
        if state.hour_count.saturating_add(cost) > self.config.hour_ceiling {
            let reset = HOUR.saturating_sub(now.saturating_duration_since(state.hour_start));
            return Admission {
                allowed: false,
                limit,
                remaining: 0,
                retry_after: Some(reset.max(Duration::from_secs(1))),
            };
        }
        if state.day_count.saturating_add(cost) > self.config.day_ceiling {
            let reset = DAY.saturating_sub(now.saturating_duration_since(state.day_start));
            return Admission {
                allowed: false,
                limit,
                remaining: 0,
                retry_after: Some(reset.max(Duration::from_secs(1))),
            };
        }

        state.tokens -= cost_f;
        state.minute_count += cost;
        state.hour_count += cost;
        state.day_count += cost;

        Admission {
            allowed: true,
            limit,
            remaining: state.tokens.floor() as u64,
            retry_after: None,
        }
    }

    /// Drop accumulated state for a principal/resource pair (admin reset).
    pub fn reset(&self, principal_id: &str, resource: &str) -> bool {
        self.buckets
            .remove(&format!("{principal_id}:{resource}"))
            .is_some()
    }
}

fn roll_window(start: &mut Instant, count: &mut u32, now: Instant, width: Duration) {
    if now.saturating_duration_since(*start) >= width {
        *start = now;
        *count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(config)
    }

    fn user(role: &str) -> Principal {
        Principal::new("u-1", role)
    }

    #[test]
    fn effective_limit_is_min_of_role_and_sensitivity() {
        let limiter = limiter_with(RateLimitConfig::default());
        // user role = 100, high sensitivity = 120 -> 100
        assert_eq!(
            limiter.effective_limit(&user("user"), Sensitivity::High),
            100
        );
        // developer role = 300, critical sensitivity = 30 -> 30
        assert_eq!(
            limiter.effective_limit(&user("developer"), Sensitivity::Critical),
            30
        );
    }

    #[test]
    fn load_tier_scales_the_limit() {
        let limiter = limiter_with(RateLimitConfig::default());
        limiter.set_load_tier(LoadTier::Critical);
        assert_eq!(
            limiter.effective_limit(&user("user"), Sensitivity::Low),
            50
        );
        limiter.set_load_tier(LoadTier::Low);
        assert_eq!(
            limiter.effective_limit(&user("user"), Sensitivity::Low),
            150
        );
    }

    #[test]
    fn the_101st_request_in_a_window_is_denied_with_retry_after() {
        let limiter = limiter_with(RateLimitConfig::default());
        let p = user("user");
        for i in 0..100 {
            let admission = limiter.admit(&p, "srv-a/query", Sensitivity::Low, 1);
            assert!(admission.allowed, "request {i} should pass");
        }
        let denied = limiter.admit(&p, "srv-a/query", Sensitivity::Low, 1);
        assert!(!denied.allowed);
        let retry_after = denied.retry_after.expect("retry guidance");
        assert!(retry_after <= Duration::from_secs(60));
    }

    #[test]
    fn tokens_never_exceed_capacity_or_go_negative() {
        let limiter = limiter_with(RateLimitConfig::default());
        let p = user("user");
        // Burn the whole bucket.
        for _ in 0..100 {
            limiter.admit(&p, "r", Sensitivity::Low, 1);
        }
        let denied = limiter.admit(&p, "r", Sensitivity::Low, 1);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
    }

    #[test]
    fn cost_consumes_multiple_tokens() {
        let limiter = limiter_with(RateLimitConfig::default());
        let p = user("user");
        let admission = limiter.admit(&p, "r", Sensitivity::Low, 10);
        assert!(admission.allowed);
        assert_eq!(admission.remaining, 90);
    }

    #[test]
    fn exempt_principals_bypass_all_checks() {
        let config = RateLimitConfig {
            exempt_principals: vec!["svc-admin".to_string()],
            ..RateLimitConfig::default()
        };
        let limiter = limiter_with(config);
        let p = Principal::new("svc-admin", "user");
        for _ in 0..500 {
            assert!(limiter.admit(&p, "r", Sensitivity::Critical, 1).allowed);
        }
    }

    #[test]
    fn health_check_principals_bypass_by_pattern() {
        let limiter = limiter_with(RateLimitConfig::default());
        let p = Principal::new("health-ping", "user");
        for _ in 0..500 {
            assert!(limiter.admit(&p, "r", Sensitivity::Critical, 1).allowed);
        }
    }

    #[test]
    fn day_ceiling_caps_sustained_traffic() {
        let config = RateLimitConfig {
            day_ceiling: 5,
            hour_ceiling: 100,
            ..RateLimitConfig::default()
        };
        let limiter = limiter_with(config);
        let p = user("user");
        for _ in 0..5 {
            assert!(limiter.admit(&p, "r", Sensitivity::Low, 1).allowed);
        }
        let denied = limiter.admit(&p, "r", Sensitivity::Low, 1);
        assert!(!denied.allowed);
        assert!(denied.retry_after.is_some());
    }

    #[test]
    fn distinct_principals_do_not_share_buckets() {
        let limiter = limiter_with(RateLimitConfig::default());
        let a = Principal::new("u-a", "user");
        let b = Principal::new("u-b", "user");
        for _ in 0..100 {
            assert!(limiter.admit(&a, "r", Sensitivity::Low, 1).allowed);
        }
        assert!(!limiter.admit(&a, "r", Sensitivity::Low, 1).allowed);
        assert!(limiter.admit(&b, "r", Sensitivity::Low, 1).allowed);
    }

    #[test]
    fn reset_clears_state() {
        let limiter = limiter_with(RateLimitConfig::default());
        let p = user("user");
        for _ in 0..100 {
            limiter.admit(&p, "r", Sensitivity::Low, 1);
        }
        assert!(!limiter.admit(&p, "r", Sensitivity::Low, 1).allowed);
        assert!(limiter.reset("u-1", "r"));
        assert!(limiter.admit(&p, "r", Sensitivity::Low, 1).allowed);
    }
}
