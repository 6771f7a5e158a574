//! Cache-backed fixed-window rate limiter.
//!
//! カウンタは `LockStore::incr` で共有キャッシュに置くので、複数インスタンスでも同じ上限になる。
//! キーは `ratelimit:{scope}:{key}:{window}`。窓が変わればキーも変わり、古い窓は TTL で消える。

use std::sync::Arc;

use ticket_core::Clock;
use tracing::debug;

use crate::cache::{keys, LockStore};
use crate::error::{TicketError, TicketResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u64,
    pub window_ms: u64,
}

impl RateLimitRule {
    pub fn new(limit: u64, window_ms: u64) -> Self {
        Self { limit, window_ms }
    }

    /// `"30/60"` → 60 秒あたり 30 回。`"0"` や `"off"` は無効化。
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("off") || raw == "0" {
            return Some(Self::new(0, 0));
        }
        let (limit, secs) = raw.split_once('/')?;
        let limit = limit.trim().parse().ok()?;
        let secs: u64 = secs.trim().parse().ok()?;
        Some(Self::new(limit, secs.saturating_mul(1000)))
    }

    pub fn enabled(&self) -> bool {
        self.limit > 0 && self.window_ms > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Reserve,
    Checkout,
    Draw,
}

impl RateScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reserve => "reserve",
            Self::Checkout => "checkout",
            Self::Draw => "draw",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub reserve: RateLimitRule,
    pub checkout: RateLimitRule,
    pub draw: RateLimitRule,
}

impl RateLimits {
    pub fn rule(&self, scope: RateScope) -> RateLimitRule {
        match scope {
            RateScope::Reserve => self.reserve,
            RateScope::Checkout => self.checkout,
            RateScope::Draw => self.draw,
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            reserve: RateLimitRule::new(30, 60_000),
            checkout: RateLimitRule::new(10, 60_000),
            draw: RateLimitRule::new(3, 300_000),
        }
    }
}

pub struct WindowRateLimiter {
    cache: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    limits: RateLimits,
}

impl WindowRateLimiter {
    pub fn new(cache: Arc<dyn LockStore>, clock: Arc<dyn Clock>, limits: RateLimits) -> Self {
        Self {
            cache,
            clock,
            limits,
        }
    }

    /// 1 回分を消費する。上限を超えたら `RateLimited`（窓の残り時間付き）。
    pub async fn check(&self, scope: RateScope, key: &str) -> TicketResult<()> {
        let rule = self.limits.rule(scope);
        if !rule.enabled() {
            return Ok(());
        }
        let now = self.clock.now_millis();
        let window = now / rule.window_ms;
        let window_end = (window + 1) * rule.window_ms;
        let count = self
            .cache
            .incr(
                &keys::rate_limit(scope.as_str(), key, window),
                window_end - now,
            )
            .await?;
        if count > rule.limit {
            debug!(scope = scope.as_str(), key = %key, count, "rate limited");
            return Err(TicketError::RateLimited {
                retry_after_ms: window_end - now,
            });
        }
        Ok(())
    }
}
