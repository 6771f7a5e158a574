//! 設定管理
//!
//! 環境変数から設定を読み込む。すべての値にデフォルトがある。

use std::env;
use std::fmt;
use std::path::PathBuf;

use ticket_core::QcmPolicy;

use crate::rate_limit::{RateLimitRule, RateLimits};

/// ログに出したくない値（Debug で伏せる）
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Gateway設定
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTPサーバーポート
    pub port: u16,
    /// 予約・チケットロックの TTL
    pub reservation_ttl_ms: u64,
    pub qcm_policy: QcmPolicy,
    /// 合格フラグの有効期間
    pub qcm_pass_ttl_ms: u64,
    pub currency: String,
    /// 未設定ならインメモリのロックストア
    pub cache_url: Option<String>,
    /// 未設定ならインメモリのチケットストア
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub audit_log_path: PathBuf,
    /// 設定時のみハッシュチェーンを有効にする
    pub audit_hmac_key: Option<Secret>,
    pub audit_key_id: String,
    pub payment_api_url: Option<String>,
    pub payment_api_key: Option<Secret>,
    pub payment_return_url: String,
    pub payment_webhook_secret: Option<Secret>,
    pub admin_token: Option<Secret>,
    pub rate_limits: RateLimits,
}

impl Config {
    /// 環境変数から設定を読み込む
    ///
    /// - TICKET_PORT (デフォルト: 8081)
    /// - RESERVATION_TTL_SEC (デフォルト: 600)
    /// - QCM_MAX_ATTEMPTS / QCM_LOCKOUT_SEC / QCM_ATTEMPT_WINDOW_SEC (5 / 900 / 900)
    /// - RATE_LIMIT_RESERVE / RATE_LIMIT_CHECKOUT / RATE_LIMIT_DRAW ("回数/秒")
    pub fn from_env() -> Self {
        // .envファイルがあれば読み込む（無くてもエラーにしない）
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secret = |key: &str| text(key).map(Secret);
        let rule = |key: &str, default: RateLimitRule| {
            lookup(key)
                .and_then(|v| RateLimitRule::parse(&v))
                .unwrap_or(default)
        };

        let qcm_default = QcmPolicy::default();
        let limits_default = RateLimits::default();

        Self {
            port: lookup("TICKET_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8081),
            reservation_ttl_ms: parsed("RESERVATION_TTL_SEC").unwrap_or(600) * 1000,
            qcm_policy: QcmPolicy::new(
                parsed("QCM_MAX_ATTEMPTS")
                    .map(|v| v as u32)
                    .unwrap_or(qcm_default.max_attempts),
                parsed("QCM_LOCKOUT_SEC")
                    .map(|v| v * 1000)
                    .unwrap_or(qcm_default.lockout_ms),
                parsed("QCM_ATTEMPT_WINDOW_SEC")
                    .map(|v| v * 1000)
                    .unwrap_or(qcm_default.attempt_window_ms),
            ),
            qcm_pass_ttl_ms: parsed("QCM_PASS_TTL_SEC").unwrap_or(2_592_000) * 1000,
            currency: text("CURRENCY").unwrap_or_else(|| "GBP".to_string()),
            cache_url: text("CACHE_URL"),
            database_url: text("DATABASE_URL"),
            database_max_connections: parsed("DATABASE_MAX_CONNECTIONS")
                .map(|v| v as u32)
                .unwrap_or(10),
            audit_log_path: text("AUDIT_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("var/tickets/audit.log")),
            audit_hmac_key: secret("AUDIT_HMAC_KEY"),
            audit_key_id: text("AUDIT_KEY_ID").unwrap_or_else(|| "key-1".to_string()),
            payment_api_url: text("PAYMENT_API_URL"),
            payment_api_key: secret("PAYMENT_API_KEY"),
            payment_return_url: text("PAYMENT_RETURN_URL")
                .unwrap_or_else(|| "http://localhost:3000/checkout/complete".to_string()),
            payment_webhook_secret: secret("PAYMENT_WEBHOOK_SECRET"),
            admin_token: secret("ADMIN_TOKEN"),
            rate_limits: RateLimits {
                reserve: rule("RATE_LIMIT_RESERVE", limits_default.reserve),
                checkout: rule("RATE_LIMIT_CHECKOUT", limits_default.checkout),
                draw: rule("RATE_LIMIT_DRAW", limits_default.draw),
            },
        }
    }
}
