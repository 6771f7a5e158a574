//! Ticket Gateway - 懸賞大会のチケット予約・購入確定・抽選サービス
//!
//! ## 起動方法
//! ```bash
//! TICKET_PORT=8081 ADMIN_TOKEN=... cargo run --release -p ticket-gateway
//! # Redis / Postgres を使う場合
//! CACHE_URL=redis://127.0.0.1/ DATABASE_URL=postgres://... \
//!   cargo run --release -p ticket-gateway --features redis,postgres
//! ```
//!
//! ## 全体フロー（超要約）
//! 1) 予約: キャッシュのチケットロック → DB 行を RESERVED（TTL 付き）
//! 2) QCM: スキル問題の合格をキャッシュに記録（誤答が続くとロック）
//! 3) チェックアウト: 予約を延長して注文(PENDING)を作り、外部決済ページへ
//! 4) 決済通知: 注文を SUCCEEDED にしてから行を SOLD、ボーナス付与
//! 5) 抽選: SOLD / FREE_ENTRY から CSPRNG で 1 枚、1 トランザクションで記録
//!
//! ## 環境変数
//! - `TICKET_PORT`: HTTPサーバーのポート（デフォルト: 8081）
//! - `RUST_LOG`: ログレベル（デフォルト: info）
//! - その他は config.rs を参照

mod audit;
mod cache;
mod checkout;
mod config;
mod draw;
mod error;
mod model;
mod notify;
mod payment;
mod qcm;
mod rate_limit;
mod reservation;
mod server;
mod store;

use std::sync::Arc;
use ticket_core::{Clock, SystemClock};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::audit::{AuditLog, HashChainConfig};
use crate::cache::{LockStore, MemoryLockStore};
use crate::config::Config;
use crate::payment::{HttpPaymentProvider, LocalPaymentProvider, PaymentProvider};
use crate::server::http::AppState;
use crate::store::{MemoryTicketStore, TicketRepository};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1) プロセス初期化（ログ + 設定）
    init_tracing();
    let config = Config::from_env();
    info!("Ticket gateway starting with config: {:?}", config);

    // 2) 依存の初期化（Cache / Store / Audit / Payment）
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = init_cache(&config, clock.clone()).await?;
    let store = init_store(&config).await?;
    let audit_log = init_audit(&config)?;
    let payments = init_payments(&config)?;
    let notifier = Arc::new(notify::LogNotifier);

    // 3) サーバー起動
    let port = config.port;
    let state = AppState::build(config, store, cache, audit_log, payments, notifier, clock);
    if let Err(e) = server::http::run(port, state).await {
        tracing::error!(error = %e, "HTTP server exited with error");
        return Err(e);
    }
    Ok(())
}

/// ログ出力基盤を初期化する。
/// `RUST_LOG` が無い場合は `info,ticket_gateway=debug` を既定値に使う。
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ticket_gateway=debug".into()),
        )
        .init();
}

/// CACHE_URL があれば Redis、無ければプロセス内のロックストア
async fn init_cache(config: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<Arc<dyn LockStore>> {
    match config.cache_url.as_deref() {
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = cache::redis::RedisLockStore::connect(url).await?;
            info!("RedisLockStore connected");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("CACHE_URL is set but the redis feature is disabled, using in-memory locks");
            Ok(Arc::new(MemoryLockStore::new(clock)))
        }
        None => {
            info!("MemoryLockStore initialized (single instance only)");
            Ok(Arc::new(MemoryLockStore::new(clock)))
        }
    }
}

/// DATABASE_URL があれば Postgres、無ければインメモリ
async fn init_store(config: &Config) -> anyhow::Result<Arc<dyn TicketRepository>> {
    match config.database_url.as_deref() {
        #[cfg(feature = "postgres")]
        Some(url) => {
            let store =
                store::postgres::PgTicketStore::connect(url, config.database_max_connections)
                    .await?;
            info!("PgTicketStore connected");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            warn!("DATABASE_URL is set but the postgres feature is disabled, using in-memory store");
            Ok(Arc::new(MemoryTicketStore::new()))
        }
        None => {
            warn!("MemoryTicketStore initialized, data is lost on restart");
            Ok(Arc::new(MemoryTicketStore::new()))
        }
    }
}

/// 監査ログを開く。AUDIT_HMAC_KEY があればハッシュチェーンも有効にする。
fn init_audit(config: &Config) -> anyhow::Result<Arc<AuditLog>> {
    let chain = config.audit_hmac_key.as_ref().map(|key| HashChainConfig {
        key: key.expose().as_bytes().to_vec(),
        key_id: config.audit_key_id.clone(),
        hash_path: None,
    });
    if chain.is_none() {
        warn!("AUDIT_HMAC_KEY not set, audit hash chain disabled");
    }
    let audit_log = Arc::new(AuditLog::new(&config.audit_log_path, chain)?);
    info!(path = %audit_log.path().display(), "AuditLog initialized");
    Ok(audit_log)
}

/// PAYMENT_API_URL + PAYMENT_API_KEY があれば外部決済、無ければローカル URL を返す開発用
fn init_payments(config: &Config) -> anyhow::Result<Arc<dyn PaymentProvider>> {
    match (&config.payment_api_url, &config.payment_api_key) {
        (Some(url), Some(key)) => {
            info!(api_url = %url, "HttpPaymentProvider initialized");
            Ok(Arc::new(HttpPaymentProvider::new(url, key.expose())?))
        }
        _ => {
            warn!("payment provider not configured, using local redirect URLs");
            Ok(Arc::new(LocalPaymentProvider::new(&config.payment_return_url)))
        }
    }
}
