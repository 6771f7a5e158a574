//! HTTP サーバー
//!
//! 位置づけ:
//! - このモジュールは「HTTP入口層」。認証済みヘッダの解釈・レート制限・監査記録を担い、
//!   在庫/決済/抽選の判断はエンジン側に任せる。
//!
//! ハンドラの分類:
//! - 購入者向け（予約 / QCM / チェックアウト）:
//!   - /competitions/{id}/reservations: 予約の作成・参照・延長・作り直し・解放。
//!   - /competitions/{id}/qcm: スキル問題の状態確認と回答。
//!   - /competitions/{id}/checkout: 決済セッションの開始。
//! - 決済プロバイダ向け:
//!   - /payments/notifications: 署名付きの決済結果通知。
//! - 運用向け（Bearer ADMIN_TOKEN）:
//!   - /admin/competitions, draw, redraw, free-entries, 注文キャンセル, 退会処理, 監査検証。
//!   - /health, /metrics。
//!
//! 利用者の識別は前段の認証層が付ける `X-User-Id` を信頼する。

mod admin;
mod checkout;
mod metrics;
mod qcm;
mod reservations;

use axum::{
    http::{header::AUTHORIZATION, HeaderMap},
    routing::{delete, get, post},
    Router,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use ticket_core::Clock;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::audit::AuditLog;
use crate::cache::LockStore;
use crate::checkout::CheckoutCoordinator;
use crate::config::Config;
use crate::draw::DrawEngine;
use crate::error::{TicketError, TicketResult};
use crate::notify::Notifier;
use crate::payment::PaymentProvider;
use crate::qcm::QcmGate;
use crate::rate_limit::WindowRateLimiter;
use crate::reservation::ReservationEngine;
use crate::store::TicketRepository;

pub use metrics::ServiceMetrics;

use admin::{
    handle_audit_events, handle_audit_verify, handle_cancel_order, handle_delete_user,
    handle_draw, handle_free_entry, handle_provision, handle_redraw,
};
use checkout::{handle_checkout, handle_payment_notification};
use metrics::{handle_health, handle_metrics};
use qcm::{handle_qcm_answer, handle_qcm_status};
use reservations::{
    handle_availability, handle_extend, handle_get_reservation, handle_recreate,
    handle_release, handle_reserve,
};

/// ハンドラ間で共有する状態（Clone は Arc のコピーのみ）
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn TicketRepository>,
    pub reservations: Arc<ReservationEngine>,
    pub qcm: Arc<QcmGate>,
    pub checkout: Arc<CheckoutCoordinator>,
    pub draws: Arc<DrawEngine>,
    pub limiter: Arc<WindowRateLimiter>,
    pub audit_log: Arc<AuditLog>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<ServiceMetrics>,
}

impl AppState {
    /// ストア・キャッシュ・外部協力者からエンジン一式を組み立てる
    pub fn build(
        config: Config,
        store: Arc<dyn TicketRepository>,
        cache: Arc<dyn LockStore>,
        audit_log: Arc<AuditLog>,
        payments: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let reservations = Arc::new(ReservationEngine::new(
            cache.clone(),
            store.clone(),
            clock.clone(),
            config.reservation_ttl_ms,
        ));
        let qcm = Arc::new(QcmGate::new(
            cache.clone(),
            clock.clone(),
            config.qcm_policy,
            config.qcm_pass_ttl_ms,
        ));
        let checkout = Arc::new(CheckoutCoordinator::new(
            store.clone(),
            reservations.clone(),
            qcm.clone(),
            payments,
            notifier.clone(),
            audit_log.clone(),
            clock.clone(),
            &config.currency,
            &config.payment_return_url,
        ));
        let draws = Arc::new(DrawEngine::new(
            store.clone(),
            audit_log.clone(),
            notifier,
            clock.clone(),
        ));
        let limiter = Arc::new(WindowRateLimiter::new(
            cache,
            clock.clone(),
            config.rate_limits,
        ));
        Self {
            config: Arc::new(config),
            store,
            reservations,
            qcm,
            checkout,
            draws,
            limiter,
            audit_log,
            clock,
            metrics: Arc::new(ServiceMetrics::new()),
        }
    }
}

/// 前段の認証層が付けた利用者 ID
pub(super) fn user_id(headers: &HeaderMap) -> TicketResult<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(TicketError::Unauthorized)
}

pub(super) fn optional_user_id(headers: &HeaderMap) -> Option<String> {
    user_id(headers).ok()
}

/// X-Forwarded-For の先頭（クライアント側）
pub(super) fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// 運用 API の認可。ADMIN_TOKEN 未設定なら全て拒否する。
pub(super) fn require_admin(state: &AppState, headers: &HeaderMap) -> TicketResult<()> {
    let Some(expected) = state.config.admin_token.as_ref() else {
        return Err(TicketError::Unauthorized);
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(token) if constant_time_eq(token.as_bytes(), expected.expose().as_bytes()) => Ok(()),
        _ => Err(TicketError::Unauthorized),
    }
}

/// 空の本文はデフォルト値として扱う
pub(super) fn optional_body<T: DeserializeOwned + Default>(body: &[u8]) -> TicketResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| TicketError::BadRequest(format!("request body: {e}")))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/competitions/{competition_id}/reservations",
            post(handle_reserve)
                .get(handle_get_reservation)
                .delete(handle_release),
        )
        .route(
            "/competitions/{competition_id}/reservations/extend",
            post(handle_extend),
        )
        .route(
            "/competitions/{competition_id}/reservations/recreate",
            post(handle_recreate),
        )
        .route(
            "/competitions/{competition_id}/availability",
            get(handle_availability),
        )
        .route(
            "/competitions/{competition_id}/qcm",
            get(handle_qcm_status).post(handle_qcm_answer),
        )
        .route(
            "/competitions/{competition_id}/checkout",
            post(handle_checkout),
        )
        .route("/payments/notifications", post(handle_payment_notification))
        .route("/admin/competitions", post(handle_provision))
        .route(
            "/admin/competitions/{competition_id}/draw",
            post(handle_draw),
        )
        .route(
            "/admin/competitions/{competition_id}/redraw",
            post(handle_redraw),
        )
        .route(
            "/admin/competitions/{competition_id}/free-entries",
            post(handle_free_entry),
        )
        .route("/admin/orders/{order_id}/cancel", post(handle_cancel_order))
        .route("/admin/users/{user_id}", delete(handle_delete_user))
        .route("/admin/audit/verify", get(handle_audit_verify))
        .route("/admin/audit/events", get(handle_audit_events))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP サーバーを起動する（Ctrl+C / SIGTERM で停止）
pub async fn run(port: u16, state: AppState) -> anyhow::Result<()> {
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
