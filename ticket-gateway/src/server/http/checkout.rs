//! チェックアウト/決済通知API:
//! - /competitions/{id}/checkout: 予約を延長（期限切れなら番号指定で作り直し）して決済セッションを開く。
//! - /payments/notifications: 決済プロバイダからの結果通知。本文の HMAC 署名を検証してから
//!   コミット / 失敗 / 期限切れに振り分ける。重複通知は 200 で「処理済み」を返す。

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, warn};

use crate::checkout::{CheckoutSession, CloseOutcome, CommitOutcome};
use crate::error::{TicketError, TicketResult};
use crate::payment::{verify_signature, NotificationStatus, PaymentNotification};
use crate::rate_limit::RateScope;

use super::{client_ip, user_id, AppState};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CheckoutRequest {
    /// 予約が切れていた場合に取り直す番号
    #[serde(default)]
    ticket_numbers: Option<Vec<u32>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(super) enum NotificationResponse {
    Commit(CommitOutcome),
    Close(CloseOutcome),
}

/// 決済セッション開始（POST /competitions/{id}/checkout）
pub(super) async fn handle_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(competition_id): Path<String>,
    body: Bytes,
) -> TicketResult<(StatusCode, Json<CheckoutSession>)> {
    let user = user_id(&headers)?;
    let ip = client_ip(&headers);
    let req: CheckoutRequest = super::optional_body(&body)?;

    if let Err(err) = state.limiter.check(RateScope::Checkout, &user).await {
        state.metrics.record_rejection(&err);
        return Err(err);
    }
    let session = state
        .checkout
        .create_payment_session(
            &competition_id,
            &user,
            ip.as_deref(),
            req.ticket_numbers.as_deref(),
        )
        .await?;
    state
        .metrics
        .checkout_sessions_total
        .fetch_add(1, Ordering::Relaxed);
    Ok((StatusCode::CREATED, Json(session)))
}

/// 決済結果通知（POST /payments/notifications）
/// - X-Signature: base64(HMAC-SHA256(secret, body))
pub(super) async fn handle_payment_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> TicketResult<Json<NotificationResponse>> {
    match state.config.payment_webhook_secret.as_ref() {
        Some(secret) => {
            let signature = headers
                .get("x-signature")
                .and_then(|v| v.to_str().ok())
                .ok_or(TicketError::InvalidSignature)?;
            if !verify_signature(secret.expose().as_bytes(), &body, signature) {
                warn!("payment notification with bad signature rejected");
                return Err(TicketError::InvalidSignature);
            }
        }
        None => warn!("PAYMENT_WEBHOOK_SECRET not set, accepting unsigned notification"),
    }

    let notification: PaymentNotification = serde_json::from_slice(&body)
        .map_err(|e| TicketError::BadRequest(format!("notification body: {e}")))?;
    debug!(order_id = %notification.order_id, status = ?notification.status, "payment notification");

    let response = match notification.status {
        NotificationStatus::Succeeded => {
            let started = Instant::now();
            let outcome = state.checkout.commit(&notification.order_id).await?;
            state.metrics.commit_latency.record_since(started);
            match &outcome {
                CommitOutcome::Committed(summary) => {
                    state.metrics.commits_total.fetch_add(1, Ordering::Relaxed);
                    if !summary.missing.is_empty() {
                        state
                            .metrics
                            .commit_discrepancies_total
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
                CommitOutcome::AlreadyProcessed { .. } => {
                    state
                        .metrics
                        .commit_duplicates_total
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            NotificationResponse::Commit(outcome)
        }
        NotificationStatus::Failed => NotificationResponse::Close(
            state
                .checkout
                .record_payment_failure(&notification.order_id)
                .await?,
        ),
        NotificationStatus::Expired => NotificationResponse::Close(
            state.checkout.expire_or_cancel(&notification.order_id).await?,
        ),
    };
    Ok(Json(response))
}
