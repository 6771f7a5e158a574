//! 運用API（Bearer ADMIN_TOKEN 必須）:
//! - 大会の登録、抽選/再抽選、郵送応募の付与、注文キャンセル、退会処理。
//! - 監査ログの参照と HMAC チェーン検証。

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use tracing::info;

use crate::audit::{AuditAction, AuditEvent, AuditSink, AuditVerifyResult};
use crate::checkout::{CloseOutcome, FreeEntryGrant};
use crate::draw::DrawOutcome;
use crate::error::{TicketError, TicketResult};
use crate::model::{Competition, NewCompetition};
use crate::rate_limit::RateScope;
use crate::store::TicketRepository;

use super::{optional_body, require_admin, AppState};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DrawRequest {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct FreeEntryRequest {
    user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DeleteUserResponse {
    user_id: String,
    affected: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AuditVerifyQuery {
    #[serde(default)]
    from_seq: Option<u64>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AuditEventsQuery {
    #[serde(default)]
    competition_id: Option<String>,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AuditEventsResponse {
    events: Vec<AuditEvent>,
}

/// 大会登録（POST /admin/competitions）
/// - 1..totalTickets の番号を AVAILABLE で作る
pub(super) async fn handle_provision(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<NewCompetition>,
) -> TicketResult<(StatusCode, Json<Competition>)> {
    require_admin(&state, &headers)?;
    if req.total_tickets == 0 || req.max_tickets_per_user == 0 {
        return Err(TicketError::BadRequest(
            "totalTickets and maxTicketsPerUser must be positive".into(),
        ));
    }
    if req.qcm_answer.trim().is_empty() {
        return Err(TicketError::BadRequest("qcmAnswer must not be empty".into()));
    }
    let id = req
        .id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("comp_{}", uuid::Uuid::new_v4().simple()));
    let competition = req.into_competition(id);
    state.store.provision(competition.clone()).await?;

    info!(competition_id = %competition.id, total_tickets = competition.total_tickets, "competition provisioned");
    state.audit_log.record(
        AuditEvent::new(
            state.clock.now_millis(),
            AuditAction::CompetitionProvisioned {
                total_tickets: competition.total_tickets,
            },
        )
        .competition(&competition.id),
    );
    Ok((StatusCode::CREATED, Json(competition)))
}

/// 抽選実行（POST /admin/competitions/{id}/draw）
/// - `{"force": true}` で抽選日前でも DRAWING に移して実行
pub(super) async fn handle_draw(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(competition_id): Path<String>,
    body: Bytes,
) -> TicketResult<Json<DrawOutcome>> {
    require_admin(&state, &headers)?;
    let req: DrawRequest = optional_body(&body)?;
    state.limiter.check(RateScope::Draw, &competition_id).await?;
    let outcome = state.draws.execute_draw(&competition_id, req.force).await?;
    state.metrics.draws_total.fetch_add(1, Ordering::Relaxed);
    Ok(Json(outcome))
}

/// 再抽選（POST /admin/competitions/{id}/redraw）
pub(super) async fn handle_redraw(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(competition_id): Path<String>,
) -> TicketResult<Json<DrawOutcome>> {
    require_admin(&state, &headers)?;
    state.limiter.check(RateScope::Draw, &competition_id).await?;
    let outcome = state.draws.redraw(&competition_id).await?;
    state.metrics.draws_total.fetch_add(1, Ordering::Relaxed);
    Ok(Json(outcome))
}

/// 郵送応募の付与（POST /admin/competitions/{id}/free-entries）
pub(super) async fn handle_free_entry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(competition_id): Path<String>,
    Json(req): Json<FreeEntryRequest>,
) -> TicketResult<(StatusCode, Json<FreeEntryGrant>)> {
    require_admin(&state, &headers)?;
    if req.user_id.trim().is_empty() {
        return Err(TicketError::BadRequest("userId must not be empty".into()));
    }
    let grant = state
        .checkout
        .grant_free_entry(&competition_id, req.user_id.trim())
        .await?;
    Ok((StatusCode::CREATED, Json(grant)))
}

/// 注文キャンセル（POST /admin/orders/{id}/cancel）
pub(super) async fn handle_cancel_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
) -> TicketResult<Json<CloseOutcome>> {
    require_admin(&state, &headers)?;
    let outcome = state.checkout.expire_or_cancel(&order_id).await?;
    Ok(Json(outcome))
}

/// 退会処理（DELETE /admin/users/{id}）
/// - 販売済みの行は OWNER_DELETED として残り、抽選対象から外れる
pub(super) async fn handle_delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> TicketResult<Json<DeleteUserResponse>> {
    require_admin(&state, &headers)?;
    let affected = state.store.mark_owner_deleted(&user_id).await? as u32;
    info!(user_id = %user_id, affected, "ticket owner deleted");
    state.audit_log.record(
        AuditEvent::new(state.clock.now_millis(), AuditAction::OwnerDeleted { affected })
            .user(&user_id),
    );
    Ok(Json(DeleteUserResponse { user_id, affected }))
}

/// 監査ログ検証（GET /admin/audit/verify）
/// - fromSeq/limit で部分検証、ハッシュチェーン不整合を検出
pub(super) async fn handle_audit_verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuditVerifyQuery>,
) -> TicketResult<Json<AuditVerifyResult>> {
    require_admin(&state, &headers)?;
    let from_seq = query.from_seq.unwrap_or(0);
    let limit = query.limit.unwrap_or(1000);
    Ok(Json(state.audit_log.verify(from_seq, limit)))
}

/// 監査イベント取得（GET /admin/audit/events）
pub(super) async fn handle_audit_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuditEventsQuery>,
) -> TicketResult<Json<AuditEventsResponse>> {
    require_admin(&state, &headers)?;
    let events = state.audit_log.read_events(
        query.competition_id.as_deref(),
        query.order_id.as_deref(),
        query.limit.unwrap_or(100),
    );
    Ok(Json(AuditEventsResponse { events }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompetitionStatus, TicketStatus};
    use crate::server::http::tests::{admin_headers, test_app, test_app_with, user_headers};

    fn new_competition(id: Option<&str>, total: u32) -> NewCompetition {
        NewCompetition {
            id: id.map(str::to_string),
            title: "Supercar".into(),
            total_tickets: total,
            max_tickets_per_user: 5,
            unit_price: 199,
            draw_at: None,
            bonus_tiers: Vec::new(),
            qcm_answer: "Paris".into(),
        }
    }

    fn force() -> Bytes {
        Bytes::from_static(br#"{"force":true}"#)
    }

    #[tokio::test]
    async fn provision_requires_admin() {
        let app = test_app(5, 5).await;
        let err = handle_provision(
            State(app.state.clone()),
            user_headers("alice"),
            Json(new_competition(Some("c2"), 10)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TicketError::Unauthorized));

        let (status, Json(created)) = handle_provision(
            State(app.state.clone()),
            admin_headers(),
            Json(new_competition(None, 10)),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert!(created.id.starts_with("comp_"));
        assert_eq!(created.status, CompetitionStatus::Active);
        assert_eq!(
            app.store.status_counts(&created.id).await.unwrap().available,
            10
        );

        let err = handle_provision(
            State(app.state.clone()),
            admin_headers(),
            Json(new_competition(Some("c3"), 0)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TicketError::BadRequest(_)));
    }

    #[tokio::test]
    async fn draw_then_redraw_through_admin_api() {
        let app = test_app_with(5, 5, &[("RATE_LIMIT_DRAW", "off")]).await;
        for (user, n) in [("alice", 1u32), ("bob", 2)] {
            app.store.reserve_tickets("c1", user, &[n], u64::MAX, 0).await.unwrap();
            app.store
                .sell_reserved("c1", user, &format!("ord_{user}"), &[n])
                .await
                .unwrap();
        }

        let err = handle_draw(
            State(app.state.clone()),
            admin_headers(),
            Path("c1".into()),
            Bytes::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TicketError::NotEligibleForDraw(_)));

        let Json(first) = handle_draw(
            State(app.state.clone()),
            admin_headers(),
            Path("c1".into()),
            force(),
        )
        .await
        .unwrap();
        assert_eq!(first.eligible_count, 2);

        let err = handle_draw(
            State(app.state.clone()),
            admin_headers(),
            Path("c1".into()),
            force(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TicketError::DrawAlreadyExecuted));

        let Json(second) =
            handle_redraw(State(app.state.clone()), admin_headers(), Path("c1".into()))
                .await
                .unwrap();
        assert_ne!(second.ticket_number, first.ticket_number);
        assert_eq!(app.state.metrics.draws_total.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn draw_is_rate_limited() {
        let app = test_app_with(5, 5, &[("RATE_LIMIT_DRAW", "1/300")]).await;
        let _ = handle_draw(
            State(app.state.clone()),
            admin_headers(),
            Path("c1".into()),
            Bytes::new(),
        )
        .await;
        let err = handle_draw(
            State(app.state.clone()),
            admin_headers(),
            Path("c1".into()),
            Bytes::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TicketError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn free_entry_and_owner_deletion() {
        let app = test_app(5, 5).await;
        let (_, Json(grant)) = handle_free_entry(
            State(app.state.clone()),
            admin_headers(),
            Path("c1".into()),
            Json(FreeEntryRequest {
                user_id: "postal-1".into(),
            }),
        )
        .await
        .unwrap();
        let tickets = app.store.tickets("c1");
        let row = &tickets[grant.ticket_number as usize - 1];
        assert_eq!(row.status, TicketStatus::FreeEntry);

        let Json(deleted) = handle_delete_user(
            State(app.state.clone()),
            admin_headers(),
            Path("postal-1".into()),
        )
        .await
        .unwrap();
        assert_eq!(deleted.affected, 1);
        assert!(app.store.eligible_tickets("c1").await.unwrap().is_empty());

        let Json(events) = handle_audit_events(
            State(app.state.clone()),
            admin_headers(),
            Query(AuditEventsQuery {
                competition_id: Some("c1".into()),
                order_id: None,
                limit: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(events.events.len(), 1);
        assert_eq!(events.events[0].action.kind(), "FREE_ENTRY_GRANTED");
    }

    #[tokio::test]
    async fn cancel_unknown_order_is_not_found() {
        let app = test_app(5, 5).await;
        let err = handle_cancel_order(
            State(app.state.clone()),
            admin_headers(),
            Path("ord_missing".into()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TicketError::OrderNotFound(_)));
    }

    #[tokio::test]
    async fn verify_without_chain_reports_not_configured() {
        let app = test_app(5, 5).await;
        let Json(result) = handle_audit_verify(
            State(app.state.clone()),
            admin_headers(),
            Query(AuditVerifyQuery {
                from_seq: None,
                limit: None,
            }),
        )
        .await
        .unwrap();
        assert!(!result.ok);
    }
}
