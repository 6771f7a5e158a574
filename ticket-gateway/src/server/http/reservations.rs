//! 予約API:
//! - 役割: 数量指定の予約・参照・延長・番号指定での作り直し・解放、在庫数の参照。
//! - 予約はキャッシュ側のロックと DB 行の両方に載る。成功時のみ監査に残す。

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::error::{TicketError, TicketResult};
use crate::model::{CompetitionStatus, Reservation, StatusCounts};
use crate::rate_limit::RateScope;
use crate::store::TicketRepository;

use super::{user_id, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ReserveRequest {
    quantity: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RecreateRequest {
    ticket_numbers: Vec<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ReleaseResponse {
    released: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AvailabilityResponse {
    competition_id: String,
    status: CompetitionStatus,
    total_tickets: u32,
    max_tickets_per_user: u32,
    counts: StatusCounts,
}

fn audit_reserved(state: &AppState, reservation: &Reservation) {
    state.audit_log.record(
        AuditEvent::new(
            reservation.reserved_at,
            AuditAction::TicketsReserved {
                ticket_numbers: reservation.ticket_numbers.clone(),
                expires_at: reservation.expires_at,
            },
        )
        .competition(&reservation.competition_id)
        .user(&reservation.user_id),
    );
}

/// 予約作成（POST /competitions/{id}/reservations）
/// - 同じ利用者の既存予約は置き換える
pub(super) async fn handle_reserve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(competition_id): Path<String>,
    Json(req): Json<ReserveRequest>,
) -> TicketResult<(StatusCode, Json<Reservation>)> {
    let user = user_id(&headers)?;
    let started = Instant::now();
    let result = async {
        state.limiter.check(RateScope::Reserve, &user).await?;
        state
            .reservations
            .reserve(&competition_id, &user, req.quantity)
            .await
    }
    .await;

    match result {
        Ok(reservation) => {
            state.metrics.record_reserve(started);
            audit_reserved(&state, &reservation);
            Ok((StatusCode::CREATED, Json(reservation)))
        }
        Err(err) => {
            state.metrics.record_rejection(&err);
            Err(err)
        }
    }
}

/// 現在の予約（GET /competitions/{id}/reservations）
pub(super) async fn handle_get_reservation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(competition_id): Path<String>,
) -> TicketResult<Json<Reservation>> {
    let user = user_id(&headers)?;
    state
        .reservations
        .current(&competition_id, &user)
        .await?
        .map(Json)
        .ok_or(TicketError::NoActiveReservation)
}

/// 予約延長（POST /competitions/{id}/reservations/extend）
pub(super) async fn handle_extend(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(competition_id): Path<String>,
) -> TicketResult<Json<Reservation>> {
    let user = user_id(&headers)?;
    let reservation = state.reservations.extend(&competition_id, &user).await?;
    Ok(Json(reservation))
}

/// 番号指定での作り直し（POST /competitions/{id}/reservations/recreate）
/// - 期限切れ後にクライアントが覚えている番号で取り直す
pub(super) async fn handle_recreate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(competition_id): Path<String>,
    Json(req): Json<RecreateRequest>,
) -> TicketResult<Json<Reservation>> {
    let user = user_id(&headers)?;
    let started = Instant::now();
    match state
        .reservations
        .recreate(&competition_id, &user, &req.ticket_numbers)
        .await
    {
        Ok(reservation) => {
            state.metrics.record_reserve(started);
            audit_reserved(&state, &reservation);
            Ok(Json(reservation))
        }
        Err(err) => {
            state.metrics.record_rejection(&err);
            Err(err)
        }
    }
}

/// 予約解放（DELETE /competitions/{id}/reservations）
/// - ロックと予約エントリを消し、行も AVAILABLE に戻す
/// - 予約が無くても 200（released=false）
pub(super) async fn handle_release(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(competition_id): Path<String>,
) -> TicketResult<Json<ReleaseResponse>> {
    let user = user_id(&headers)?;
    let cancelled = state.reservations.cancel(&competition_id, &user).await?;
    let released = cancelled.is_some();
    if let Some(reservation) = cancelled {
        state.audit_log.record(
            AuditEvent::new(
                state.clock.now_millis(),
                AuditAction::ReservationReleased {
                    ticket_numbers: reservation.ticket_numbers,
                },
            )
            .competition(&competition_id)
            .user(&user),
        );
    }
    Ok(Json(ReleaseResponse { released }))
}

/// 在庫（GET /competitions/{id}/availability）
pub(super) async fn handle_availability(
    State(state): State<AppState>,
    Path(competition_id): Path<String>,
) -> TicketResult<Json<AvailabilityResponse>> {
    let competition = state.reservations.competition(&competition_id).await?;
    let counts = state.store.status_counts(&competition_id).await?;
    Ok(Json(AvailabilityResponse {
        competition_id: competition.id,
        status: competition.status,
        total_tickets: competition.total_tickets,
        max_tickets_per_user: competition.max_tickets_per_user,
        counts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::http::tests::{test_app, test_app_with, user_headers};
    use std::sync::atomic::Ordering;

    fn reserve(quantity: u32) -> Json<ReserveRequest> {
        Json(ReserveRequest { quantity })
    }

    #[tokio::test]
    async fn reserve_then_read_back() {
        let app = test_app(10, 5).await;
        let (status, Json(created)) = handle_reserve(
            State(app.state.clone()),
            user_headers("alice"),
            Path("c1".into()),
            reserve(3),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.ticket_numbers.len(), 3);

        let Json(current) = handle_get_reservation(
            State(app.state.clone()),
            user_headers("alice"),
            Path("c1".into()),
        )
        .await
        .unwrap();
        assert_eq!(current, created);

        let Json(availability) = handle_availability(State(app.state.clone()), Path("c1".into()))
            .await
            .unwrap();
        assert_eq!(availability.counts.reserved, 3);
        assert_eq!(availability.counts.total(), 10);
        assert_eq!(app.state.metrics.reservations_total.load(Ordering::Relaxed), 1);
        assert_eq!(app.state.audit_log.read_events(Some("c1"), None, 10).len(), 1);
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let app = test_app(10, 5).await;
        let err = handle_reserve(
            State(app.state),
            HeaderMap::new(),
            Path("c1".into()),
            reserve(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TicketError::Unauthorized));
    }

    #[tokio::test]
    async fn insufficient_inventory_is_counted() {
        let app = test_app(10, 5).await;
        handle_reserve(
            State(app.state.clone()),
            user_headers("alice"),
            Path("c1".into()),
            reserve(3),
        )
        .await
        .unwrap();
        let err = handle_reserve(
            State(app.state.clone()),
            user_headers("bob"),
            Path("c1".into()),
            reserve(8),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            TicketError::InsufficientInventory { available: 7, .. }
        ));
        assert_eq!(
            app.state
                .metrics
                .insufficient_inventory_total
                .load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn reserve_is_rate_limited_per_user() {
        let app = test_app_with(10, 5, &[("RATE_LIMIT_RESERVE", "2/60")]).await;
        for _ in 0..2 {
            handle_reserve(
                State(app.state.clone()),
                user_headers("alice"),
                Path("c1".into()),
                reserve(1),
            )
            .await
            .unwrap();
        }
        let err = handle_reserve(
            State(app.state.clone()),
            user_headers("alice"),
            Path("c1".into()),
            reserve(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TicketError::RateLimited { .. }));
        assert_eq!(app.state.metrics.rate_limited_total.load(Ordering::Relaxed), 1);

        // 他の利用者は別枠
        handle_reserve(
            State(app.state.clone()),
            user_headers("bob"),
            Path("c1".into()),
            reserve(1),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn release_returns_numbers_to_the_pool() {
        let app = test_app(3, 3).await;
        handle_reserve(
            State(app.state.clone()),
            user_headers("alice"),
            Path("c1".into()),
            reserve(3),
        )
        .await
        .unwrap();

        let Json(first) =
            handle_release(State(app.state.clone()), user_headers("alice"), Path("c1".into()))
                .await
                .unwrap();
        assert!(first.released);
        let Json(availability) = handle_availability(State(app.state.clone()), Path("c1".into()))
            .await
            .unwrap();
        assert_eq!(availability.counts.available, 3);
        assert_eq!(availability.counts.reserved, 0);
        assert_eq!(app.state.audit_log.read_events(Some("c1"), None, 10).len(), 2);

        // 2 回目は no-op
        let Json(second) =
            handle_release(State(app.state.clone()), user_headers("alice"), Path("c1".into()))
                .await
                .unwrap();
        assert!(!second.released);
        let err = handle_get_reservation(
            State(app.state.clone()),
            user_headers("alice"),
            Path("c1".into()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TicketError::NoActiveReservation));

        // 解放した番号は他の利用者がすぐ取れる
        let (_, Json(taken)) = handle_reserve(
            State(app.state.clone()),
            user_headers("bob"),
            Path("c1".into()),
            reserve(3),
        )
        .await
        .unwrap();
        assert_eq!(taken.ticket_numbers.len(), 3);
    }

    #[tokio::test]
    async fn recreate_after_expiry() {
        let app = test_app(10, 5).await;
        let (_, Json(created)) = handle_reserve(
            State(app.state.clone()),
            user_headers("alice"),
            Path("c1".into()),
            reserve(2),
        )
        .await
        .unwrap();
        app.clock.advance(app.state.reservations.ttl_ms() + 1);

        let err = handle_extend(State(app.state.clone()), user_headers("alice"), Path("c1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::NoActiveReservation));

        let Json(recreated) = handle_recreate(
            State(app.state.clone()),
            user_headers("alice"),
            Path("c1".into()),
            Json(RecreateRequest {
                ticket_numbers: created.ticket_numbers.clone(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(recreated.ticket_numbers, created.ticket_numbers);

        let Json(extended) =
            handle_extend(State(app.state.clone()), user_headers("alice"), Path("c1".into()))
                .await
                .unwrap();
        assert!(extended.expires_at >= recreated.expires_at);
    }
}
