//! QCM（スキル問題）API:
//! - 状態確認はブロック状況と合格済みかを返す。
//! - 回答は利用者 ID（無ければ IP）単位で数え、正解判定は大会の設定値と比較する。

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use ticket_core::AttemptOutcome;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::error::{TicketError, TicketResult};
use crate::qcm::{answer_matches, QcmIdentity};

use super::{client_ip, optional_user_id, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AnswerRequest {
    pub(super) answer: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct QcmStatusResponse {
    passed: bool,
    blocked: bool,
    remaining_ms: u64,
    max_attempts: u32,
}

fn identity(headers: &HeaderMap) -> TicketResult<(Option<String>, Option<String>, QcmIdentity)> {
    let user = optional_user_id(headers);
    let ip = client_ip(headers);
    let identity = QcmIdentity::resolve(user.as_deref(), ip.as_deref())
        .ok_or_else(|| TicketError::BadRequest("neither user id nor client ip present".into()))?;
    Ok((user, ip, identity))
}

/// QCM 状態（GET /competitions/{id}/qcm）
pub(super) async fn handle_qcm_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(competition_id): Path<String>,
) -> TicketResult<Json<QcmStatusResponse>> {
    let (user, ip, identity) = identity(&headers)?;
    let blocked = state.qcm.check_blocked(&competition_id, &identity).await?;
    let passed = state
        .qcm
        .has_passed_for(&competition_id, user.as_deref(), ip.as_deref())
        .await?;
    Ok(Json(QcmStatusResponse {
        passed,
        blocked: blocked.blocked,
        remaining_ms: blocked.remaining_ms,
        max_attempts: state.qcm.policy().max_attempts,
    }))
}

/// QCM 回答（POST /competitions/{id}/qcm）
/// - ブロック中は 429（残り時間付き）
pub(super) async fn handle_qcm_answer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(competition_id): Path<String>,
    Json(req): Json<AnswerRequest>,
) -> TicketResult<Json<AttemptOutcome>> {
    let (user, _, identity) = identity(&headers)?;
    let competition = state.reservations.competition(&competition_id).await?;
    let correct = answer_matches(&competition.qcm_answer, &req.answer);
    let outcome = state
        .qcm
        .record_attempt(&competition_id, &identity, correct)
        .await?;

    let action = match outcome {
        AttemptOutcome::Passed => Some(AuditAction::QcmPassed {
            identifier: identity.key(),
        }),
        AttemptOutcome::Blocked { blocked_until } => {
            state.metrics.qcm_blocks_total.fetch_add(1, Ordering::Relaxed);
            Some(AuditAction::QcmBlocked {
                identifier: identity.key(),
                blocked_until,
            })
        }
        AttemptOutcome::Incorrect { .. } => None,
    };
    if let Some(action) = action {
        let mut event = AuditEvent::new(state.clock.now_millis(), action).competition(&competition_id);
        if let Some(user) = user.as_deref() {
            event = event.user(user);
        }
        state.audit_log.record(event);
    }
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::http::tests::{test_app, user_headers};
    use axum::http::HeaderValue;

    fn answer(text: &str) -> Json<AnswerRequest> {
        Json(AnswerRequest {
            answer: text.to_string(),
        })
    }

    #[tokio::test]
    async fn wrong_answers_block_then_reject() {
        let app = test_app(10, 5).await;
        let max = app.state.qcm.policy().max_attempts;
        for i in 1..max {
            let Json(outcome) = handle_qcm_answer(
                State(app.state.clone()),
                user_headers("alice"),
                Path("c1".into()),
                answer("London"),
            )
            .await
            .unwrap();
            assert_eq!(
                outcome,
                AttemptOutcome::Incorrect {
                    attempts_remaining: max - i
                }
            );
        }
        let Json(outcome) = handle_qcm_answer(
            State(app.state.clone()),
            user_headers("alice"),
            Path("c1".into()),
            answer("London"),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, AttemptOutcome::Blocked { .. }));

        // 正解でもブロック中は受け付けない
        let err = handle_qcm_answer(
            State(app.state.clone()),
            user_headers("alice"),
            Path("c1".into()),
            answer("Paris"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TicketError::Blocked { .. }));

        let Json(status) =
            handle_qcm_status(State(app.state.clone()), user_headers("alice"), Path("c1".into()))
                .await
                .unwrap();
        assert!(status.blocked);
        assert!(!status.passed);
        assert_eq!(app.state.metrics.qcm_blocks_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn anonymous_pass_transfers_to_user() {
        let app = test_app(10, 5).await;
        let mut anonymous = HeaderMap::new();
        anonymous.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));

        let Json(outcome) = handle_qcm_answer(
            State(app.state.clone()),
            anonymous,
            Path("c1".into()),
            answer("  paris "),
        )
        .await
        .unwrap();
        assert_eq!(outcome, AttemptOutcome::Passed);

        // 同じ IP からログインした利用者に引き継がれる
        let Json(status) =
            handle_qcm_status(State(app.state.clone()), user_headers("alice"), Path("c1".into()))
                .await
                .unwrap();
        assert!(status.passed);

        let events = app.state.audit_log.read_events(Some("c1"), None, 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action.kind(), "QCM_PASSED");
    }

    #[tokio::test]
    async fn no_identity_is_bad_request() {
        let app = test_app(10, 5).await;
        let err = handle_qcm_status(State(app.state), HeaderMap::new(), Path("c1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::BadRequest(_)));
    }
}
