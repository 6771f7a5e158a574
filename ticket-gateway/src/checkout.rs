//! チェックアウトとコミット
//!
//! - `create_payment_session`: 予約を延長（または作り直し）して PENDING の注文を作り、決済セッションを開く
//! - `commit`: 決済成功通知。重複配信されるので冪等。注文の条件付き遷移が唯一の線形化点
//! - `expire_or_cancel` / `record_payment_failure`: 注文を閉じて予約を戻す
//!
//! コミット時に RESERVED のまま残っていなかった番号は、記録だけして処理は続ける。
//! 代金は既に受け取っているので、更新できた分は必ず顧客に渡す。

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use ticket_core::{bonus_tickets, Clock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::error::{TicketError, TicketResult};
use crate::model::{CompetitionStatus, Order, PaymentStatus};
use crate::notify::Notifier;
use crate::payment::{PaymentProvider, PaymentSession, PaymentSessionRequest};
use crate::qcm::QcmGate;
use crate::reservation::ReservationEngine;
use crate::store::TicketRepository;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub order: Order,
    pub session: PaymentSession,
    /// 予約の期限（決済ページの制限時間）
    pub expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    pub order_id: String,
    pub sold: Vec<u32>,
    pub bonus: Vec<u32>,
    /// 注文にあったが SOLD にできなかった番号
    pub missing: Vec<u32>,
    pub sold_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitOutcome {
    Committed(CommitSummary),
    #[serde(rename_all = "camelCase")]
    AlreadyProcessed { order_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseOutcome {
    pub order_id: String,
    pub status: PaymentStatus,
    /// AVAILABLE に戻した行数
    pub released: u32,
    /// 既に同じ状態で閉じられていた
    pub already_closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeEntryGrant {
    pub ticket_number: u32,
    pub sold_out: bool,
}

pub struct CheckoutCoordinator {
    store: Arc<dyn TicketRepository>,
    reservations: Arc<ReservationEngine>,
    qcm: Arc<QcmGate>,
    payments: Arc<dyn PaymentProvider>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    currency: String,
    return_url: String,
}

impl CheckoutCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TicketRepository>,
        reservations: Arc<ReservationEngine>,
        qcm: Arc<QcmGate>,
        payments: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        currency: &str,
        return_url: &str,
    ) -> Self {
        Self {
            store,
            reservations,
            qcm,
            payments,
            notifier,
            audit,
            clock,
            currency: currency.to_string(),
            return_url: return_url.to_string(),
        }
    }

    pub async fn create_payment_session(
        &self,
        competition_id: &str,
        user_id: &str,
        ip: Option<&str>,
        selection: Option<&[u32]>,
    ) -> TicketResult<CheckoutSession> {
        let competition = self.reservations.competition(competition_id).await?;
        if competition.status != CompetitionStatus::Active {
            return Err(TicketError::CompetitionNotActive {
                id: competition.id,
                status: competition.status,
            });
        }
        if !self
            .qcm
            .has_passed_for(competition_id, Some(user_id), ip)
            .await?
        {
            return Err(TicketError::QcmNotPassed);
        }

        let reservation = match self.reservations.extend(competition_id, user_id).await {
            Ok(r) => r,
            Err(TicketError::NoActiveReservation) => match selection {
                Some(numbers) if !numbers.is_empty() => {
                    self.reservations
                        .recreate(competition_id, user_id, numbers)
                        .await?
                }
                _ => return Err(TicketError::NoActiveReservation),
            },
            Err(err) => return Err(err),
        };

        let quantity = reservation.ticket_numbers.len() as u32;
        let total_amount = competition.unit_price.saturating_mul(quantity as u64);
        let bonus = bonus_tickets(quantity, &competition.bonus_tiers);
        let now = self.clock.now_millis();
        let order = Order {
            order_id: format!("ord_{}", Uuid::new_v4().simple()),
            user_id: user_id.to_string(),
            competition_id: competition_id.to_string(),
            ticket_numbers: reservation.ticket_numbers.clone(),
            ticket_count: quantity,
            bonus_ticket_count: bonus,
            total_amount,
            currency: self.currency.clone(),
            payment_status: PaymentStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.store.create_order(order.clone()).await?;
        self.audit.record(
            AuditEvent::new(
                now,
                AuditAction::OrderCreated {
                    ticket_numbers: order.ticket_numbers.clone(),
                    total_amount,
                    currency: order.currency.clone(),
                    bonus_ticket_count: bonus,
                },
            )
            .competition(competition_id)
            .user(user_id)
            .order(&order.order_id),
        );

        let request = PaymentSessionRequest {
            order_id: order.order_id.clone(),
            competition_id: competition_id.to_string(),
            user_id: user_id.to_string(),
            amount: total_amount,
            currency: order.currency.clone(),
            description: format!("{} x {}", quantity, competition.title),
            quantity,
            return_url: self.return_url.clone(),
        };
        match self.payments.open_session(&request).await {
            Ok(session) => {
                info!(
                    order_id = %order.order_id,
                    competition_id = %competition_id,
                    amount = total_amount,
                    bonus,
                    "payment session opened"
                );
                Ok(CheckoutSession {
                    order,
                    session,
                    expires_at: reservation.expires_at,
                })
            }
            Err(err) => {
                error!(order_id = %order.order_id, error = %err, "payment session failed, cancelling order");
                if let Err(close_err) = self.close(&order.order_id, PaymentStatus::Cancelled).await {
                    warn!(order_id = %order.order_id, error = %close_err, "order rollback failed");
                }
                Err(err)
            }
        }
    }

    /// 決済成功。何度呼ばれても結果は 1 回分。
    pub async fn commit(&self, order_id: &str) -> TicketResult<CommitOutcome> {
        let order = self.load_order(order_id).await?;
        let already = || CommitOutcome::AlreadyProcessed {
            order_id: order_id.to_string(),
        };
        let from = match order.payment_status {
            PaymentStatus::Succeeded => return Ok(already()),
            // 期限切れ後に届いた成功通知も受け入れる（残っている予約だけ売る）
            status @ (PaymentStatus::Pending | PaymentStatus::Failed | PaymentStatus::Cancelled) => {
                status
            }
            status @ PaymentStatus::Refunded => {
                return Err(TicketError::OrderTerminal {
                    order_id: order_id.to_string(),
                    status,
                })
            }
        };

        let now = self.clock.now_millis();
        let moved = self
            .store
            .transition_order(order_id, from, PaymentStatus::Succeeded, now)
            .await?;
        if moved == 0 {
            // 並行配信に負けた
            let current = self.load_order(order_id).await?;
            if current.payment_status == PaymentStatus::Succeeded {
                return Ok(already());
            }
            error!(
                order_id = %order_id,
                status = %current.payment_status,
                "order changed state during commit"
            );
            return Err(TicketError::OrderTerminal {
                order_id: order_id.to_string(),
                status: current.payment_status,
            });
        }
        if from != PaymentStatus::Pending {
            warn!(order_id = %order_id, previous = %from, "late payment success on closed order");
        }

        let competition_id = order.competition_id.as_str();
        let user_id = order.user_id.as_str();
        let sold = self
            .store
            .sell_reserved(competition_id, user_id, order_id, &order.ticket_numbers)
            .await?;
        let sold_set: HashSet<u32> = sold.iter().copied().collect();
        let missing: Vec<u32> = order
            .ticket_numbers
            .iter()
            .copied()
            .filter(|n| !sold_set.contains(n))
            .collect();
        if !missing.is_empty() {
            warn!(
                order_id = %order_id,
                competition_id = %competition_id,
                expected = order.ticket_numbers.len(),
                updated = sold.len(),
                missing = ?missing,
                "commit discrepancy: reserved rows no longer held by buyer"
            );
            self.audit.record(
                AuditEvent::new(
                    now,
                    AuditAction::CommitDiscrepancy {
                        expected: order.ticket_numbers.len() as u32,
                        updated: sold.len() as u32,
                        missing: missing.clone(),
                    },
                )
                .competition(competition_id)
                .user(user_id)
                .order(order_id),
            );
        }

        let bonus = if order.bonus_ticket_count > 0 {
            self.store
                .assign_bonus(competition_id, user_id, order_id, order.bonus_ticket_count)
                .await?
        } else {
            Vec::new()
        };
        if (bonus.len() as u32) < order.bonus_ticket_count {
            warn!(
                order_id = %order_id,
                owed = order.bonus_ticket_count,
                assigned = bonus.len(),
                "not enough available tickets for full bonus"
            );
        }

        // 「AVAILABLE が 0」ではなく RESERVED も数える。決済途中の購入者がいる間は SOLD_OUT にしない
        let sold_out = self.mark_sold_out_if_exhausted(competition_id).await?;

        if let Err(err) = self
            .reservations
            .release_numbers(competition_id, user_id, &order.ticket_numbers)
            .await
        {
            warn!(order_id = %order_id, error = %err, "cache cleanup after commit failed");
        }

        self.audit.record(
            AuditEvent::new(
                now,
                AuditAction::OrderCommitted {
                    sold: sold.clone(),
                    bonus: bonus.clone(),
                },
            )
            .competition(competition_id)
            .user(user_id)
            .order(order_id),
        );
        if let Err(err) = self.notifier.order_committed(&order, &bonus).await {
            warn!(order_id = %order_id, error = %err, "purchase notification failed");
        }
        info!(
            order_id = %order_id,
            sold = sold.len(),
            bonus = bonus.len(),
            sold_out,
            "order committed"
        );

        Ok(CommitOutcome::Committed(CommitSummary {
            order_id: order_id.to_string(),
            sold,
            bonus,
            missing,
            sold_out,
        }))
    }

    /// 決済期限切れ・キャンセル
    pub async fn expire_or_cancel(&self, order_id: &str) -> TicketResult<CloseOutcome> {
        self.close(order_id, PaymentStatus::Cancelled).await
    }

    /// 決済失敗（戻し方はキャンセルと同じ）
    pub async fn record_payment_failure(&self, order_id: &str) -> TicketResult<CloseOutcome> {
        self.close(order_id, PaymentStatus::Failed).await
    }

    async fn close(&self, order_id: &str, to: PaymentStatus) -> TicketResult<CloseOutcome> {
        let order = self.load_order(order_id).await?;
        let now = self.clock.now_millis();
        let already_closed = match order.payment_status {
            PaymentStatus::Pending => {
                let moved = self
                    .store
                    .transition_order(order_id, PaymentStatus::Pending, to, now)
                    .await?;
                if moved == 0 {
                    let current = self.load_order(order_id).await?;
                    if current.payment_status != to {
                        return Err(TicketError::OrderTerminal {
                            order_id: order_id.to_string(),
                            status: current.payment_status,
                        });
                    }
                    true
                } else {
                    false
                }
            }
            status if status == to => true,
            status => {
                return Err(TicketError::OrderTerminal {
                    order_id: order_id.to_string(),
                    status,
                })
            }
        };

        // キャッシュ側の予約が無くても（期限切れ後でも）安全に呼べる
        let competition_id = order.competition_id.as_str();
        let user_id = order.user_id.as_str();
        let released = self
            .store
            .release_tickets(competition_id, user_id, &order.ticket_numbers)
            .await? as u32;
        self.reservations
            .release_numbers(competition_id, user_id, &order.ticket_numbers)
            .await?;

        if !already_closed || released > 0 {
            self.audit.record(
                AuditEvent::new(now, AuditAction::OrderClosed { status: to, released })
                    .competition(competition_id)
                    .user(user_id)
                    .order(order_id),
            );
            info!(order_id = %order_id, status = %to, released, "order closed");
        }

        Ok(CloseOutcome {
            order_id: order_id.to_string(),
            status: to,
            released,
            already_closed,
        })
    }

    /// 郵送による無料応募
    pub async fn grant_free_entry(
        &self,
        competition_id: &str,
        user_id: &str,
    ) -> TicketResult<FreeEntryGrant> {
        let ticket_number = self
            .reservations
            .claim_free_entry(competition_id, user_id)
            .await?;
        self.audit.record(
            AuditEvent::new(
                self.clock.now_millis(),
                AuditAction::FreeEntryGranted { ticket_number },
            )
            .competition(competition_id)
            .user(user_id),
        );
        let sold_out = self.mark_sold_out_if_exhausted(competition_id).await?;
        Ok(FreeEntryGrant {
            ticket_number,
            sold_out,
        })
    }

    /// 未販売（AVAILABLE + RESERVED）が 0 なら SOLD_OUT へ
    async fn mark_sold_out_if_exhausted(&self, competition_id: &str) -> TicketResult<bool> {
        if self.store.count_unsold(competition_id).await? > 0 {
            return Ok(false);
        }
        if self.store.mark_sold_out(competition_id).await? > 0 {
            info!(competition_id = %competition_id, "competition sold out");
            self.audit.record(
                AuditEvent::new(self.clock.now_millis(), AuditAction::CompetitionSoldOut)
                    .competition(competition_id),
            );
        }
        Ok(true)
    }

    async fn load_order(&self, order_id: &str) -> TicketResult<Order> {
        self.store
            .order(order_id)
            .await?
            .ok_or_else(|| TicketError::OrderNotFound(order_id.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::cache::{keys, LockStore};
    use crate::model::TicketStatus;
    use crate::notify::tests::FailingNotifier;
    use crate::notify::LogNotifier;
    use crate::payment::tests::RecordingProvider;
    use crate::qcm::QcmIdentity;
    use crate::reservation::tests::{harness, Harness, TTL_MS};
    use crate::store::tests::competition;
    use ticket_core::{BonusTier, QcmPolicy};

    pub(crate) struct Fixture {
        pub h: Harness,
        pub qcm: Arc<QcmGate>,
        pub audit: Arc<MemoryAuditSink>,
        pub payments: Arc<RecordingProvider>,
        pub checkout: CheckoutCoordinator,
    }

    pub(crate) async fn fixture_with(
        total: u32,
        per_user: u32,
        payments: RecordingProvider,
        notifier: Arc<dyn Notifier>,
    ) -> Fixture {
        let h = harness(total, per_user).await;
        let qcm = Arc::new(QcmGate::new(
            h.cache.clone(),
            h.clock.clone(),
            QcmPolicy::default(),
            86_400_000,
        ));
        let audit = Arc::new(MemoryAuditSink::default());
        let payments = Arc::new(payments);
        let checkout = CheckoutCoordinator::new(
            h.store.clone(),
            h.engine.clone(),
            qcm.clone(),
            payments.clone(),
            notifier,
            audit.clone(),
            h.clock.clone(),
            "GBP",
            "http://localhost:3000/checkout/complete",
        );
        Fixture {
            h,
            qcm,
            audit,
            payments,
            checkout,
        }
    }

    pub(crate) async fn fixture(total: u32, per_user: u32) -> Fixture {
        fixture_with(
            total,
            per_user,
            RecordingProvider::default(),
            Arc::new(LogNotifier),
        )
        .await
    }

    impl Fixture {
        pub(crate) async fn pass_qcm(&self, competition_id: &str, user_id: &str) {
            self.qcm
                .record_attempt(competition_id, &QcmIdentity::User(user_id.into()), true)
                .await
                .unwrap();
        }

        /// reserve → QCM 合格 → セッション作成
        pub(crate) async fn open_order(&self, user_id: &str, quantity: u32) -> Order {
            self.h.engine.reserve("c1", user_id, quantity).await.unwrap();
            self.pass_qcm("c1", user_id).await;
            self.checkout
                .create_payment_session("c1", user_id, None, None)
                .await
                .unwrap()
                .order
        }
    }

    #[tokio::test]
    async fn session_requires_qcm_pass() {
        let f = fixture(10, 5).await;
        f.h.engine.reserve("c1", "alice", 2).await.unwrap();
        let err = f
            .checkout
            .create_payment_session("c1", "alice", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::QcmNotPassed));
        assert!(f.payments.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn session_prices_order_and_extends_reservation() {
        let f = fixture(10, 5).await;
        let r = f.h.engine.reserve("c1", "alice", 3).await.unwrap();
        f.pass_qcm("c1", "alice").await;
        f.h.clock.advance(60_000);

        let session = f
            .checkout
            .create_payment_session("c1", "alice", None, None)
            .await
            .unwrap();
        assert_eq!(session.order.ticket_numbers, r.ticket_numbers);
        assert_eq!(session.order.total_amount, 750);
        assert_eq!(session.order.payment_status, PaymentStatus::Pending);
        assert_eq!(session.expires_at, f.h.clock.now_millis() + TTL_MS);
        assert!(session.order.order_id.starts_with("ord_"));

        let requests = f.payments.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].amount, 750);
        assert_eq!(requests[0].currency, "GBP");
    }

    #[tokio::test]
    async fn session_recreates_expired_reservation_from_selection() {
        let f = fixture(10, 5).await;
        let r = f.h.engine.reserve("c1", "alice", 2).await.unwrap();
        f.pass_qcm("c1", "alice").await;
        f.h.clock.advance(TTL_MS + 1);

        assert!(matches!(
            f.checkout
                .create_payment_session("c1", "alice", None, None)
                .await,
            Err(TicketError::NoActiveReservation)
        ));
        let session = f
            .checkout
            .create_payment_session("c1", "alice", None, Some(&r.ticket_numbers))
            .await
            .unwrap();
        assert_eq!(session.order.ticket_numbers, r.ticket_numbers);
    }

    #[tokio::test]
    async fn provider_failure_cancels_order_and_releases_tickets() {
        let f = fixture_with(
            10,
            5,
            RecordingProvider {
                fail: true,
                ..Default::default()
            },
            Arc::new(LogNotifier),
        )
        .await;
        f.h.engine.reserve("c1", "alice", 2).await.unwrap();
        f.pass_qcm("c1", "alice").await;

        let err = f
            .checkout
            .create_payment_session("c1", "alice", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::PaymentProvider(_)));
        let order_id = f.payments.requests.lock()[0].order_id.clone();
        let order = f.h.store.order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Cancelled);
        assert_eq!(f.h.store.status_counts("c1").await.unwrap().available, 10);
        assert!(f.h.engine.current("c1", "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_commit_is_a_no_op() {
        let f = fixture(10, 5).await;
        let order = f.open_order("alice", 3).await;

        let first = f.checkout.commit(&order.order_id).await.unwrap();
        let CommitOutcome::Committed(summary) = first else {
            panic!("expected commit");
        };
        assert_eq!(summary.sold, order.ticket_numbers);
        assert!(summary.missing.is_empty());
        let after_first = f.h.store.tickets("c1");

        let second = f.checkout.commit(&order.order_id).await.unwrap();
        assert_eq!(
            second,
            CommitOutcome::AlreadyProcessed {
                order_id: order.order_id.clone()
            }
        );
        assert_eq!(f.h.store.tickets("c1"), after_first);
        let counts = f.h.store.status_counts("c1").await.unwrap();
        assert_eq!(counts.sold, 3);
        assert_eq!(counts.total(), 10);
        // 予約とロックは消え、QCM の合格フラグだけ残る
        assert_eq!(f.h.cache.live_len(), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicate_notifications_commit_once() {
        let f = fixture(10, 5).await;
        let order = f.open_order("alice", 2).await;
        let (a, b) = tokio::join!(
            f.checkout.commit(&order.order_id),
            f.checkout.commit(&order.order_id)
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let committed = outcomes
            .iter()
            .filter(|o| matches!(o, CommitOutcome::Committed(_)))
            .count();
        assert_eq!(committed, 1);
        assert_eq!(f.h.store.status_counts("c1").await.unwrap().sold, 2);
    }

    #[tokio::test]
    async fn commit_after_admin_release_logs_discrepancy() {
        let f = fixture(10, 5).await;
        let order = f.open_order("alice", 2).await;
        // 管理者が 1 枚を手動で戻した
        f.h.store
            .release_tickets("c1", "alice", &order.ticket_numbers[..1])
            .await
            .unwrap();

        let outcome = f.checkout.commit(&order.order_id).await.unwrap();
        let CommitOutcome::Committed(summary) = outcome else {
            panic!("expected commit");
        };
        assert_eq!(summary.sold, order.ticket_numbers[1..].to_vec());
        assert_eq!(summary.missing, order.ticket_numbers[..1].to_vec());
        let stored = f.h.store.order(&order.order_id).await.unwrap().unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Succeeded);
        assert!(f.audit.kinds().contains(&"COMMIT_DISCREPANCY"));
    }

    #[tokio::test]
    async fn pending_reservations_keep_competition_open() {
        let f = fixture(4, 4).await;
        let order = f.open_order("alice", 2).await;
        f.h.engine.reserve("c1", "bob", 2).await.unwrap();
        assert_eq!(f.h.store.status_counts("c1").await.unwrap().available, 0);

        let CommitOutcome::Committed(summary) = f.checkout.commit(&order.order_id).await.unwrap()
        else {
            panic!("expected commit");
        };
        assert!(!summary.sold_out);
        let c = f.h.store.competition("c1").await.unwrap().unwrap();
        assert_eq!(c.status, CompetitionStatus::Active);
    }

    #[tokio::test]
    async fn bonus_tickets_and_sold_out() {
        let f = fixture(10, 5).await;
        let mut c2 = competition("c2", 6, 5);
        c2.bonus_tiers = vec![BonusTier {
            min_tickets: 4,
            bonus_percent: 50,
        }];
        f.h.store.provision(c2).await.unwrap();

        f.h.engine.reserve("c2", "alice", 4).await.unwrap();
        f.pass_qcm("c2", "alice").await;
        let session = f
            .checkout
            .create_payment_session("c2", "alice", None, None)
            .await
            .unwrap();
        assert_eq!(session.order.bonus_ticket_count, 2);

        let CommitOutcome::Committed(summary) =
            f.checkout.commit(&session.order.order_id).await.unwrap()
        else {
            panic!("expected commit");
        };
        assert_eq!(summary.bonus.len(), 2);
        assert!(summary.sold_out);
        let c2 = f.h.store.competition("c2").await.unwrap().unwrap();
        assert_eq!(c2.status, CompetitionStatus::SoldOut);
        // ボーナスは購入上限に数えない
        assert_eq!(f.h.store.sold_count_for_user("c2", "alice").await.unwrap(), 4);
        assert!(f.audit.kinds().contains(&"COMPETITION_SOLD_OUT"));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_releases_everything() {
        let f = fixture(10, 5).await;
        let order = f.open_order("alice", 3).await;

        let first = f.checkout.expire_or_cancel(&order.order_id).await.unwrap();
        assert_eq!(first.released, 3);
        assert!(!first.already_closed);
        assert_eq!(f.h.store.status_counts("c1").await.unwrap().available, 10);
        for n in &order.ticket_numbers {
            assert_eq!(f.h.cache.get(&keys::ticket_lock("c1", *n)).await.unwrap(), None);
        }

        let second = f.checkout.expire_or_cancel(&order.order_id).await.unwrap();
        assert!(second.already_closed);
        assert_eq!(second.released, 0);

        // 失敗への付け替えはできない
        assert!(matches!(
            f.checkout.record_payment_failure(&order.order_id).await,
            Err(TicketError::OrderTerminal { .. })
        ));
    }

    #[tokio::test]
    async fn late_expiry_without_cache_reservation_is_safe() {
        let f = fixture(10, 5).await;
        let order = f.open_order("alice", 2).await;
        f.h.clock.advance(TTL_MS * 3);
        let closed = f.checkout.expire_or_cancel(&order.order_id).await.unwrap();
        assert_eq!(closed.status, PaymentStatus::Cancelled);
        assert_eq!(f.h.store.status_counts("c1").await.unwrap().available, 10);
    }

    #[tokio::test]
    async fn cannot_cancel_committed_order() {
        let f = fixture(10, 5).await;
        let order = f.open_order("alice", 1).await;
        f.checkout.commit(&order.order_id).await.unwrap();
        assert!(matches!(
            f.checkout.expire_or_cancel(&order.order_id).await,
            Err(TicketError::OrderTerminal {
                status: PaymentStatus::Succeeded,
                ..
            })
        ));
        assert_eq!(f.h.store.status_counts("c1").await.unwrap().sold, 1);
    }

    #[tokio::test]
    async fn late_success_after_cancel_records_missing_tickets() {
        let f = fixture(10, 5).await;
        let order = f.open_order("alice", 2).await;
        f.checkout.expire_or_cancel(&order.order_id).await.unwrap();

        let CommitOutcome::Committed(summary) = f.checkout.commit(&order.order_id).await.unwrap()
        else {
            panic!("expected commit");
        };
        assert!(summary.sold.is_empty());
        assert_eq!(summary.missing, order.ticket_numbers);
    }

    #[tokio::test]
    async fn notifier_failure_does_not_undo_commit() {
        let notifier = Arc::new(FailingNotifier::default());
        let f = fixture_with(10, 5, RecordingProvider::default(), notifier.clone()).await;
        let order = f.open_order("alice", 2).await;
        assert!(matches!(
            f.checkout.commit(&order.order_id).await.unwrap(),
            CommitOutcome::Committed(_)
        ));
        assert_eq!(*notifier.calls.lock(), 1);
        let stored = f.h.store.order(&order.order_id).await.unwrap().unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Succeeded);
    }

    #[tokio::test]
    async fn free_entry_can_sell_out_competition() {
        let f = fixture(2, 2).await;
        let order = f.open_order("alice", 1).await;
        f.checkout.commit(&order.order_id).await.unwrap();

        let grant = f.checkout.grant_free_entry("c1", "postal").await.unwrap();
        assert!(grant.sold_out);
        let tickets = f.h.store.tickets("c1");
        assert_eq!(
            tickets[(grant.ticket_number - 1) as usize].status,
            TicketStatus::FreeEntry
        );
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let f = fixture(2, 2).await;
        assert!(matches!(
            f.checkout.commit("ord_missing").await,
            Err(TicketError::OrderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn conservation_holds_through_full_flow() {
        let f = fixture(12, 5).await;
        let a = f.open_order("alice", 4).await;
        let b = f.open_order("bob", 3).await;
        f.checkout.commit(&a.order_id).await.unwrap();
        f.checkout.expire_or_cancel(&b.order_id).await.unwrap();
        f.h.engine.reserve("c1", "carol", 5).await.unwrap();
        f.checkout.grant_free_entry("c1", "postal").await.unwrap();

        let counts = f.h.store.status_counts("c1").await.unwrap();
        assert_eq!(counts.total(), 12);
        assert_eq!(counts.sold, 4);
        assert_eq!(counts.reserved, 5);
        assert_eq!(counts.free_entry, 1);
        assert_eq!(counts.available, 2);
    }
}
