//! 抽選エンジン
//!
//! 当選の決定・大会の COMPLETED 化・Win の記録は `record_draw` の 1 トランザクションで行い、
//! その中で `actual_draw_at` が未設定であることを確認する。途中でクラッシュして再実行しても
//! 当選者が 2 人になることはない。
//!
//! 失敗しても自動で再試行しない（抽選のやり直しは運用者の明示的な操作のみ）。

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use ticket_core::{draw_with_os_rng, prepare_eligible, Clock, DrawSelection, EligibleTicket};
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::error::{TicketError, TicketResult};
use crate::model::{Competition, CompetitionStatus, Win};
use crate::notify::Notifier;
use crate::store::TicketRepository;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawOutcome {
    pub competition_id: String,
    pub ticket_number: u32,
    pub winner_user_id: String,
    pub raw_index: u64,
    pub eligible_count: u64,
    pub eligible_digest: String,
    pub method: String,
    pub drawn_at: u64,
    pub redraw: bool,
}

pub struct DrawEngine {
    store: Arc<dyn TicketRepository>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl DrawEngine {
    pub fn new(
        store: Arc<dyn TicketRepository>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            audit,
            notifier,
            clock,
        }
    }

    async fn competition(&self, competition_id: &str) -> TicketResult<Competition> {
        self.store
            .competition(competition_id)
            .await?
            .ok_or_else(|| TicketError::CompetitionNotFound(competition_id.to_string()))
    }

    /// `force` なら ACTIVE / SOLD_OUT を DRAWING に移してから抽選する。
    /// 対象チケットが無い時は状態を変えずに失敗する。
    pub async fn execute_draw(&self, competition_id: &str, force: bool) -> TicketResult<DrawOutcome> {
        let competition = self.competition(competition_id).await?;
        if competition.actual_draw_at.is_some() || competition.status == CompetitionStatus::Completed
        {
            return Err(TicketError::DrawAlreadyExecuted);
        }

        let now = self.clock.now_millis();
        let status = competition.status;
        let forcing =
            force && matches!(status, CompetitionStatus::Active | CompetitionStatus::SoldOut);
        let ready = forcing
            || match status {
                CompetitionStatus::SoldOut | CompetitionStatus::Drawing => true,
                CompetitionStatus::Active => competition.draw_at.is_some_and(|at| at <= now),
                CompetitionStatus::Completed | CompetitionStatus::Cancelled => false,
            };
        if !ready {
            return Err(TicketError::NotEligibleForDraw(format!(
                "competition is {} and its draw date has not passed",
                status
            )));
        }

        let eligible = prepare_eligible(self.store.eligible_tickets(competition_id).await?);
        let selection = draw_with_os_rng(&eligible).ok_or_else(|| {
            TicketError::NotEligibleForDraw("no eligible tickets".to_string())
        })?;

        if forcing {
            if self.store.mark_drawing(competition_id).await? > 0 {
                info!(competition_id = %competition_id, previous = %status, "competition forced into DRAWING");
            } else {
                // 読み取り後に別経路で状態が変わった
                let current = self.competition(competition_id).await?;
                if !matches!(
                    current.status,
                    CompetitionStatus::SoldOut | CompetitionStatus::Drawing
                ) {
                    return Err(TicketError::NotEligibleForDraw(format!(
                        "competition moved to {} before the draw",
                        current.status
                    )));
                }
            }
        }
        let win = win_from(competition_id, &selection, now);
        if !self.store.record_draw(&win).await? {
            return Err(TicketError::DrawAlreadyExecuted);
        }
        Ok(self.finish(win, selection, false).await)
    }

    /// 当選者が受け取らなかった場合のやり直し。過去の当選番号はすべて除外する。
    /// 以前の Win の無効化はここでは行わない。
    pub async fn redraw(&self, competition_id: &str) -> TicketResult<DrawOutcome> {
        let competition = self.competition(competition_id).await?;
        let previous = match (competition.status, competition.winning_ticket_number) {
            (CompetitionStatus::Completed, Some(n)) => n,
            _ => {
                return Err(TicketError::NotEligibleForDraw(
                    "competition has no completed draw to repeat".to_string(),
                ))
            }
        };

        let excluded: HashSet<u32> = self
            .store
            .wins(competition_id)
            .await?
            .into_iter()
            .map(|w| w.ticket_number)
            .chain(std::iter::once(previous))
            .collect();
        let remaining: Vec<EligibleTicket> = self
            .store
            .eligible_tickets(competition_id)
            .await?
            .into_iter()
            .filter(|t| !excluded.contains(&t.ticket_number))
            .collect();
        let eligible = prepare_eligible(remaining);
        let selection = draw_with_os_rng(&eligible).ok_or_else(|| {
            TicketError::NotEligibleForDraw("no eligible tickets left for redraw".to_string())
        })?;

        let now = self.clock.now_millis();
        let win = win_from(competition_id, &selection, now);
        if !self.store.record_redraw(previous, &win).await? {
            // 並行した redraw が先に当選番号を書き換えた
            return Err(TicketError::DrawAlreadyExecuted);
        }
        Ok(self.finish(win, selection, true).await)
    }

    async fn finish(&self, win: Win, selection: DrawSelection, redraw: bool) -> DrawOutcome {
        info!(
            competition_id = %win.competition_id,
            ticket_number = win.ticket_number,
            raw_index = selection.raw_index,
            eligible_count = selection.eligible_count,
            method = selection.method,
            redraw,
            "draw executed"
        );
        let outcome = DrawOutcome {
            competition_id: win.competition_id.clone(),
            ticket_number: win.ticket_number,
            winner_user_id: win.user_id.clone(),
            raw_index: win.raw_index,
            eligible_count: win.eligible_count,
            eligible_digest: selection.eligible_digest,
            method: win.method.clone(),
            drawn_at: win.drawn_at,
            redraw,
        };
        self.audit.record(
            AuditEvent::new(
                win.drawn_at,
                AuditAction::DrawExecuted {
                    ticket_number: outcome.ticket_number,
                    winner_user_id: outcome.winner_user_id.clone(),
                    raw_index: outcome.raw_index,
                    eligible_count: outcome.eligible_count,
                    eligible_digest: outcome.eligible_digest.clone(),
                    method: outcome.method.clone(),
                    redraw,
                },
            )
            .competition(&win.competition_id)
            .user(&win.user_id),
        );
        if let Err(err) = self.notifier.draw_completed(&win).await {
            warn!(competition_id = %win.competition_id, error = %err, "winner notification failed");
        }
        outcome
    }
}

fn win_from(competition_id: &str, selection: &DrawSelection, drawn_at: u64) -> Win {
    Win {
        competition_id: competition_id.to_string(),
        user_id: selection.user_id.clone(),
        ticket_number: selection.ticket_number,
        raw_index: selection.raw_index as u64,
        eligible_count: selection.eligible_count as u64,
        method: selection.method.to_string(),
        drawn_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::notify::tests::FailingNotifier;
    use crate::store::tests::competition;
    use crate::store::MemoryTicketStore;
    use ticket_core::{ManualClock, DRAW_METHOD};

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryTicketStore>,
        audit: Arc<MemoryAuditSink>,
        engine: DrawEngine,
    }

    /// 1..=sold を user-{n} に売った 10 枚の大会
    async fn fixture(sold: u32) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryTicketStore::new());
        let mut c = competition("c1", 10, 10);
        c.draw_at = Some(50_000);
        store.provision(c).await.unwrap();
        for n in 1..=sold {
            let user = format!("user-{n}");
            store.reserve_tickets("c1", &user, &[n], 10_000, 0).await.unwrap();
            store
                .sell_reserved("c1", &user, &format!("ord_{n}"), &[n])
                .await
                .unwrap();
        }
        let audit = Arc::new(MemoryAuditSink::default());
        let engine = DrawEngine::new(
            store.clone(),
            audit.clone(),
            Arc::new(FailingNotifier::default()),
            clock.clone(),
        );
        Fixture {
            clock,
            store,
            audit,
            engine,
        }
    }

    #[tokio::test]
    async fn active_competition_waits_for_draw_date() {
        let f = fixture(4).await;
        assert!(matches!(
            f.engine.execute_draw("c1", false).await,
            Err(TicketError::NotEligibleForDraw(_))
        ));

        f.clock.set(50_000);
        let outcome = f.engine.execute_draw("c1", false).await.unwrap();
        assert!((1..=4).contains(&outcome.ticket_number));
        assert_eq!(outcome.winner_user_id, format!("user-{}", outcome.ticket_number));
        assert_eq!(outcome.eligible_count, 4);
        assert_eq!(outcome.method, DRAW_METHOD);
        assert_eq!(outcome.raw_index + 1, outcome.ticket_number as u64);

        let c = f.store.competition("c1").await.unwrap().unwrap();
        assert_eq!(c.status, CompetitionStatus::Completed);
        assert_eq!(c.winning_ticket_number, Some(outcome.ticket_number));
        assert_eq!(c.actual_draw_at, Some(50_000));
    }

    #[tokio::test]
    async fn second_draw_is_rejected() {
        let f = fixture(3).await;
        f.engine.execute_draw("c1", true).await.unwrap();
        assert!(matches!(
            f.engine.execute_draw("c1", true).await,
            Err(TicketError::DrawAlreadyExecuted)
        ));
        assert_eq!(f.store.wins("c1").await.unwrap().len(), 1);
        assert_eq!(f.audit.kinds(), vec!["DRAW_EXECUTED"]);
    }

    #[tokio::test]
    async fn force_moves_competition_into_drawing() {
        let f = fixture(2).await;
        let outcome = f.engine.execute_draw("c1", true).await.unwrap();
        assert!(!outcome.redraw);
        assert_eq!(outcome.eligible_digest.len(), 64);
    }

    #[tokio::test]
    async fn sold_out_competition_is_drawable_without_force() {
        let f = fixture(10).await;
        f.store.mark_sold_out("c1").await.unwrap();
        let outcome = f.engine.execute_draw("c1", false).await.unwrap();
        assert_eq!(outcome.eligible_count, 10);
    }

    #[tokio::test]
    async fn empty_pool_is_not_eligible() {
        let f = fixture(0).await;
        assert!(matches!(
            f.engine.execute_draw("c1", true).await,
            Err(TicketError::NotEligibleForDraw(_))
        ));
        let c = f.store.competition("c1").await.unwrap().unwrap();
        assert!(c.actual_draw_at.is_none());
        // 失敗した強制抽選で販売が止まらない
        assert_eq!(c.status, CompetitionStatus::Active);
    }

    #[tokio::test]
    async fn deleted_owners_are_never_drawn() {
        let f = fixture(3).await;
        f.store.mark_owner_deleted("user-1").await.unwrap();
        f.store.mark_owner_deleted("user-2").await.unwrap();
        let outcome = f.engine.execute_draw("c1", true).await.unwrap();
        assert_eq!(outcome.ticket_number, 3);
        assert_eq!(outcome.eligible_count, 1);
    }

    #[tokio::test]
    async fn redraw_excludes_every_previous_winner() {
        let f = fixture(3).await;
        assert!(matches!(
            f.engine.redraw("c1").await,
            Err(TicketError::NotEligibleForDraw(_))
        ));

        let first = f.engine.execute_draw("c1", true).await.unwrap();
        let second = f.engine.redraw("c1").await.unwrap();
        assert!(second.redraw);
        assert_ne!(second.ticket_number, first.ticket_number);
        assert_eq!(second.eligible_count, 2);

        let third = f.engine.redraw("c1").await.unwrap();
        assert_eq!(third.eligible_count, 1);
        assert!(![first.ticket_number, second.ticket_number].contains(&third.ticket_number));
        assert!(matches!(
            f.engine.redraw("c1").await,
            Err(TicketError::NotEligibleForDraw(_))
        ));

        let c = f.store.competition("c1").await.unwrap().unwrap();
        assert_eq!(c.winning_ticket_number, Some(third.ticket_number));
        assert_eq!(f.store.wins("c1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn notification_failure_keeps_result() {
        let f = fixture(1).await;
        let outcome = f.engine.execute_draw("c1", true).await.unwrap();
        assert_eq!(outcome.ticket_number, 1);
        assert!(f.store.competition("c1").await.unwrap().unwrap().actual_draw_at.is_some());
    }
}
