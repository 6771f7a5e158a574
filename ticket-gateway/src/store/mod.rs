//! チケットストア（リレーショナル側の正本）
//!
//! 競合が起きうる更新はすべて「期待する前状態に一致する行だけ更新」し、
//! 影響行数（または更新できた番号）を返す。読んでから書く二段階にはしない。
//!
//! - `MemoryTicketStore`: 単一 RwLock。各メソッドが 1 回の write lock 内で完結する。
//! - `PgTicketStore`（feature `postgres`）: 条件付き UPDATE とトランザクション。

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use ticket_core::EligibleTicket;

use crate::error::{TicketError, TicketResult};
use crate::model::{
    Competition, CompetitionStatus, Order, PaymentStatus, StatusCounts, Ticket, TicketOwner,
    TicketStatus, Win,
};

#[async_trait]
pub trait TicketRepository: Send + Sync {
    /// 大会と 1..=total_tickets の AVAILABLE 行を作る
    async fn provision(&self, competition: Competition) -> TicketResult<()>;

    async fn competition(&self, competition_id: &str) -> TicketResult<Option<Competition>>;

    /// SOLD / FREE_ENTRY と、`requester` 以外が期限内で RESERVED にしている番号
    async fn unavailable_numbers(
        &self,
        competition_id: &str,
        requester: &str,
        now_ms: u64,
    ) -> TicketResult<HashSet<u32>>;

    /// ユーザーが購入済み（ボーナス除く）の枚数
    async fn sold_count_for_user(&self, competition_id: &str, user_id: &str) -> TicketResult<u32>;

    /// AVAILABLE / 期限切れ RESERVED / 本人の RESERVED だけを RESERVED にする
    async fn reserve_tickets(
        &self,
        competition_id: &str,
        user_id: &str,
        numbers: &[u32],
        reserved_until: u64,
        now_ms: u64,
    ) -> TicketResult<usize>;

    /// 本人の RESERVED 行の期限を更新する
    async fn refresh_reservation(
        &self,
        competition_id: &str,
        user_id: &str,
        numbers: &[u32],
        reserved_until: u64,
    ) -> TicketResult<usize>;

    /// 本人の RESERVED 行を AVAILABLE に戻す
    async fn release_tickets(
        &self,
        competition_id: &str,
        user_id: &str,
        numbers: &[u32],
    ) -> TicketResult<usize>;

    /// 本人の RESERVED 行を SOLD にし、更新できた番号を返す
    async fn sell_reserved(
        &self,
        competition_id: &str,
        user_id: &str,
        order_id: &str,
        numbers: &[u32],
    ) -> TicketResult<Vec<u32>>;

    /// 番号の小さい AVAILABLE から最大 `count` 枚をボーナスとして SOLD にする
    async fn assign_bonus(
        &self,
        competition_id: &str,
        user_id: &str,
        order_id: &str,
        count: u32,
    ) -> TicketResult<Vec<u32>>;

    /// 無料応募（郵送）枠として 1 枚を FREE_ENTRY にする
    async fn grant_free_entry(
        &self,
        competition_id: &str,
        user_id: &str,
        ticket_number: u32,
        now_ms: u64,
    ) -> TicketResult<usize>;

    /// まだ売れていない枚数（AVAILABLE + RESERVED）
    async fn count_unsold(&self, competition_id: &str) -> TicketResult<u64>;

    async fn status_counts(&self, competition_id: &str) -> TicketResult<StatusCounts>;

    /// ACTIVE → SOLD_OUT
    async fn mark_sold_out(&self, competition_id: &str) -> TicketResult<usize>;

    /// ACTIVE / SOLD_OUT → DRAWING（未抽選のみ）
    async fn mark_drawing(&self, competition_id: &str) -> TicketResult<usize>;

    async fn create_order(&self, order: Order) -> TicketResult<()>;

    async fn order(&self, order_id: &str) -> TicketResult<Option<Order>>;

    /// `from` → `to` の条件付き遷移
    async fn transition_order(
        &self,
        order_id: &str,
        from: PaymentStatus,
        to: PaymentStatus,
        now_ms: u64,
    ) -> TicketResult<usize>;

    /// SOLD / FREE_ENTRY かつ所有者ありの行（番号順）
    async fn eligible_tickets(&self, competition_id: &str) -> TicketResult<Vec<EligibleTicket>>;

    /// 抽選結果を 1 トランザクションで記録する。
    /// `actual_draw_at` が既に埋まっていれば何もせず false。
    async fn record_draw(&self, win: &Win) -> TicketResult<bool>;

    /// 再抽選の記録。当選番号が `previous_ticket` のままの時だけ書く。
    async fn record_redraw(&self, previous_ticket: u32, win: &Win) -> TicketResult<bool>;

    async fn wins(&self, competition_id: &str) -> TicketResult<Vec<Win>>;

    /// 退会ユーザーの行を OWNER_DELETED にし、予約中の行は解放する
    async fn mark_owner_deleted(&self, user_id: &str) -> TicketResult<usize>;
}

struct CompetitionState {
    competition: Competition,
    /// index = ticket_number - 1
    tickets: Vec<Ticket>,
    wins: Vec<Win>,
}

impl CompetitionState {
    fn ticket_mut(&mut self, ticket_number: u32) -> Option<&mut Ticket> {
        let idx = (ticket_number as usize).checked_sub(1)?;
        self.tickets.get_mut(idx)
    }
}

#[derive(Default)]
struct Inner {
    competitions: HashMap<String, CompetitionState>,
    orders: HashMap<String, Order>,
}

impl Inner {
    fn state(&self, competition_id: &str) -> TicketResult<&CompetitionState> {
        self.competitions
            .get(competition_id)
            .ok_or_else(|| TicketError::CompetitionNotFound(competition_id.to_string()))
    }

    fn state_mut(&mut self, competition_id: &str) -> TicketResult<&mut CompetitionState> {
        self.competitions
            .get_mut(competition_id)
            .ok_or_else(|| TicketError::CompetitionNotFound(competition_id.to_string()))
    }
}

/// インメモリのチケットストア
#[derive(Default)]
pub struct MemoryTicketStore {
    inner: RwLock<Inner>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// テスト・調査用のスナップショット
    pub fn tickets(&self, competition_id: &str) -> Vec<Ticket> {
        self.inner
            .read()
            .competitions
            .get(competition_id)
            .map(|s| s.tickets.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TicketRepository for MemoryTicketStore {
    async fn provision(&self, competition: Competition) -> TicketResult<()> {
        let mut inner = self.inner.write();
        if inner.competitions.contains_key(&competition.id) {
            return Err(TicketError::BadRequest(format!(
                "competition {} already exists",
                competition.id
            )));
        }
        let tickets = (1..=competition.total_tickets)
            .map(|n| Ticket::available(&competition.id, n))
            .collect();
        inner.competitions.insert(
            competition.id.clone(),
            CompetitionState {
                competition,
                tickets,
                wins: Vec::new(),
            },
        );
        Ok(())
    }

    async fn competition(&self, competition_id: &str) -> TicketResult<Option<Competition>> {
        Ok(self
            .inner
            .read()
            .competitions
            .get(competition_id)
            .map(|s| s.competition.clone()))
    }

    async fn unavailable_numbers(
        &self,
        competition_id: &str,
        requester: &str,
        now_ms: u64,
    ) -> TicketResult<HashSet<u32>> {
        let inner = self.inner.read();
        let state = inner.state(competition_id)?;
        Ok(state
            .tickets
            .iter()
            .filter(|t| match t.status {
                TicketStatus::Sold | TicketStatus::FreeEntry => true,
                TicketStatus::Reserved => t.is_held_at(now_ms) && !t.owner.is(requester),
                TicketStatus::Available => false,
            })
            .map(|t| t.ticket_number)
            .collect())
    }

    async fn sold_count_for_user(&self, competition_id: &str, user_id: &str) -> TicketResult<u32> {
        let inner = self.inner.read();
        let state = inner.state(competition_id)?;
        Ok(state
            .tickets
            .iter()
            .filter(|t| t.status == TicketStatus::Sold && !t.is_bonus && t.owner.is(user_id))
            .count() as u32)
    }

    async fn reserve_tickets(
        &self,
        competition_id: &str,
        user_id: &str,
        numbers: &[u32],
        reserved_until: u64,
        now_ms: u64,
    ) -> TicketResult<usize> {
        let mut inner = self.inner.write();
        let state = inner.state_mut(competition_id)?;
        let mut affected = 0;
        for &n in numbers {
            if let Some(t) = state.ticket_mut(n) {
                if t.is_obtainable_by(user_id, now_ms) {
                    t.status = TicketStatus::Reserved;
                    t.owner = TicketOwner::Owned(user_id.to_string());
                    t.reserved_until = Some(reserved_until);
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn refresh_reservation(
        &self,
        competition_id: &str,
        user_id: &str,
        numbers: &[u32],
        reserved_until: u64,
    ) -> TicketResult<usize> {
        let mut inner = self.inner.write();
        let state = inner.state_mut(competition_id)?;
        let mut affected = 0;
        for &n in numbers {
            if let Some(t) = state.ticket_mut(n) {
                if t.status == TicketStatus::Reserved && t.owner.is(user_id) {
                    t.reserved_until = Some(reserved_until);
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn release_tickets(
        &self,
        competition_id: &str,
        user_id: &str,
        numbers: &[u32],
    ) -> TicketResult<usize> {
        let mut inner = self.inner.write();
        let state = inner.state_mut(competition_id)?;
        let mut affected = 0;
        for &n in numbers {
            if let Some(t) = state.ticket_mut(n) {
                if t.status == TicketStatus::Reserved && t.owner.is(user_id) {
                    t.clear();
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn sell_reserved(
        &self,
        competition_id: &str,
        user_id: &str,
        order_id: &str,
        numbers: &[u32],
    ) -> TicketResult<Vec<u32>> {
        let mut inner = self.inner.write();
        let state = inner.state_mut(competition_id)?;
        let mut sold = Vec::with_capacity(numbers.len());
        for &n in numbers {
            if let Some(t) = state.ticket_mut(n) {
                if t.status == TicketStatus::Reserved && t.owner.is(user_id) {
                    t.status = TicketStatus::Sold;
                    t.reserved_until = None;
                    t.order_id = Some(order_id.to_string());
                    sold.push(n);
                }
            }
        }
        Ok(sold)
    }

    async fn assign_bonus(
        &self,
        competition_id: &str,
        user_id: &str,
        order_id: &str,
        count: u32,
    ) -> TicketResult<Vec<u32>> {
        let mut inner = self.inner.write();
        let state = inner.state_mut(competition_id)?;
        let mut assigned = Vec::with_capacity(count as usize);
        // tickets は番号順に並んでいる
        for t in state
            .tickets
            .iter_mut()
            .filter(|t| t.status == TicketStatus::Available)
            .take(count as usize)
        {
            t.status = TicketStatus::Sold;
            t.owner = TicketOwner::Owned(user_id.to_string());
            t.order_id = Some(order_id.to_string());
            t.is_bonus = true;
            assigned.push(t.ticket_number);
        }
        Ok(assigned)
    }

    async fn grant_free_entry(
        &self,
        competition_id: &str,
        user_id: &str,
        ticket_number: u32,
        now_ms: u64,
    ) -> TicketResult<usize> {
        let mut inner = self.inner.write();
        let state = inner.state_mut(competition_id)?;
        let Some(t) = state.ticket_mut(ticket_number) else {
            return Ok(0);
        };
        let obtainable = t.status == TicketStatus::Available
            || (t.status == TicketStatus::Reserved && !t.is_held_at(now_ms));
        if !obtainable {
            return Ok(0);
        }
        t.clear();
        t.status = TicketStatus::FreeEntry;
        t.owner = TicketOwner::Owned(user_id.to_string());
        Ok(1)
    }

    async fn count_unsold(&self, competition_id: &str) -> TicketResult<u64> {
        let inner = self.inner.read();
        let state = inner.state(competition_id)?;
        Ok(state
            .tickets
            .iter()
            .filter(|t| matches!(t.status, TicketStatus::Available | TicketStatus::Reserved))
            .count() as u64)
    }

    async fn status_counts(&self, competition_id: &str) -> TicketResult<StatusCounts> {
        let inner = self.inner.read();
        let state = inner.state(competition_id)?;
        let mut counts = StatusCounts::default();
        for t in &state.tickets {
            counts.add(t.status);
        }
        Ok(counts)
    }

    async fn mark_sold_out(&self, competition_id: &str) -> TicketResult<usize> {
        let mut inner = self.inner.write();
        let state = inner.state_mut(competition_id)?;
        if state.competition.status != CompetitionStatus::Active {
            return Ok(0);
        }
        state.competition.status = CompetitionStatus::SoldOut;
        Ok(1)
    }

    async fn mark_drawing(&self, competition_id: &str) -> TicketResult<usize> {
        let mut inner = self.inner.write();
        let c = &mut inner.state_mut(competition_id)?.competition;
        let movable = matches!(
            c.status,
            CompetitionStatus::Active | CompetitionStatus::SoldOut
        );
        if !movable || c.actual_draw_at.is_some() {
            return Ok(0);
        }
        c.status = CompetitionStatus::Drawing;
        Ok(1)
    }

    async fn create_order(&self, order: Order) -> TicketResult<()> {
        let mut inner = self.inner.write();
        inner.state(&order.competition_id)?;
        if inner.orders.contains_key(&order.order_id) {
            return Err(TicketError::BadRequest(format!(
                "order {} already exists",
                order.order_id
            )));
        }
        inner.orders.insert(order.order_id.clone(), order);
        Ok(())
    }

    async fn order(&self, order_id: &str) -> TicketResult<Option<Order>> {
        Ok(self.inner.read().orders.get(order_id).cloned())
    }

    async fn transition_order(
        &self,
        order_id: &str,
        from: PaymentStatus,
        to: PaymentStatus,
        now_ms: u64,
    ) -> TicketResult<usize> {
        let mut inner = self.inner.write();
        match inner.orders.get_mut(order_id) {
            Some(order) if order.payment_status == from => {
                order.payment_status = to;
                order.updated_at = now_ms;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn eligible_tickets(&self, competition_id: &str) -> TicketResult<Vec<EligibleTicket>> {
        let inner = self.inner.read();
        let state = inner.state(competition_id)?;
        Ok(state
            .tickets
            .iter()
            .filter(|t| matches!(t.status, TicketStatus::Sold | TicketStatus::FreeEntry))
            .filter_map(|t| {
                t.owner.user_id().map(|user_id| EligibleTicket {
                    ticket_number: t.ticket_number,
                    user_id: user_id.to_string(),
                })
            })
            .collect())
    }

    async fn record_draw(&self, win: &Win) -> TicketResult<bool> {
        let mut inner = self.inner.write();
        let state = inner.state_mut(&win.competition_id)?;
        if state.competition.actual_draw_at.is_some() {
            return Ok(false);
        }
        state.competition.status = CompetitionStatus::Completed;
        state.competition.actual_draw_at = Some(win.drawn_at);
        state.competition.winning_ticket_number = Some(win.ticket_number);
        state.wins.push(win.clone());
        Ok(true)
    }

    async fn record_redraw(&self, previous_ticket: u32, win: &Win) -> TicketResult<bool> {
        let mut inner = self.inner.write();
        let state = inner.state_mut(&win.competition_id)?;
        if state.competition.status != CompetitionStatus::Completed
            || state.competition.winning_ticket_number != Some(previous_ticket)
        {
            return Ok(false);
        }
        state.competition.winning_ticket_number = Some(win.ticket_number);
        state.wins.push(win.clone());
        Ok(true)
    }

    async fn wins(&self, competition_id: &str) -> TicketResult<Vec<Win>> {
        let inner = self.inner.read();
        Ok(inner.state(competition_id)?.wins.clone())
    }

    async fn mark_owner_deleted(&self, user_id: &str) -> TicketResult<usize> {
        let mut inner = self.inner.write();
        let mut affected = 0;
        for state in inner.competitions.values_mut() {
            for t in state.tickets.iter_mut().filter(|t| t.owner.is(user_id)) {
                match t.status {
                    TicketStatus::Reserved => t.clear(),
                    TicketStatus::Sold | TicketStatus::FreeEntry => {
                        t.owner = TicketOwner::OwnerDeleted;
                    }
                    TicketStatus::Available => continue,
                }
                affected += 1;
            }
        }
        Ok(affected)
    }
}
