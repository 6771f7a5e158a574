//! PostgreSQL-backed ticket store.
//!
//! Every race-sensitive mutation is a single conditional `UPDATE … WHERE <expected
//! prior state>` and reports affected rows. Draw recording runs in one transaction
//! guarded by `SELECT … FOR UPDATE`.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, Pool, Postgres};
use std::collections::HashSet;
use ticket_core::{BonusTier, EligibleTicket};

use super::TicketRepository;
use crate::error::{TicketError, TicketResult};
use crate::model::{Competition, CompetitionStatus, Order, PaymentStatus, StatusCounts, TicketStatus, Win};

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

fn to_db_numbers(numbers: &[u32]) -> Vec<i32> {
    numbers.iter().map(|&n| n as i32).collect()
}

#[derive(FromRow)]
struct CompetitionRow {
    id: String,
    title: String,
    total_tickets: i32,
    max_tickets_per_user: i32,
    unit_price: i64,
    status: String,
    draw_at: Option<i64>,
    actual_draw_at: Option<i64>,
    winning_ticket_number: Option<i32>,
    bonus_tiers: String,
    qcm_answer: String,
}

impl TryFrom<CompetitionRow> for Competition {
    type Error = TicketError;

    fn try_from(row: CompetitionRow) -> TicketResult<Self> {
        let status = CompetitionStatus::parse(&row.status).ok_or_else(|| {
            TicketError::Infrastructure(format!("unknown competition status {}", row.status))
        })?;
        let bonus_tiers: Vec<BonusTier> = serde_json::from_str(&row.bonus_tiers)?;
        Ok(Competition {
            id: row.id,
            title: row.title,
            total_tickets: row.total_tickets as u32,
            max_tickets_per_user: row.max_tickets_per_user as u32,
            unit_price: row.unit_price as u64,
            status,
            draw_at: row.draw_at.map(|v| v as u64),
            actual_draw_at: row.actual_draw_at.map(|v| v as u64),
            winning_ticket_number: row.winning_ticket_number.map(|v| v as u32),
            bonus_tiers,
            qcm_answer: row.qcm_answer,
        })
    }
}

#[derive(FromRow)]
struct OrderRow {
    order_id: String,
    user_id: String,
    competition_id: String,
    ticket_numbers: Vec<i32>,
    ticket_count: i32,
    bonus_ticket_count: i32,
    total_amount: i64,
    currency: String,
    payment_status: String,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<OrderRow> for Order {
    type Error = TicketError;

    fn try_from(row: OrderRow) -> TicketResult<Self> {
        let payment_status = PaymentStatus::parse(&row.payment_status).ok_or_else(|| {
            TicketError::Infrastructure(format!("unknown payment status {}", row.payment_status))
        })?;
        Ok(Order {
            order_id: row.order_id,
            user_id: row.user_id,
            competition_id: row.competition_id,
            ticket_numbers: row.ticket_numbers.into_iter().map(|n| n as u32).collect(),
            ticket_count: row.ticket_count as u32,
            bonus_ticket_count: row.bonus_ticket_count as u32,
            total_amount: row.total_amount as u64,
            currency: row.currency,
            payment_status,
            created_at: row.created_at as u64,
            updated_at: row.updated_at as u64,
        })
    }
}

#[derive(FromRow)]
struct WinRow {
    competition_id: String,
    user_id: String,
    ticket_number: i32,
    raw_index: i64,
    eligible_count: i64,
    method: String,
    drawn_at: i64,
}

impl From<WinRow> for Win {
    fn from(row: WinRow) -> Self {
        Win {
            competition_id: row.competition_id,
            user_id: row.user_id,
            ticket_number: row.ticket_number as u32,
            raw_index: row.raw_index as u64,
            eligible_count: row.eligible_count as u64,
            method: row.method,
            drawn_at: row.drawn_at as u64,
        }
    }
}

pub struct PgTicketStore {
    pool: Pool<Postgres>,
}

impl PgTicketStore {
    pub async fn connect(url: &str, max_connections: u32) -> TicketResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> TicketResult<()> {
        // prepared statement は 1 文ずつ
        for statement in schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn insert_win(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        win: &Win,
    ) -> TicketResult<()> {
        sqlx::query(
            r#"
            INSERT INTO wins (competition_id, user_id, ticket_number, raw_index, eligible_count, method, drawn_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&win.competition_id)
        .bind(&win.user_id)
        .bind(win.ticket_number as i32)
        .bind(win.raw_index as i64)
        .bind(win.eligible_count as i64)
        .bind(&win.method)
        .bind(win.drawn_at as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TicketRepository for PgTicketStore {
    async fn provision(&self, competition: Competition) -> TicketResult<()> {
        let bonus_tiers = serde_json::to_string(&competition.bonus_tiers)?;
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO competitions
                (id, title, total_tickets, max_tickets_per_user, unit_price, status, draw_at, bonus_tiers, qcm_answer)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&competition.id)
        .bind(&competition.title)
        .bind(competition.total_tickets as i32)
        .bind(competition.max_tickets_per_user as i32)
        .bind(competition.unit_price as i64)
        .bind(competition.status.as_str())
        .bind(competition.draw_at.map(|v| v as i64))
        .bind(bonus_tiers)
        .bind(&competition.qcm_answer)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 0 {
            return Err(TicketError::BadRequest(format!(
                "competition {} already exists",
                competition.id
            )));
        }
        sqlx::query(
            "INSERT INTO tickets (competition_id, ticket_number) SELECT $1, generate_series(1, $2)",
        )
        .bind(&competition.id)
        .bind(competition.total_tickets as i32)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn competition(&self, competition_id: &str) -> TicketResult<Option<Competition>> {
        let row = sqlx::query_as::<_, CompetitionRow>("SELECT * FROM competitions WHERE id = $1")
            .bind(competition_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Competition::try_from).transpose()
    }

    async fn unavailable_numbers(
        &self,
        competition_id: &str,
        requester: &str,
        now_ms: u64,
    ) -> TicketResult<HashSet<u32>> {
        let rows: Vec<i32> = sqlx::query_scalar(
            r#"
            SELECT ticket_number FROM tickets
            WHERE competition_id = $1
              AND (status IN ('SOLD', 'FREE_ENTRY')
                   OR (status = 'RESERVED' AND reserved_until > $2 AND user_id IS DISTINCT FROM $3))
            "#,
        )
        .bind(competition_id)
        .bind(now_ms as i64)
        .bind(requester)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|n| n as u32).collect())
    }

    async fn sold_count_for_user(&self, competition_id: &str, user_id: &str) -> TicketResult<u32> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM tickets
            WHERE competition_id = $1 AND user_id = $2 AND owner_status = 'OWNED'
              AND status = 'SOLD' AND NOT is_bonus
            "#,
        )
        .bind(competition_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    async fn reserve_tickets(
        &self,
        competition_id: &str,
        user_id: &str,
        numbers: &[u32],
        reserved_until: u64,
        now_ms: u64,
    ) -> TicketResult<usize> {
        let affected = sqlx::query(
            r#"
            UPDATE tickets
            SET status = 'RESERVED', owner_status = 'OWNED', user_id = $3, reserved_until = $4
            WHERE competition_id = $1 AND ticket_number = ANY($2)
              AND (status = 'AVAILABLE'
                   OR (status = 'RESERVED' AND (reserved_until <= $5 OR user_id = $3)))
            "#,
        )
        .bind(competition_id)
        .bind(to_db_numbers(numbers))
        .bind(user_id)
        .bind(reserved_until as i64)
        .bind(now_ms as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected as usize)
    }

    async fn refresh_reservation(
        &self,
        competition_id: &str,
        user_id: &str,
        numbers: &[u32],
        reserved_until: u64,
    ) -> TicketResult<usize> {
        let affected = sqlx::query(
            r#"
            UPDATE tickets SET reserved_until = $4
            WHERE competition_id = $1 AND ticket_number = ANY($2)
              AND status = 'RESERVED' AND user_id = $3
            "#,
        )
        .bind(competition_id)
        .bind(to_db_numbers(numbers))
        .bind(user_id)
        .bind(reserved_until as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected as usize)
    }

    async fn release_tickets(
        &self,
        competition_id: &str,
        user_id: &str,
        numbers: &[u32],
    ) -> TicketResult<usize> {
        let affected = sqlx::query(
            r#"
            UPDATE tickets
            SET status = 'AVAILABLE', owner_status = 'UNASSIGNED', user_id = NULL,
                reserved_until = NULL, order_id = NULL, is_bonus = FALSE
            WHERE competition_id = $1 AND ticket_number = ANY($2)
              AND status = 'RESERVED' AND user_id = $3
            "#,
        )
        .bind(competition_id)
        .bind(to_db_numbers(numbers))
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected as usize)
    }

    async fn sell_reserved(
        &self,
        competition_id: &str,
        user_id: &str,
        order_id: &str,
        numbers: &[u32],
    ) -> TicketResult<Vec<u32>> {
        let mut sold: Vec<i32> = sqlx::query_scalar(
            r#"
            UPDATE tickets SET status = 'SOLD', reserved_until = NULL, order_id = $4
            WHERE competition_id = $1 AND ticket_number = ANY($2)
              AND status = 'RESERVED' AND user_id = $3
            RETURNING ticket_number
            "#,
        )
        .bind(competition_id)
        .bind(to_db_numbers(numbers))
        .bind(user_id)
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        sold.sort_unstable();
        Ok(sold.into_iter().map(|n| n as u32).collect())
    }

    async fn assign_bonus(
        &self,
        competition_id: &str,
        user_id: &str,
        order_id: &str,
        count: u32,
    ) -> TicketResult<Vec<u32>> {
        // 並行コミットと同じ行を取り合わないよう SKIP LOCKED で候補を確保する
        let mut assigned: Vec<i32> = sqlx::query_scalar(
            r#"
            UPDATE tickets
            SET status = 'SOLD', owner_status = 'OWNED', user_id = $2, order_id = $3, is_bonus = TRUE
            WHERE competition_id = $1 AND status = 'AVAILABLE' AND ticket_number IN (
                SELECT ticket_number FROM tickets
                WHERE competition_id = $1 AND status = 'AVAILABLE'
                ORDER BY ticket_number
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING ticket_number
            "#,
        )
        .bind(competition_id)
        .bind(user_id)
        .bind(order_id)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;
        assigned.sort_unstable();
        Ok(assigned.into_iter().map(|n| n as u32).collect())
    }

    async fn grant_free_entry(
        &self,
        competition_id: &str,
        user_id: &str,
        ticket_number: u32,
        now_ms: u64,
    ) -> TicketResult<usize> {
        let affected = sqlx::query(
            r#"
            UPDATE tickets
            SET status = 'FREE_ENTRY', owner_status = 'OWNED', user_id = $3,
                reserved_until = NULL, order_id = NULL, is_bonus = FALSE
            WHERE competition_id = $1 AND ticket_number = $2
              AND (status = 'AVAILABLE' OR (status = 'RESERVED' AND reserved_until <= $4))
            "#,
        )
        .bind(competition_id)
        .bind(ticket_number as i32)
        .bind(user_id)
        .bind(now_ms as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected as usize)
    }

    async fn count_unsold(&self, competition_id: &str) -> TicketResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tickets WHERE competition_id = $1 AND status IN ('AVAILABLE', 'RESERVED')",
        )
        .bind(competition_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn status_counts(&self, competition_id: &str) -> TicketResult<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM tickets WHERE competition_id = $1 GROUP BY status",
        )
        .bind(competition_id)
        .fetch_all(&self.pool)
        .await?;
        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            let n = n as u64;
            match TicketStatus::parse(&status) {
                Some(TicketStatus::Available) => counts.available += n,
                Some(TicketStatus::Reserved) => counts.reserved += n,
                Some(TicketStatus::Sold) => counts.sold += n,
                Some(TicketStatus::FreeEntry) => counts.free_entry += n,
                None => {
                    return Err(TicketError::Infrastructure(format!(
                        "unknown ticket status {status}"
                    )))
                }
            }
        }
        Ok(counts)
    }

    async fn mark_sold_out(&self, competition_id: &str) -> TicketResult<usize> {
        let affected =
            sqlx::query("UPDATE competitions SET status = 'SOLD_OUT' WHERE id = $1 AND status = 'ACTIVE'")
                .bind(competition_id)
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(affected as usize)
    }

    async fn mark_drawing(&self, competition_id: &str) -> TicketResult<usize> {
        let affected = sqlx::query(
            r#"
            UPDATE competitions SET status = 'DRAWING'
            WHERE id = $1 AND status IN ('ACTIVE', 'SOLD_OUT') AND actual_draw_at IS NULL
            "#,
        )
        .bind(competition_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected as usize)
    }

    async fn create_order(&self, order: Order) -> TicketResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders
                (order_id, user_id, competition_id, ticket_numbers, ticket_count, bonus_ticket_count,
                 total_amount, currency, payment_status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&order.order_id)
        .bind(&order.user_id)
        .bind(&order.competition_id)
        .bind(to_db_numbers(&order.ticket_numbers))
        .bind(order.ticket_count as i32)
        .bind(order.bonus_ticket_count as i32)
        .bind(order.total_amount as i64)
        .bind(&order.currency)
        .bind(order.payment_status.as_str())
        .bind(order.created_at as i64)
        .bind(order.updated_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn order(&self, order_id: &str) -> TicketResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Order::try_from).transpose()
    }

    async fn transition_order(
        &self,
        order_id: &str,
        from: PaymentStatus,
        to: PaymentStatus,
        now_ms: u64,
    ) -> TicketResult<usize> {
        let affected = sqlx::query(
            "UPDATE orders SET payment_status = $3, updated_at = $4 WHERE order_id = $1 AND payment_status = $2",
        )
        .bind(order_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now_ms as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected as usize)
    }

    async fn eligible_tickets(&self, competition_id: &str) -> TicketResult<Vec<EligibleTicket>> {
        let rows: Vec<(i32, String)> = sqlx::query_as(
            r#"
            SELECT ticket_number, user_id FROM tickets
            WHERE competition_id = $1 AND status IN ('SOLD', 'FREE_ENTRY')
              AND owner_status = 'OWNED' AND user_id IS NOT NULL
            ORDER BY ticket_number
            "#,
        )
        .bind(competition_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(n, user_id)| EligibleTicket {
                ticket_number: n as u32,
                user_id,
            })
            .collect())
    }

    async fn record_draw(&self, win: &Win) -> TicketResult<bool> {
        let mut tx = self.pool.begin().await?;
        let guard: Option<Option<i64>> =
            sqlx::query_scalar("SELECT actual_draw_at FROM competitions WHERE id = $1 FOR UPDATE")
                .bind(&win.competition_id)
                .fetch_optional(&mut *tx)
                .await?;
        match guard {
            None => return Err(TicketError::CompetitionNotFound(win.competition_id.clone())),
            // 既に抽選済み: ロールバックして終了
            Some(Some(_)) => return Ok(false),
            Some(None) => {}
        }
        sqlx::query(
            r#"
            UPDATE competitions
            SET status = 'COMPLETED', actual_draw_at = $2, winning_ticket_number = $3
            WHERE id = $1
            "#,
        )
        .bind(&win.competition_id)
        .bind(win.drawn_at as i64)
        .bind(win.ticket_number as i32)
        .execute(&mut *tx)
        .await?;
        Self::insert_win(&mut tx, win).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn record_redraw(&self, previous_ticket: u32, win: &Win) -> TicketResult<bool> {
        let mut tx = self.pool.begin().await?;
        let guard: Option<(String, Option<i32>)> = sqlx::query_as(
            "SELECT status, winning_ticket_number FROM competitions WHERE id = $1 FOR UPDATE",
        )
        .bind(&win.competition_id)
        .fetch_optional(&mut *tx)
        .await?;
        match guard {
            None => return Err(TicketError::CompetitionNotFound(win.competition_id.clone())),
            Some((status, current))
                if status == CompetitionStatus::Completed.as_str()
                    && current == Some(previous_ticket as i32) => {}
            Some(_) => return Ok(false),
        }
        sqlx::query("UPDATE competitions SET winning_ticket_number = $2 WHERE id = $1")
            .bind(&win.competition_id)
            .bind(win.ticket_number as i32)
            .execute(&mut *tx)
            .await?;
        Self::insert_win(&mut tx, win).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn wins(&self, competition_id: &str) -> TicketResult<Vec<Win>> {
        let rows = sqlx::query_as::<_, WinRow>(
            r#"
            SELECT competition_id, user_id, ticket_number, raw_index, eligible_count, method, drawn_at
            FROM wins WHERE competition_id = $1 ORDER BY id
            "#,
        )
        .bind(competition_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Win::from).collect())
    }

    async fn mark_owner_deleted(&self, user_id: &str) -> TicketResult<usize> {
        let mut tx = self.pool.begin().await?;
        let released = sqlx::query(
            r#"
            UPDATE tickets
            SET status = 'AVAILABLE', owner_status = 'UNASSIGNED', user_id = NULL,
                reserved_until = NULL, order_id = NULL, is_bonus = FALSE
            WHERE user_id = $1 AND status = 'RESERVED'
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let orphaned = sqlx::query(
            r#"
            UPDATE tickets SET owner_status = 'OWNER_DELETED', user_id = NULL
            WHERE user_id = $1 AND status IN ('SOLD', 'FREE_ENTRY')
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok((released + orphaned) as usize)
    }
}
