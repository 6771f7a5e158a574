//! 運用API（観測の入口）:
//! - 役割: 予約/コミット/抽選の件数とレイテンシを取得する。
//! - 内包: health と Prometheus metrics の出力。

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use ticket_core::LatencyHistogram;

use crate::error::TicketError;

use super::AppState;

/// プロセス内カウンタ（再起動でリセット）
#[derive(Default)]
pub struct ServiceMetrics {
    pub reservations_total: AtomicU64,
    pub reservation_conflicts_total: AtomicU64,
    pub insufficient_inventory_total: AtomicU64,
    pub qcm_blocks_total: AtomicU64,
    pub checkout_sessions_total: AtomicU64,
    pub commits_total: AtomicU64,
    pub commit_duplicates_total: AtomicU64,
    pub commit_discrepancies_total: AtomicU64,
    pub draws_total: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub reserve_latency: LatencyHistogram,
    pub commit_latency: LatencyHistogram,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 拒否を理由ごとに数える（予約・チェックアウト共通）
    pub fn record_rejection(&self, err: &TicketError) {
        match err {
            TicketError::ReservationConflict => {
                self.reservation_conflicts_total.fetch_add(1, Ordering::Relaxed);
            }
            TicketError::InsufficientInventory { .. } => {
                self.insufficient_inventory_total.fetch_add(1, Ordering::Relaxed);
            }
            TicketError::RateLimited { .. } => {
                self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_reserve(&self, started: Instant) {
        self.reservations_total.fetch_add(1, Ordering::Relaxed);
        self.reserve_latency.record_since(started);
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct HealthResponse {
    status: &'static str,
    reservations_total: u64,
    commits_total: u64,
    draws_total: u64,
    reserve_p99_micros: u64,
    commit_p99_micros: u64,
}

/// ヘルスチェック（GET /health）
pub(super) async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let m = &state.metrics;
    Json(HealthResponse {
        status: "OK",
        reservations_total: m.reservations_total.load(Ordering::Relaxed),
        commits_total: m.commits_total.load(Ordering::Relaxed),
        draws_total: m.draws_total.load(Ordering::Relaxed),
        reserve_p99_micros: m.reserve_latency.snapshot().p99_micros,
        commit_p99_micros: m.commit_latency.snapshot().p99_micros,
    })
}

/// メトリクス（GET /metrics）
/// - 予約/QCM/コミット/抽選の件数とレイテンシをPrometheus形式で出力
pub(super) async fn handle_metrics(State(state): State<AppState>) -> String {
    let m = &state.metrics;
    let counters: [(&str, &str, &AtomicU64); 10] = [
        (
            "tickets_reservations_total",
            "Reservations created or superseded",
            &m.reservations_total,
        ),
        (
            "tickets_reservation_conflicts_total",
            "Reservations rejected by a lost lock race",
            &m.reservation_conflicts_total,
        ),
        (
            "tickets_insufficient_inventory_total",
            "Reservations rejected for insufficient inventory",
            &m.insufficient_inventory_total,
        ),
        (
            "tickets_qcm_blocks_total",
            "Identifiers blocked after too many wrong answers",
            &m.qcm_blocks_total,
        ),
        (
            "tickets_checkout_sessions_total",
            "Payment sessions opened",
            &m.checkout_sessions_total,
        ),
        (
            "tickets_commits_total",
            "Orders committed after payment success",
            &m.commits_total,
        ),
        (
            "tickets_commit_duplicates_total",
            "Duplicate payment success notifications",
            &m.commit_duplicates_total,
        ),
        (
            "tickets_commit_discrepancies_total",
            "Commits that sold fewer tickets than ordered",
            &m.commit_discrepancies_total,
        ),
        ("tickets_draws_total", "Draws and redraws executed", &m.draws_total),
        (
            "tickets_rate_limited_total",
            "Requests rejected by the rate limiter",
            &m.rate_limited_total,
        ),
    ];

    let mut out = String::new();
    for (name, help, value) in counters {
        out.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
            value.load(Ordering::Relaxed)
        ));
    }
    out.push_str(&m.reserve_latency.snapshot().prometheus("tickets_reserve_latency"));
    out.push_str(&m.commit_latency.snapshot().prometheus("tickets_commit_latency"));
    out
}
