//! エラー分類
//!
//! 予約/コミット/抽選の全経路で共通の型付きエラー。
//! 競合系（`ReservationConflict` など）はエンジン内部で部分状態を巻き戻した上で返す。
//! `Infrastructure` はキャッシュ/DB の通信失敗で、呼び出し側の再試行が安全。

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use ticket_core::SelectionError;

use crate::model::{CompetitionStatus, PaymentStatus};

pub type TicketResult<T> = Result<T, TicketError>;

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("competition {0} not found")]
    CompetitionNotFound(String),

    #[error("competition {id} is {status}")]
    CompetitionNotActive {
        id: String,
        status: CompetitionStatus,
    },

    #[error("quantity {requested} outside 1..={max}")]
    InvalidQuantity { requested: u32, max: u32 },

    #[error("per-user limit exceeded (holding {held}, requested {requested}, max {max})")]
    UserLimitExceeded { held: u32, requested: u32, max: u32 },

    #[error("only {available} tickets available, {requested} requested")]
    InsufficientInventory { requested: u32, available: u32 },

    #[error("ticket selection lost a race, retry with a fresh selection")]
    ReservationConflict,

    #[error("no active reservation")]
    NoActiveReservation,

    #[error("invalid ticket numbers: {0}")]
    InvalidTicketNumbers(String),

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("order {order_id} is already {status}")]
    OrderTerminal {
        order_id: String,
        status: PaymentStatus,
    },

    #[error("skill question has not been passed")]
    QcmNotPassed,

    #[error("blocked for another {remaining_ms} ms")]
    Blocked { remaining_ms: u64 },

    #[error("draw already executed")]
    DrawAlreadyExecuted,

    #[error("not eligible for draw: {0}")]
    NotEligibleForDraw(String),

    #[error("rate limited, retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("payment provider error: {0}")]
    PaymentProvider(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl TicketError {
    /// クライアント向けの安定コード
    pub fn code(&self) -> &'static str {
        match self {
            Self::CompetitionNotFound(_) => "COMPETITION_NOT_FOUND",
            Self::CompetitionNotActive { .. } => "COMPETITION_NOT_ACTIVE",
            Self::InvalidQuantity { .. } => "INVALID_QUANTITY",
            Self::UserLimitExceeded { .. } => "USER_LIMIT_EXCEEDED",
            Self::InsufficientInventory { .. } => "INSUFFICIENT_INVENTORY",
            Self::ReservationConflict => "RESERVATION_CONFLICT",
            Self::NoActiveReservation => "NO_ACTIVE_RESERVATION",
            Self::InvalidTicketNumbers(_) => "INVALID_TICKET_NUMBERS",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::OrderTerminal { .. } => "ORDER_TERMINAL",
            Self::QcmNotPassed => "QCM_NOT_PASSED",
            Self::Blocked { .. } => "BLOCKED",
            Self::DrawAlreadyExecuted => "DRAW_ALREADY_EXECUTED",
            Self::NotEligibleForDraw(_) => "NOT_ELIGIBLE_FOR_DRAW",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::PaymentProvider(_) => "PAYMENT_PROVIDER_ERROR",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::Infrastructure(_) => "INFRASTRUCTURE_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::CompetitionNotFound(_) | Self::OrderNotFound(_) | Self::NoActiveReservation => {
                StatusCode::NOT_FOUND
            }
            Self::InvalidQuantity { .. }
            | Self::InvalidTicketNumbers(_)
            | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::CompetitionNotActive { .. }
            | Self::UserLimitExceeded { .. }
            | Self::InsufficientInventory { .. }
            | Self::ReservationConflict
            | Self::OrderTerminal { .. }
            | Self::DrawAlreadyExecuted => StatusCode::CONFLICT,
            Self::QcmNotPassed => StatusCode::FORBIDDEN,
            Self::NotEligibleForDraw(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Blocked { .. } | Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::PaymentProvider(_) => StatusCode::BAD_GATEWAY,
            Self::Unauthorized | Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            Self::Infrastructure(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// 呼び出し側がそのまま再試行してよいか
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ReservationConflict | Self::Infrastructure(_) | Self::RateLimited { .. }
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_ms: Option<u64>,
}

impl IntoResponse for TicketError {
    fn into_response(self) -> Response {
        let remaining_ms = match &self {
            Self::Blocked { remaining_ms } => Some(*remaining_ms),
            Self::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        };
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            remaining_ms,
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<SelectionError> for TicketError {
    fn from(err: SelectionError) -> Self {
        Self::InvalidTicketNumbers(err.to_string())
    }
}

impl From<serde_json::Error> for TicketError {
    fn from(err: serde_json::Error) -> Self {
        Self::Infrastructure(format!("cache payload: {err}"))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for TicketError {
    fn from(err: redis::RedisError) -> Self {
        Self::Infrastructure(format!("redis: {err}"))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for TicketError {
    fn from(err: sqlx::Error) -> Self {
        Self::Infrastructure(format!("postgres: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_family_maps_to_409() {
        assert_eq!(
            TicketError::ReservationConflict.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            TicketError::InsufficientInventory {
                requested: 8,
                available: 7
            }
            .status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn blocked_carries_remaining_time() {
        let resp = TicketError::Blocked {
            remaining_ms: 1_500,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn only_races_and_transport_are_retryable() {
        assert!(TicketError::ReservationConflict.is_retryable());
        assert!(TicketError::Infrastructure("timeout".into()).is_retryable());
        assert!(!TicketError::DrawAlreadyExecuted.is_retryable());
        assert!(!TicketError::NotEligibleForDraw("x".into()).is_retryable());
    }

    #[test]
    fn selection_error_converts() {
        let err: TicketError = SelectionError::Duplicate { ticket_number: 3 }.into();
        assert_eq!(err.code(), "INVALID_TICKET_NUMBERS");
    }
}
