//! Domain records shared by the engines and both storage backends.
//!
//! All timestamps are Unix milliseconds read from the injected clock.

use serde::{Deserialize, Serialize};
use std::fmt;
use ticket_core::BonusTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompetitionStatus {
    Active,
    SoldOut,
    Drawing,
    Completed,
    Cancelled,
}

impl CompetitionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::SoldOut => "SOLD_OUT",
            Self::Drawing => "DRAWING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ACTIVE" => Some(Self::Active),
            "SOLD_OUT" => Some(Self::SoldOut),
            "DRAWING" => Some(Self::Drawing),
            "COMPLETED" => Some(Self::Completed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for CompetitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Competition {
    pub id: String,
    pub title: String,
    pub total_tickets: u32,
    pub max_tickets_per_user: u32,
    /// 単価（最小通貨単位）
    pub unit_price: u64,
    pub status: CompetitionStatus,
    pub draw_at: Option<u64>,
    pub actual_draw_at: Option<u64>,
    pub winning_ticket_number: Option<u32>,
    pub bonus_tiers: Vec<BonusTier>,
    #[serde(skip_serializing)]
    pub qcm_answer: String,
}

/// 管理画面からの登録内容
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCompetition {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub total_tickets: u32,
    pub max_tickets_per_user: u32,
    pub unit_price: u64,
    #[serde(default)]
    pub draw_at: Option<u64>,
    #[serde(default)]
    pub bonus_tiers: Vec<BonusTier>,
    pub qcm_answer: String,
}

impl NewCompetition {
    pub fn into_competition(self, id: String) -> Competition {
        Competition {
            id,
            title: self.title,
            total_tickets: self.total_tickets,
            max_tickets_per_user: self.max_tickets_per_user,
            unit_price: self.unit_price,
            status: CompetitionStatus::Active,
            draw_at: self.draw_at,
            actual_draw_at: None,
            winning_ticket_number: None,
            bonus_tiers: self.bonus_tiers,
            qcm_answer: self.qcm_answer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Available,
    Reserved,
    Sold,
    FreeEntry,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Reserved => "RESERVED",
            Self::Sold => "SOLD",
            Self::FreeEntry => "FREE_ENTRY",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "AVAILABLE" => Some(Self::Available),
            "RESERVED" => Some(Self::Reserved),
            "SOLD" => Some(Self::Sold),
            "FREE_ENTRY" => Some(Self::FreeEntry),
            _ => None,
        }
    }
}

/// チケットの所有者
///
/// 「未割当」と「退会済みユーザーの所有」を区別する。
/// 抽選対象になるのは `Owned` のみ。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ownerStatus", content = "userId", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketOwner {
    Unassigned,
    Owned(String),
    OwnerDeleted,
}

impl TicketOwner {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Owned(id) => Some(id),
            _ => None,
        }
    }

    pub fn is(&self, user_id: &str) -> bool {
        self.user_id() == Some(user_id)
    }

    pub fn status_str(&self) -> &'static str {
        match self {
            Self::Unassigned => "UNASSIGNED",
            Self::Owned(_) => "OWNED",
            Self::OwnerDeleted => "OWNER_DELETED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub competition_id: String,
    pub ticket_number: u32,
    pub status: TicketStatus,
    pub owner: TicketOwner,
    pub reserved_until: Option<u64>,
    pub order_id: Option<String>,
    pub is_bonus: bool,
}

impl Ticket {
    pub fn available(competition_id: &str, ticket_number: u32) -> Self {
        Self {
            competition_id: competition_id.to_string(),
            ticket_number,
            status: TicketStatus::Available,
            owner: TicketOwner::Unassigned,
            reserved_until: None,
            order_id: None,
            is_bonus: false,
        }
    }

    /// 期限内の予約として誰かに押さえられているか
    pub fn is_held_at(&self, now_ms: u64) -> bool {
        self.status == TicketStatus::Reserved && self.reserved_until.is_some_and(|t| t > now_ms)
    }

    /// `user_id` が今この行を予約状態にできるか
    /// (AVAILABLE / 期限切れ RESERVED / 本人の RESERVED)
    pub fn is_obtainable_by(&self, user_id: &str, now_ms: u64) -> bool {
        match self.status {
            TicketStatus::Available => true,
            TicketStatus::Reserved => !self.is_held_at(now_ms) || self.owner.is(user_id),
            TicketStatus::Sold | TicketStatus::FreeEntry => false,
        }
    }

    /// 空き状態へ戻す
    pub fn clear(&mut self) {
        self.status = TicketStatus::Available;
        self.owner = TicketOwner::Unassigned;
        self.reserved_until = None;
        self.order_id = None;
        self.is_bonus = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Refunded => "REFUNDED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(Self::Pending),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            "REFUNDED" => Some(Self::Refunded),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub user_id: String,
    pub competition_id: String,
    pub ticket_numbers: Vec<u32>,
    pub ticket_count: u32,
    pub bonus_ticket_count: u32,
    pub total_amount: u64,
    pub currency: String,
    pub payment_status: PaymentStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Win {
    pub competition_id: String,
    pub user_id: String,
    pub ticket_number: u32,
    pub raw_index: u64,
    pub eligible_count: u64,
    pub method: String,
    pub drawn_at: u64,
}

/// キャッシュ上の予約（期限付き）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub competition_id: String,
    pub user_id: String,
    pub ticket_numbers: Vec<u32>,
    pub reserved_at: u64,
    pub expires_at: u64,
}

impl Reservation {
    pub fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at > now_ms
    }
}

/// ステータス別枚数。合計は常に total_tickets に一致する。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub available: u64,
    pub reserved: u64,
    pub sold: u64,
    pub free_entry: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.available + self.reserved + self.sold + self.free_entry
    }

    pub fn add(&mut self, status: TicketStatus) {
        match status {
            TicketStatus::Available => self.available += 1,
            TicketStatus::Reserved => self.reserved += 1,
            TicketStatus::Sold => self.sold += 1,
            TicketStatus::FreeEntry => self.free_entry += 1,
        }
    }
}
