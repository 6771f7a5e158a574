//! Bonus ticket schedule.
//!
//! Tiers are `minTickets -> bonusPercent`. The highest qualifying tier wins and
//! the bonus count is floor-divided.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BonusTier {
    pub min_tickets: u32,
    pub bonus_percent: u32,
}

pub fn bonus_tickets(quantity: u32, tiers: &[BonusTier]) -> u32 {
    tiers
        .iter()
        .filter(|tier| quantity >= tier.min_tickets)
        .max_by_key(|tier| tier.min_tickets)
        .map(|tier| (quantity as u64 * tier.bonus_percent as u64 / 100) as u32)
        .unwrap_or(0)
}
