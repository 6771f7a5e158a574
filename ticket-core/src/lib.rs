//! Ticket Core - prize competition inventory algorithms
//!
//! Pure, I/O-free building blocks used by the gateway:
//! - Available-set computation and partial Fisher–Yates sampling (selection.rs)
//! - Tiered bonus ticket schedule (bonus.rs)
//! - QCM attempt / lockout policy (qcm.rs)
//! - CSPRNG winner selection with audit digest (draw.rs)
//! - Injectable clock (clock.rs) and latency histograms (metrics.rs)

pub mod bonus;
pub mod clock;
pub mod draw;
pub mod metrics;
pub mod qcm;
pub mod selection;

pub use bonus::{bonus_tickets, BonusTier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use draw::{
    draw_with_os_rng, eligible_digest, prepare_eligible, select_winner, DrawSelection,
    EligibleTicket, DRAW_METHOD,
};
pub use metrics::{LatencyHistogram, LatencyStats};
pub use qcm::{AttemptOutcome, BlockStatus, QcmPolicy};
pub use selection::{available_numbers, normalize_selection, sample_distinct, SelectionError};

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn test_select_then_draw() {
        let mut rng = StdRng::seed_from_u64(3);

        // 10 枚中 3 枚が他ユーザーに押さえられている
        let unavailable: HashSet<u32> = [1, 5, 7].into_iter().collect();
        let pool = available_numbers(10, &unavailable);
        assert_eq!(pool.len(), 7);

        let picked = sample_distinct(pool, 4, &mut rng).unwrap();
        assert!(picked.iter().all(|n| !unavailable.contains(n)));

        let eligible = prepare_eligible(
            picked
                .iter()
                .map(|&n| EligibleTicket {
                    ticket_number: n,
                    user_id: "user_a".into(),
                })
                .collect(),
        );
        let selection = select_winner(&eligible, &mut rng).unwrap();
        assert!(picked.contains(&selection.ticket_number));
        assert_eq!(selection.user_id, "user_a");
    }

    #[test]
    fn test_bonus_on_large_basket() {
        let tiers = [
            BonusTier {
                min_tickets: 50,
                bonus_percent: 20,
            },
            BonusTier {
                min_tickets: 20,
                bonus_percent: 10,
            },
        ];
        assert_eq!(bonus_tickets(100, &tiers), 20);
        assert_eq!(bonus_tickets(49, &tiers), 4);
    }
}
