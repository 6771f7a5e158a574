//! 抽選（当選チケットの決定）
//!
//! ## 要件
//! - 乱数源は CSPRNG に限定する（`CryptoRng` 境界で型として強制）
//! - 候補リストはチケット番号順に並べ、同じデータなら同じ並びになる
//! - 生の乱数インデックスと方式IDを監査用に返す
//!
//! 候補リストの SHA-256 ダイジェストも返すので、後から同じ候補集合で
//! インデックス → 当選番号を再計算できる。

use rand::rngs::OsRng;
use rand::{CryptoRng, Rng, RngCore};
use sha2::{Digest, Sha256};

/// 監査ログに記録する抽選方式ID
pub const DRAW_METHOD: &str = "os-csprng-uniform-v1";

/// 抽選対象チケット（SOLD / FREE_ENTRY で所有者あり）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibleTicket {
    pub ticket_number: u32,
    pub user_id: String,
}

/// 抽選結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawSelection {
    pub raw_index: usize,
    pub ticket_number: u32,
    pub user_id: String,
    pub eligible_count: usize,
    pub eligible_digest: String,
    pub method: &'static str,
}

/// 候補をチケット番号順に整列し、番号重複を除く
pub fn prepare_eligible(mut tickets: Vec<EligibleTicket>) -> Vec<EligibleTicket> {
    tickets.sort_by_key(|t| t.ticket_number);
    tickets.dedup_by_key(|t| t.ticket_number);
    tickets
}

/// 整列済み候補のダイジェスト（hex）
pub fn eligible_digest(tickets: &[EligibleTicket]) -> String {
    let mut hasher = Sha256::new();
    for t in tickets {
        hasher.update(t.ticket_number.to_be_bytes());
        hasher.update(t.user_id.as_bytes());
        hasher.update(b"\n");
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// `[0, len)` の一様乱数で 1 枚選ぶ。候補が空なら `None`。
pub fn select_winner<R>(tickets: &[EligibleTicket], rng: &mut R) -> Option<DrawSelection>
where
    R: RngCore + CryptoRng + ?Sized,
{
    if tickets.is_empty() {
        return None;
    }
    let raw_index = rng.gen_range(0..tickets.len());
    let winner = &tickets[raw_index];
    Some(DrawSelection {
        raw_index,
        ticket_number: winner.ticket_number,
        user_id: winner.user_id.clone(),
        eligible_count: tickets.len(),
        eligible_digest: eligible_digest(tickets),
        method: DRAW_METHOD,
    })
}

/// OS の CSPRNG で抽選する（本番経路）
pub fn draw_with_os_rng(tickets: &[EligibleTicket]) -> Option<DrawSelection> {
    select_winner(tickets, &mut OsRng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tickets(n: u32) -> Vec<EligibleTicket> {
        (1..=n)
            .map(|i| EligibleTicket {
                ticket_number: i,
                user_id: format!("user_{}", i % 3),
            })
            .collect()
    }

    #[test]
    fn empty_pool_has_no_winner() {
        assert!(draw_with_os_rng(&[]).is_none());
    }

    #[test]
    fn prepare_sorts_and_dedups() {
        let raw = vec![
            EligibleTicket {
                ticket_number: 9,
                user_id: "a".into(),
            },
            EligibleTicket {
                ticket_number: 2,
                user_id: "b".into(),
            },
            EligibleTicket {
                ticket_number: 9,
                user_id: "a".into(),
            },
        ];
        let prepared = prepare_eligible(raw);
        let numbers: Vec<u32> = prepared.iter().map(|t| t.ticket_number).collect();
        assert_eq!(numbers, vec![2, 9]);
    }

    #[test]
    fn selection_is_reproducible_from_index() {
        let pool = tickets(50);
        let selection = draw_with_os_rng(&pool).unwrap();
        assert_eq!(selection.eligible_count, 50);
        assert_eq!(selection.method, DRAW_METHOD);
        assert_eq!(pool[selection.raw_index].ticket_number, selection.ticket_number);
        assert_eq!(selection.eligible_digest, eligible_digest(&pool));
        assert_eq!(selection.eligible_digest.len(), 64);
    }

    #[test]
    fn digest_depends_on_owners() {
        let a = tickets(5);
        let mut b = tickets(5);
        b[0].user_id = "someone_else".into();
        assert_ne!(eligible_digest(&a), eligible_digest(&b));
    }

    #[test]
    fn winner_frequency_is_uniform() {
        // χ² 検定: k=10, 自由度 9。p=0.001 の臨界値は 27.88。
        let k = 10usize;
        let trials = 50_000usize;
        let pool = tickets(k as u32);
        let mut rng = StdRng::seed_from_u64(20240611);
        let mut counts = vec![0u64; k];
        for _ in 0..trials {
            let s = select_winner(&pool, &mut rng).unwrap();
            counts[s.raw_index] += 1;
        }
        let expected = trials as f64 / k as f64;
        let chi2: f64 = counts
            .iter()
            .map(|&c| {
                let d = c as f64 - expected;
                d * d / expected
            })
            .sum();
        assert!(chi2 < 27.88, "chi2 {} counts {:?}", chi2, counts);
    }
}
