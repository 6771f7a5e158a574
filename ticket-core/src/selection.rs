//! チケット番号の選択
//!
//! ## 流れ
//! 1. 使用不可集合（売約済み・他人の予約中・キャッシュロック中）を受け取る
//! 2. `{1..total} \ unavailable` を作る
//! 3. 部分 Fisher–Yates（swap-to-end-and-pop）で `count` 個を一様に抜き出す
//!
//! 低い番号に偏らないこと、O(count) で終わることが要件。

use rand::Rng;
use std::collections::HashSet;

/// 番号指定の検証エラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    Empty,
    OutOfRange { ticket_number: u32, total: u32 },
    Duplicate { ticket_number: u32 },
}

impl std::fmt::Display for SelectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "no ticket numbers supplied"),
            Self::OutOfRange {
                ticket_number,
                total,
            } => write!(f, "ticket {} outside 1..={}", ticket_number, total),
            Self::Duplicate { ticket_number } => {
                write!(f, "ticket {} requested more than once", ticket_number)
            }
        }
    }
}

/// 取得可能な番号を昇順で返す
pub fn available_numbers(total: u32, unavailable: &HashSet<u32>) -> Vec<u32> {
    (1..=total).filter(|n| !unavailable.contains(n)).collect()
}

/// `pool` から重複なしで `count` 個を一様に選ぶ。
/// 足りない場合は `None`。結果は昇順。
pub fn sample_distinct<R: Rng + ?Sized>(
    mut pool: Vec<u32>,
    count: usize,
    rng: &mut R,
) -> Option<Vec<u32>> {
    if count > pool.len() {
        return None;
    }
    let mut picked = Vec::with_capacity(count);
    for _ in 0..count {
        // 選んだ要素を末尾と入れ替えて pop する
        let idx = rng.gen_range(0..pool.len());
        picked.push(pool.swap_remove(idx));
    }
    picked.sort_unstable();
    Some(picked)
}

/// クライアント指定の番号を検証して昇順に揃える
pub fn normalize_selection(total: u32, numbers: &[u32]) -> Result<Vec<u32>, SelectionError> {
    if numbers.is_empty() {
        return Err(SelectionError::Empty);
    }
    let mut seen = HashSet::with_capacity(numbers.len());
    for &n in numbers {
        if n == 0 || n > total {
            return Err(SelectionError::OutOfRange {
                ticket_number: n,
                total,
            });
        }
        if !seen.insert(n) {
            return Err(SelectionError::Duplicate { ticket_number: n });
        }
    }
    let mut out = numbers.to_vec();
    out.sort_unstable();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn available_excludes_unavailable() {
        let unavailable: HashSet<u32> = [2, 4, 9].into_iter().collect();
        assert_eq!(available_numbers(10, &unavailable), vec![1, 3, 5, 6, 7, 8, 10]);
    }

    #[test]
    fn sample_is_distinct_and_from_pool() {
        let mut rng = StdRng::seed_from_u64(7);
        let pool = vec![3, 5, 8, 13, 21, 34];
        let picked = sample_distinct(pool.clone(), 4, &mut rng).unwrap();
        assert_eq!(picked.len(), 4);
        let unique: HashSet<_> = picked.iter().copied().collect();
        assert_eq!(unique.len(), 4);
        assert!(picked.iter().all(|n| pool.contains(n)));
        assert!(picked.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn sample_rejects_oversized_request() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(sample_distinct(vec![1, 2, 3], 4, &mut rng).is_none());
        assert_eq!(sample_distinct(vec![1, 2, 3], 3, &mut rng), Some(vec![1, 2, 3]));
    }

    #[test]
    fn sample_does_not_favor_low_numbers() {
        // 100 番中 1 個を選ぶ試行で、前半と後半がほぼ同数になること
        let mut rng = StdRng::seed_from_u64(42);
        let pool: Vec<u32> = (1..=100).collect();
        let mut low = 0u32;
        let trials = 20_000;
        for _ in 0..trials {
            let picked = sample_distinct(pool.clone(), 1, &mut rng).unwrap();
            if picked[0] <= 50 {
                low += 1;
            }
        }
        let ratio = low as f64 / trials as f64;
        assert!((0.47..0.53).contains(&ratio), "low ratio {}", ratio);
    }

    #[test]
    fn normalize_rejects_bad_input() {
        assert_eq!(normalize_selection(10, &[]), Err(SelectionError::Empty));
        assert_eq!(
            normalize_selection(10, &[0]),
            Err(SelectionError::OutOfRange {
                ticket_number: 0,
                total: 10
            })
        );
        assert_eq!(
            normalize_selection(10, &[11]),
            Err(SelectionError::OutOfRange {
                ticket_number: 11,
                total: 10
            })
        );
        assert_eq!(
            normalize_selection(10, &[4, 4]),
            Err(SelectionError::Duplicate { ticket_number: 4 })
        );
        assert_eq!(normalize_selection(10, &[9, 2, 5]), Ok(vec![2, 5, 9]));
    }
}
