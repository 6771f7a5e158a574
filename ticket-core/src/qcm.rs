//! QCM（スキル問題）の試行ポリシー
//!
//! 状態遷移: `CLEAN → (attempts 1..MAX-1) → BLOCKED`。
//! `PASSED` はブロックされていない任意の状態から到達でき、終端。
//! 保存先（キャッシュ）は扱わず、回数と時刻から判定だけを返す。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QcmPolicy {
    pub max_attempts: u32,
    pub lockout_ms: u64,
    pub attempt_window_ms: u64,
}

impl QcmPolicy {
    pub fn new(max_attempts: u32, lockout_ms: u64, attempt_window_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            lockout_ms,
            attempt_window_ms: attempt_window_ms.max(1),
        }
    }

    /// 不正解が `attempts` 回目になった時の結果
    pub fn after_incorrect(&self, attempts: u32, now_ms: u64) -> AttemptOutcome {
        if attempts >= self.max_attempts {
            AttemptOutcome::Blocked {
                blocked_until: now_ms.saturating_add(self.lockout_ms),
            }
        } else {
            AttemptOutcome::Incorrect {
                attempts_remaining: self.max_attempts - attempts,
            }
        }
    }
}

impl Default for QcmPolicy {
    fn default() -> Self {
        Self::new(5, 15 * 60 * 1000, 15 * 60 * 1000)
    }
}

/// 1 回の回答の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Passed,
    #[serde(rename_all = "camelCase")]
    Incorrect { attempts_remaining: u32 },
    #[serde(rename_all = "camelCase")]
    Blocked { blocked_until: u64 },
}

impl AttemptOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// ブロック状態のスナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStatus {
    pub blocked: bool,
    pub remaining_ms: u64,
}

impl BlockStatus {
    /// `blocked_until` が未来ならブロック中
    pub fn at(blocked_until: Option<u64>, now_ms: u64) -> Self {
        match blocked_until {
            Some(until) if until > now_ms => Self {
                blocked: true,
                remaining_ms: until - now_ms,
            },
            _ => Self {
                blocked: false,
                remaining_ms: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockout_boundary() {
        let policy = QcmPolicy::new(5, 900_000, 900_000);
        assert_eq!(
            policy.after_incorrect(4, 0),
            AttemptOutcome::Incorrect {
                attempts_remaining: 1
            }
        );
        assert_eq!(
            policy.after_incorrect(5, 1_000),
            AttemptOutcome::Blocked {
                blocked_until: 901_000
            }
        );
    }

    #[test]
    fn zero_max_attempts_is_clamped() {
        let policy = QcmPolicy::new(0, 10, 10);
        assert_eq!(policy.max_attempts, 1);
        assert!(policy.after_incorrect(1, 0).is_blocked());
    }

    #[test]
    fn block_status_expires() {
        assert_eq!(
            BlockStatus::at(Some(2_000), 1_500),
            BlockStatus {
                blocked: true,
                remaining_ms: 500
            }
        );
        assert!(!BlockStatus::at(Some(2_000), 2_000).blocked);
        assert!(!BlockStatus::at(None, 0).blocked);
    }
}
