//! QCM ゲート（スキル問題の回答状態）
//!
//! 状態はすべてキャッシュに置く（複数インスタンスで共有されるため）。
//! 判定ロジックは `ticket_core::QcmPolicy`。
//!
//! ## IP → ユーザーへの引き継ぎ
//! 未ログインで回答して途中でログインしたユーザーのため、`ip:<addr>` に合格フラグがあり
//! userId に無い場合は、最初の認証済みチェックで userId 側へコピーする。
//! 引き継ぎは同じ大会の中だけで、別の大会の合格は使わない。

use std::sync::Arc;

use ticket_core::{AttemptOutcome, BlockStatus, Clock, QcmPolicy};
use tracing::{debug, info, warn};

use crate::cache::{keys, LockStore};
use crate::error::{TicketError, TicketResult};

/// 回答者の識別子
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QcmIdentity {
    User(String),
    Ip(String),
}

impl QcmIdentity {
    pub fn key(&self) -> String {
        match self {
            Self::User(id) => id.clone(),
            Self::Ip(addr) => format!("ip:{}", addr),
        }
    }

    /// ログイン済みならユーザー、そうでなければ IP
    pub fn resolve(user_id: Option<&str>, ip: Option<&str>) -> Option<Self> {
        match (user_id, ip) {
            (Some(user), _) => Some(Self::User(user.to_string())),
            (None, Some(ip)) => Some(Self::Ip(ip.to_string())),
            (None, None) => None,
        }
    }
}

/// 正解判定（前後の空白と大文字小文字を無視）
pub fn answer_matches(expected: &str, given: &str) -> bool {
    expected.trim().to_lowercase() == given.trim().to_lowercase()
}

pub struct QcmGate {
    cache: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    policy: QcmPolicy,
    pass_ttl_ms: u64,
}

impl QcmGate {
    pub fn new(
        cache: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        policy: QcmPolicy,
        pass_ttl_ms: u64,
    ) -> Self {
        Self {
            cache,
            clock,
            policy,
            pass_ttl_ms: pass_ttl_ms.max(1),
        }
    }

    pub fn policy(&self) -> QcmPolicy {
        self.policy
    }

    pub async fn check_blocked(
        &self,
        competition_id: &str,
        identity: &QcmIdentity,
    ) -> TicketResult<BlockStatus> {
        let raw = self
            .cache
            .get(&keys::qcm_blocked(competition_id, &identity.key()))
            .await?;
        let blocked_until = raw.and_then(|v| v.parse::<u64>().ok());
        Ok(BlockStatus::at(blocked_until, self.clock.now_millis()))
    }

    pub async fn has_passed(
        &self,
        competition_id: &str,
        identity: &QcmIdentity,
    ) -> TicketResult<bool> {
        Ok(self
            .cache
            .get(&keys::qcm_passed(competition_id, &identity.key()))
            .await?
            .is_some())
    }

    /// ユーザーと IP の両方を見て合格済みか判定する。
    /// IP 側だけ合格していればユーザー側へ引き継ぐ。
    pub async fn has_passed_for(
        &self,
        competition_id: &str,
        user_id: Option<&str>,
        ip: Option<&str>,
    ) -> TicketResult<bool> {
        let Some(user_id) = user_id else {
            return match ip {
                Some(ip) => {
                    self.has_passed(competition_id, &QcmIdentity::Ip(ip.to_string()))
                        .await
                }
                None => Ok(false),
            };
        };
        let user = QcmIdentity::User(user_id.to_string());
        if self.has_passed(competition_id, &user).await? {
            return Ok(true);
        }
        let Some(ip) = ip else {
            return Ok(false);
        };
        if !self
            .has_passed(competition_id, &QcmIdentity::Ip(ip.to_string()))
            .await?
        {
            return Ok(false);
        }
        self.mark_passed(competition_id, &user).await?;
        info!(
            competition_id = %competition_id,
            user_id = %user_id,
            ip = %ip,
            "qcm pass transferred from ip to user"
        );
        Ok(true)
    }

    async fn mark_passed(&self, competition_id: &str, identity: &QcmIdentity) -> TicketResult<()> {
        let id = identity.key();
        self.cache
            .set(&keys::qcm_passed(competition_id, &id), "1", self.pass_ttl_ms)
            .await?;
        self.cache
            .delete(&keys::qcm_attempts(competition_id, &id))
            .await?;
        Ok(())
    }

    /// 回答を 1 回記録する。ブロック中は `Blocked` エラー。
    pub async fn record_attempt(
        &self,
        competition_id: &str,
        identity: &QcmIdentity,
        correct: bool,
    ) -> TicketResult<AttemptOutcome> {
        // 合格は終端
        if self.has_passed(competition_id, identity).await? {
            return Ok(AttemptOutcome::Passed);
        }
        let status = self.check_blocked(competition_id, identity).await?;
        if status.blocked {
            return Err(TicketError::Blocked {
                remaining_ms: status.remaining_ms,
            });
        }

        if correct {
            self.mark_passed(competition_id, identity).await?;
            debug!(competition_id = %competition_id, identity = %identity.key(), "qcm passed");
            return Ok(AttemptOutcome::Passed);
        }

        let id = identity.key();
        let attempts_key = keys::qcm_attempts(competition_id, &id);
        let attempts = self
            .cache
            .incr(&attempts_key, self.policy.attempt_window_ms)
            .await?;
        let now = self.clock.now_millis();
        let outcome = self
            .policy
            .after_incorrect(attempts.min(u32::MAX as u64) as u32, now);
        if let AttemptOutcome::Blocked { blocked_until } = outcome {
            self.cache
                .set_nx(
                    &keys::qcm_blocked(competition_id, &id),
                    &blocked_until.to_string(),
                    self.policy.lockout_ms.max(1),
                )
                .await?;
            // ロック明けはカウンタを最初から
            self.cache.delete(&attempts_key).await?;
            warn!(
                competition_id = %competition_id,
                identity = %id,
                attempts,
                blocked_until,
                "qcm identifier blocked"
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryLockStore;
    use ticket_core::ManualClock;

    const LOCKOUT: u64 = 15 * 60 * 1000;

    fn gate() -> (Arc<ManualClock>, QcmGate) {
        let clock = Arc::new(ManualClock::new(50_000));
        let cache = Arc::new(MemoryLockStore::new(clock.clone()));
        let gate = QcmGate::new(cache, clock.clone(), QcmPolicy::default(), 86_400_000);
        (clock, gate)
    }

    fn user(id: &str) -> QcmIdentity {
        QcmIdentity::User(id.to_string())
    }

    #[tokio::test]
    async fn lockout_starts_on_the_last_allowed_attempt() {
        let (_, gate) = gate();
        let alice = user("alice");
        for expected_remaining in (1..=4).rev() {
            let outcome = gate.record_attempt("c1", &alice, false).await.unwrap();
            assert_eq!(
                outcome,
                AttemptOutcome::Incorrect {
                    attempts_remaining: expected_remaining
                }
            );
        }
        assert!(!gate.check_blocked("c1", &alice).await.unwrap().blocked);

        let outcome = gate.record_attempt("c1", &alice, false).await.unwrap();
        assert_eq!(
            outcome,
            AttemptOutcome::Blocked {
                blocked_until: 50_000 + LOCKOUT
            }
        );
        let status = gate.check_blocked("c1", &alice).await.unwrap();
        assert!(status.blocked);
        assert_eq!(status.remaining_ms, LOCKOUT);
    }

    #[tokio::test]
    async fn blocked_identifier_cannot_answer_until_lockout_ends() {
        let (clock, gate) = gate();
        let alice = user("alice");
        for _ in 0..5 {
            gate.record_attempt("c1", &alice, false).await.unwrap();
        }
        clock.advance(1_000);
        let err = gate.record_attempt("c1", &alice, true).await.unwrap_err();
        assert!(matches!(err, TicketError::Blocked { remaining_ms } if remaining_ms == LOCKOUT - 1_000));

        clock.advance(LOCKOUT);
        assert!(!gate.check_blocked("c1", &alice).await.unwrap().blocked);
        // カウンタは最初から
        assert_eq!(
            gate.record_attempt("c1", &alice, false).await.unwrap(),
            AttemptOutcome::Incorrect {
                attempts_remaining: 4
            }
        );
    }

    #[tokio::test]
    async fn wrong_answers_outside_the_window_do_not_accumulate() {
        let (clock, gate) = gate();
        let alice = user("alice");
        for _ in 0..4 {
            gate.record_attempt("c1", &alice, false).await.unwrap();
        }
        clock.advance(QcmPolicy::default().attempt_window_ms);

        assert_eq!(
            gate.record_attempt("c1", &alice, false).await.unwrap(),
            AttemptOutcome::Incorrect {
                attempts_remaining: 4
            }
        );
        assert!(!gate.check_blocked("c1", &alice).await.unwrap().blocked);
    }

    #[tokio::test]
    async fn passing_is_terminal() {
        let (_, gate) = gate();
        let alice = user("alice");
        gate.record_attempt("c1", &alice, false).await.unwrap();
        assert_eq!(
            gate.record_attempt("c1", &alice, true).await.unwrap(),
            AttemptOutcome::Passed
        );
        assert!(gate.has_passed("c1", &alice).await.unwrap());
        // 合格後の誤答は記録しない
        assert_eq!(
            gate.record_attempt("c1", &alice, false).await.unwrap(),
            AttemptOutcome::Passed
        );
        assert!(!gate.has_passed("c2", &alice).await.unwrap());
    }

    #[tokio::test]
    async fn ip_pass_moves_to_user_within_same_competition() {
        let (_, gate) = gate();
        let ip = QcmIdentity::Ip("203.0.113.9".into());
        gate.record_attempt("c1", &ip, true).await.unwrap();

        assert!(gate
            .has_passed_for("c1", Some("alice"), Some("203.0.113.9"))
            .await
            .unwrap());
        // 引き継ぎ後はユーザー単独で合格扱い
        assert!(gate.has_passed("c1", &user("alice")).await.unwrap());
        // 別の大会には持ち越さない
        assert!(!gate
            .has_passed_for("c2", Some("alice"), Some("203.0.113.9"))
            .await
            .unwrap());
        assert!(!gate
            .has_passed_for("c1", Some("bob"), Some("198.51.100.1"))
            .await
            .unwrap());
    }

    #[test]
    fn answers_compare_loosely() {
        assert!(answer_matches("Paris", "  paris "));
        assert!(!answer_matches("Paris", "London"));
    }

    #[test]
    fn identity_prefers_user() {
        assert_eq!(
            QcmIdentity::resolve(Some("u1"), Some("1.2.3.4")),
            Some(user("u1"))
        );
        assert_eq!(
            QcmIdentity::resolve(None, Some("1.2.3.4")).map(|i| i.key()),
            Some("ip:1.2.3.4".to_string())
        );
        assert_eq!(QcmIdentity::resolve(None, None), None);
    }
}
