//! キャッシュ層（チケットロック / 予約 / QCM / レート制限）
//!
//! 番号単位の排他は「キャッシュのロック取得が最初に成功した者が勝つ」。
//! 複数キーの取得は all-or-nothing で、部分的に取れた状態は他者から観測されない。
//!
//! 期限は読み出し時に評価する（lazy expiry）。メモリ実装は注入された `Clock` を見る。
//!
//! ## キー配置
//! - `ticket_lock:{competition}:{n}` → 所有者 userId
//! - `reservation:{competition}:{user}` → Reservation(JSON)
//! - `qcm:{attempts|blocked|passed}:{competition}:{identifier}`
//! - `ratelimit:{scope}:{key}:{window}`
//!
//! `{competition}` は Redis Cluster のハッシュタグで、同一大会のキーは同じスロットに載る。

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use ticket_core::Clock;

use crate::error::TicketResult;

#[async_trait]
pub trait LockStore: Send + Sync {
    async fn get(&self, key: &str) -> TicketResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> TicketResult<()>;

    /// キーが無い（または期限切れ）時だけ書く
    async fn set_nx(&self, key: &str, value: &str, ttl_ms: u64) -> TicketResult<bool>;

    async fn delete(&self, key: &str) -> TicketResult<bool>;

    /// 加算後の値を返す。新規作成時のみ TTL を付ける。
    async fn incr(&self, key: &str, ttl_ms: u64) -> TicketResult<u64>;

    /// prefix に一致する生存キーと値
    async fn scan_prefix(&self, prefix: &str) -> TicketResult<Vec<(String, String)>>;

    /// 全キーを `owner` で取得する。1 つでも他者が保持していれば何も書かずに false。
    /// 自分が既に保持しているキーは TTL が更新される。
    async fn acquire_all(&self, keys: &[String], owner: &str, ttl_ms: u64) -> TicketResult<bool>;

    /// 値が `owner` のキーだけ削除し、削除数を返す
    async fn release_owned(&self, keys: &[String], owner: &str) -> TicketResult<usize>;

    /// 値が `owner` のキーだけ TTL を更新し、更新数を返す
    async fn refresh_owned(&self, keys: &[String], owner: &str, ttl_ms: u64)
        -> TicketResult<usize>;
}

pub mod keys {
    pub fn ticket_lock(competition_id: &str, ticket_number: u32) -> String {
        format!("ticket_lock:{{{}}}:{}", competition_id, ticket_number)
    }

    pub fn ticket_lock_prefix(competition_id: &str) -> String {
        format!("ticket_lock:{{{}}}:", competition_id)
    }

    pub fn ticket_locks(competition_id: &str, numbers: &[u32]) -> Vec<String> {
        numbers
            .iter()
            .map(|&n| ticket_lock(competition_id, n))
            .collect()
    }

    /// `ticket_lock:{c}:17` → 17
    pub fn lock_ticket_number(key: &str) -> Option<u32> {
        key.rsplit(':').next()?.parse().ok()
    }

    pub fn reservation(competition_id: &str, user_id: &str) -> String {
        format!("reservation:{{{}}}:{}", competition_id, user_id)
    }

    pub fn qcm_attempts(competition_id: &str, identifier: &str) -> String {
        format!("qcm:attempts:{{{}}}:{}", competition_id, identifier)
    }

    pub fn qcm_blocked(competition_id: &str, identifier: &str) -> String {
        format!("qcm:blocked:{{{}}}:{}", competition_id, identifier)
    }

    pub fn qcm_passed(competition_id: &str, identifier: &str) -> String {
        format!("qcm:passed:{{{}}}:{}", competition_id, identifier)
    }

    pub fn rate_limit(scope: &str, key: &str, window: u64) -> String {
        format!("ratelimit:{}:{}:{}", scope, key, window)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: u64,
}

impl CacheEntry {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at > now_ms
    }
}

/// 単一プロセス用のロックストア
///
/// 全操作を 1 つの mutex 下で行うので、複数キー操作も原子的。
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryLockStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// 生存キー数（期限切れは数えない）
    pub fn live_len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    fn live_value<'a>(
        entries: &'a HashMap<String, CacheEntry>,
        key: &str,
        now: u64,
    ) -> Option<&'a str> {
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.as_str())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn get(&self, key: &str) -> TicketResult<Option<String>> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.is_live(now) => Ok(Some(e.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> TicketResult<()> {
        let expires_at = self.clock.now_millis().saturating_add(ttl_ms);
        self.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_ms: u64) -> TicketResult<bool> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        if Self::live_value(&entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: now.saturating_add(ttl_ms),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> TicketResult<bool> {
        let now = self.clock.now_millis();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|e| e.is_live(now)))
    }

    async fn incr(&self, key: &str, ttl_ms: u64) -> TicketResult<u64> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        let next = match entries.get_mut(key) {
            Some(e) if e.is_live(now) => {
                let next = e.value.parse::<u64>().unwrap_or(0) + 1;
                e.value = next.to_string();
                next
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    CacheEntry {
                        value: "1".into(),
                        expires_at: now.saturating_add(ttl_ms),
                    },
                );
                1
            }
        };
        Ok(next)
    }

    async fn scan_prefix(&self, prefix: &str) -> TicketResult<Vec<(String, String)>> {
        let now = self.clock.now_millis();
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn acquire_all(&self, keys: &[String], owner: &str, ttl_ms: u64) -> TicketResult<bool> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        let contested = keys
            .iter()
            .any(|k| Self::live_value(&entries, k, now).is_some_and(|v| v != owner));
        if contested {
            return Ok(false);
        }
        let expires_at = now.saturating_add(ttl_ms);
        for key in keys {
            entries.insert(
                key.clone(),
                CacheEntry {
                    value: owner.to_string(),
                    expires_at,
                },
            );
        }
        Ok(true)
    }

    async fn release_owned(&self, keys: &[String], owner: &str) -> TicketResult<usize> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        let mut released = 0;
        for key in keys {
            if Self::live_value(&entries, key, now) == Some(owner) {
                entries.remove(key);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn refresh_owned(
        &self,
        keys: &[String],
        owner: &str,
        ttl_ms: u64,
    ) -> TicketResult<usize> {
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(ttl_ms);
        let mut entries = self.entries.lock();
        let mut refreshed = 0;
        for key in keys {
            if let Some(e) = entries.get_mut(key) {
                if e.is_live(now) && e.value == owner {
                    e.expires_at = expires_at;
                    refreshed += 1;
                }
            }
        }
        Ok(refreshed)
    }
}
