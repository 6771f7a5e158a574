//! Redis 実装
//!
//! 単一キー操作はそのままコマンド、複数キーの原子操作は Lua スクリプト。
//! 期限は Redis 側の PX で管理する。

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use super::LockStore;
use crate::error::TicketResult;

const ACQUIRE_ALL: &str = r#"
for _, key in ipairs(KEYS) do
  local cur = redis.call('GET', key)
  if cur and cur ~= ARGV[1] then
    return 0
  end
end
for _, key in ipairs(KEYS) do
  redis.call('SET', key, ARGV[1], 'PX', ARGV[2])
end
return 1
"#;

const RELEASE_OWNED: &str = r#"
local n = 0
for _, key in ipairs(KEYS) do
  if redis.call('GET', key) == ARGV[1] then
    redis.call('DEL', key)
    n = n + 1
  end
end
return n
"#;

const REFRESH_OWNED: &str = r#"
local n = 0
for _, key in ipairs(KEYS) do
  if redis.call('GET', key) == ARGV[1] then
    redis.call('PEXPIRE', key, ARGV[2])
    n = n + 1
  end
end
return n
"#;

const INCR_WITH_TTL: &str = r#"
local v = redis.call('INCR', KEYS[1])
if v == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return v
"#;

const SCAN_BATCH: usize = 500;

pub struct RedisLockStore {
    conn: ConnectionManager,
    acquire_all: Script,
    release_owned: Script,
    refresh_owned: Script,
    incr_with_ttl: Script,
}

impl RedisLockStore {
    pub async fn connect(url: &str) -> TicketResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            acquire_all: Script::new(ACQUIRE_ALL),
            release_owned: Script::new(RELEASE_OWNED),
            refresh_owned: Script::new(REFRESH_OWNED),
            incr_with_ttl: Script::new(INCR_WITH_TTL),
        })
    }

    async fn invoke_owned(
        &self,
        script: &Script,
        keys: &[String],
        owner: &str,
        ttl_ms: Option<u64>,
    ) -> TicketResult<i64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation.arg(owner);
        if let Some(ttl) = ttl_ms {
            invocation.arg(ttl);
        }
        let result: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(result)
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn get(&self, key: &str) -> TicketResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> TicketResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_ms: u64) -> TicketResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> TicketResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str, ttl_ms: u64) -> TicketResult<u64> {
        let mut conn = self.conn.clone();
        let value: i64 = self
            .incr_with_ttl
            .key(key)
            .arg(ttl_ms.max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(value.max(0) as u64)
    }

    async fn scan_prefix(&self, prefix: &str) -> TicketResult<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut found: Vec<String> = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        if found.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(found.len());
        for chunk in found.chunks(SCAN_BATCH) {
            let values: Vec<Option<String>> =
                redis::cmd("MGET").arg(chunk).query_async(&mut conn).await?;
            // SCAN と MGET の間に消えたキーは飛ばす
            out.extend(
                chunk
                    .iter()
                    .zip(values)
                    .filter_map(|(k, v)| v.map(|v| (k.clone(), v))),
            );
        }
        Ok(out)
    }

    async fn acquire_all(&self, keys: &[String], owner: &str, ttl_ms: u64) -> TicketResult<bool> {
        if keys.is_empty() {
            return Ok(true);
        }
        let acquired = self
            .invoke_owned(&self.acquire_all, keys, owner, Some(ttl_ms.max(1)))
            .await?;
        Ok(acquired == 1)
    }

    async fn release_owned(&self, keys: &[String], owner: &str) -> TicketResult<usize> {
        let n = self
            .invoke_owned(&self.release_owned, keys, owner, None)
            .await?;
        Ok(n.max(0) as usize)
    }

    async fn refresh_owned(
        &self,
        keys: &[String],
        owner: &str,
        ttl_ms: u64,
    ) -> TicketResult<usize> {
        let n = self
            .invoke_owned(&self.refresh_owned, keys, owner, Some(ttl_ms.max(1)))
            .await?;
        Ok(n.max(0) as usize)
    }
}
