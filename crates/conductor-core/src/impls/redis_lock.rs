//! RedisDispatchLock - `SET NX PX` によるリース
//!
//! 解放は「自分が持っている時だけ DEL」を Lua で atomic に行います。

use async_trait::async_trait;
use redis::{Script, aio::ConnectionManager};
use std::time::Duration;

use crate::error::Result;
use crate::ports::{DispatchLock, lease_millis};

const RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Clone)]
pub struct RedisDispatchLock {
    conn: ConnectionManager,
    key: String,
}

impl RedisDispatchLock {
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            key: format!("{key_prefix}:dispatch-lock"),
        })
    }
}

#[async_trait]
impl DispatchLock for RedisDispatchLock {
    async fn try_acquire(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let px = lease_millis(ttl)?;
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(px)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, owner: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(RELEASE)
            .key(&self.key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
