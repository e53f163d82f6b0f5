//! Redis-backed keystore.
//!
//! One multiplexed connection manager shared by every component; scripts are
//! invoked by hash with automatic re-registration on NOSCRIPT.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ExistenceCheck, SetExpiry, SetOptions};
use std::time::Duration;

use super::scripts::{ScriptId, ScriptRegistry};
use super::Keystore;

pub struct RedisKeystore {
    conn: ConnectionManager,
    scripts: ScriptRegistry,
}

impl RedisKeystore {
    /// Connect and register the script set.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("parse keystore url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connect keystore")?;
        Ok(Self {
            conn,
            scripts: ScriptRegistry::new(),
        })
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl Keystore for RedisKeystore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let v: Option<String> = conn.get(key).await.context("keystore GET")?;
        Ok(v)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await.context("keystore SET")?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, value, Self::ttl_secs(ttl))
            .await
            .context("keystore SETEX")?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let opts = SetOptions::default()
            .conditional_set(ExistenceCheck::NX)
            .with_expiration(SetExpiry::EX(Self::ttl_secs(ttl)));
        let v: Option<String> = conn
            .set_options(key, value, opts)
            .await
            .context("keystore SET NX EX")?;
        Ok(v.is_some())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = conn.del(key).await.context("keystore DEL")?;
        Ok(n > 0)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let v: i64 = conn.incr(key, delta).await.context("keystore INCRBY")?;
        Ok(v)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let ok: bool = conn
            .expire(key, Self::ttl_secs(ttl) as i64)
            .await
            .context("keystore EXPIRE")?;
        Ok(ok)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn.clone();
        let secs: i64 = conn.ttl(key).await.context("keystore TTL")?;
        if secs < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_secs(secs as u64)))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zadd(key, member, score)
            .await
            .context("keystore ZADD")?;
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, max: f64, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore_limit(key, "-inf", max, 0, limit as isize)
            .await
            .context("keystore ZRANGEBYSCORE")?;
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = conn.zrem(key, member).await.context("keystore ZREM")?;
        Ok(n > 0)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let n: u64 = conn.zcard(key).await.context("keystore ZCARD")?;
        Ok(n)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let n: u64 = conn.rpush(key, value).await.context("keystore RPUSH")?;
        Ok(n)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = conn
            .lrange(key, start as isize, stop as isize)
            .await
            .context("keystore LRANGE")?;
        Ok(items)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .publish(channel, message)
            .await
            .context("keystore PUBLISH")?;
        Ok(())
    }

    async fn eval(&self, script: ScriptId, keys: &[String], args: &[String]) -> Result<Vec<i64>> {
        let mut conn = self.conn.clone();
        let compiled = self.scripts.get(script);
        let mut invocation = compiled.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }
        let reply: Vec<i64> = invocation
            .invoke_async(&mut conn)
            .await
            .context("keystore EVALSHA")?;
        Ok(reply)
    }
}
