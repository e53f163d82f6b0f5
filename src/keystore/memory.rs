//! In-memory keystore.
//!
//! Backs tests and embedded runs. Registered scripts are executed natively
//! while the store lock is held, which gives the same unit of isolation the
//! server-side scripted execution gives.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::scripts::{
    ScriptId, CODE_ACTIVITY_NOT_ACTIVE, CODE_INSUFFICIENT_STOCK, CODE_INVALID_PARAMS, CODE_OK,
    CODE_USER_LIMIT_EXCEEDED,
};
use super::Keystore;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(Vec<String>),
    Zset(Vec<(String, f64)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn str(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: Value::Str(value.to_string()),
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
pub struct MemoryKeystore {
    data: Mutex<HashMap<String, Entry>>,
    published: Mutex<Vec<(String, String)>>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent through `publish`, oldest first. Test observability.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        if map.get(key).is_some_and(|e| e.expired()) {
            map.remove(key);
        }
        map.get_mut(key)
    }

    fn get_str(map: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        match Self::live(map, key).map(|e| &e.value) {
            Some(Value::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn get_int(map: &mut HashMap<String, Entry>, key: &str) -> Option<i64> {
        Self::get_str(map, key).and_then(|s| s.parse::<i64>().ok())
    }

    fn set_int(map: &mut HashMap<String, Entry>, key: &str, value: i64) {
        let expires_at = Self::live(map, key).and_then(|e| e.expires_at);
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
    }

    fn incr(map: &mut HashMap<String, Entry>, key: &str, delta: i64) -> i64 {
        let next = Self::get_int(map, key).unwrap_or(0) + delta;
        Self::set_int(map, key, next);
        next
    }

    /// Steps 1-7 of the commit script, executed under the store lock.
    fn run_commit(map: &mut HashMap<String, Entry>, keys: &[String], args: &[String]) -> Vec<i64> {
        let qty = args.first().and_then(|a| a.parse::<i64>().ok());
        let now = args.get(1).and_then(|a| a.parse::<i64>().ok());
        let limit = args.get(2).and_then(|a| a.parse::<i64>().ok());
        let ttl = args.get(3).and_then(|a| a.parse::<u64>().ok());
        let buffer = args
            .get(4)
            .and_then(|a| a.parse::<i64>().ok())
            .unwrap_or(0);
        let (qty, now, limit, ttl) = match (qty, now, limit, ttl) {
            (Some(q), Some(n), Some(l), Some(t)) if q > 0 && l > 0 => (q, n, l, t),
            _ => return vec![CODE_INVALID_PARAMS, -1, -1, -1],
        };

        let raw = match Self::get_str(map, &keys[0]) {
            Some(r) => r,
            None => return vec![CODE_ACTIVITY_NOT_ACTIVE, -1, -1, -1],
        };
        if Self::get_str(map, &keys[1]).as_deref() != Some("active") {
            return vec![CODE_ACTIVITY_NOT_ACTIVE, -1, -1, -1];
        }
        if let Ok(activity) = serde_json::from_str::<serde_json::Value>(&raw) {
            let start = activity["start_time"].as_i64();
            let end = activity["end_time"].as_i64();
            if start.is_some_and(|s| now < s - buffer) || end.is_some_and(|e| now > e) {
                return vec![CODE_ACTIVITY_NOT_ACTIVE, -1, -1, -1];
            }
        }

        let purchased = Self::get_int(map, &keys[3]).unwrap_or(0);
        if purchased + qty > limit {
            return vec![CODE_USER_LIMIT_EXCEEDED, -1, purchased, limit - purchased];
        }

        let stock = Self::get_int(map, &keys[2]).unwrap_or(-1);
        if stock < 0 {
            return vec![CODE_ACTIVITY_NOT_ACTIVE, -1, -1, -1];
        }
        if stock < qty {
            return vec![CODE_INSUFFICIENT_STOCK, stock, purchased, limit - purchased];
        }

        let new_stock = Self::incr(map, &keys[2], -qty);
        let new_purchased = Self::incr(map, &keys[3], qty);
        if let Some(entry) = Self::live(map, &keys[3]) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl));
        }
        Self::incr(map, &keys[4], 1);
        vec![CODE_OK, new_stock, new_purchased, limit - new_purchased]
    }

    /// Reverse of the commit mutation, clamped at the ceiling and at zero.
    fn run_rollback(
        map: &mut HashMap<String, Entry>,
        keys: &[String],
        args: &[String],
    ) -> Vec<i64> {
        let qty = match args.first().and_then(|a| a.parse::<i64>().ok()) {
            Some(q) if q > 0 => q,
            _ => return vec![-1, -1],
        };

        let ceiling = Self::get_str(map, &keys[2])
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .and_then(|a| a["total_stock"].as_i64());

        let stock = Self::get_int(map, &keys[0]).unwrap_or(0);
        let mut new_stock = stock + qty;
        if let Some(c) = ceiling {
            new_stock = new_stock.min(c);
        }
        Self::set_int(map, &keys[0], new_stock);

        let purchased = Self::get_int(map, &keys[1]).unwrap_or(0);
        let new_purchased = (purchased - qty).max(0);
        Self::set_int(map, &keys[1], new_purchased);

        Self::incr(map, &keys[3], 1);
        vec![new_stock, new_purchased]
    }
}

#[async_trait]
impl Keystore for MemoryKeystore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut map = self.data.lock();
        Ok(Self::get_str(&mut map, key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.data
            .lock()
            .insert(key.to_string(), Entry::str(value, None));
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.data
            .lock()
            .insert(key.to_string(), Entry::str(value, Some(ttl)));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut map = self.data.lock();
        if Self::live(&mut map, key).is_some() {
            return Ok(false);
        }
        map.insert(key.to_string(), Entry::str(value, Some(ttl)));
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut map = self.data.lock();
        let existed = Self::live(&mut map, key).is_some();
        map.remove(key);
        Ok(existed)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut map = self.data.lock();
        Ok(Self::incr(&mut map, key, delta))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut map = self.data.lock();
        match Self::live(&mut map, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut map = self.data.lock();
        Ok(Self::live(&mut map, key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut map = self.data.lock();
        if map.get(key).is_some_and(|e| e.expired()) {
            map.remove(key);
        }
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Zset(Vec::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Zset(z) => {
                z.retain(|(m, _)| m != member);
                z.push((member.to_string(), score));
                Ok(())
            }
            _ => bail!("wrong type for ZADD: {}", key),
        }
    }

    async fn zrange_by_score(&self, key: &str, max: f64, limit: usize) -> Result<Vec<String>> {
        let mut map = self.data.lock();
        let mut members: Vec<(String, f64)> = match Self::live(&mut map, key).map(|e| &e.value) {
            Some(Value::Zset(z)) => z.iter().filter(|(_, s)| *s <= max).cloned().collect(),
            _ => Vec::new(),
        };
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(members.into_iter().take(limit).map(|(m, _)| m).collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut map = self.data.lock();
        if let Some(Value::Zset(z)) = Self::live(&mut map, key).map(|e| &mut e.value) {
            let before = z.len();
            z.retain(|(m, _)| m != member);
            return Ok(z.len() < before);
        }
        Ok(false)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut map = self.data.lock();
        match Self::live(&mut map, key).map(|e| &e.value) {
            Some(Value::Zset(z)) => Ok(z.len() as u64),
            _ => Ok(0),
        }
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut map = self.data.lock();
        if map.get(key).is_some_and(|e| e.expired()) {
            map.remove(key);
        }
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(Vec::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(list) => {
                list.push(value.to_string());
                Ok(list.len() as u64)
            }
            _ => bail!("wrong type for RPUSH: {}", key),
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut map = self.data.lock();
        let list = match Self::live(&mut map, key).map(|e| &e.value) {
            Some(Value::List(l)) => l.clone(),
            _ => return Ok(Vec::new()),
        };
        let len = list.len() as i64;
        let norm = |i: i64| -> i64 {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let from = norm(start) as usize;
        let to = (norm(stop) + 1).min(len) as usize;
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(list[from..to].to_vec())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.published
            .lock()
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }

    async fn eval(&self, script: ScriptId, keys: &[String], args: &[String]) -> Result<Vec<i64>> {
        let mut map = self.data.lock();
        match script {
            ScriptId::Commit => {
                if keys.len() < 5 {
                    bail!("commit script expects 5 keys");
                }
                Ok(Self::run_commit(&mut map, keys, args))
            }
            ScriptId::Rollback => {
                if keys.len() < 4 {
                    bail!("rollback script expects 4 keys");
                }
                Ok(Self::run_rollback(&mut map, keys, args))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_string_ops_and_ttl() {
        let ks = MemoryKeystore::new();
        ks.set("k", "v").await.unwrap();
        assert_eq!(ks.get("k").await.unwrap().as_deref(), Some("v"));

        ks.set_ex("t", "1", Duration::from_millis(20)).await.unwrap();
        assert!(ks.ttl("t").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ks.get("t").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_only_first_wins() {
        let ks = MemoryKeystore::new();
        assert!(ks
            .set_nx_ex("lease", "a", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!ks
            .set_nx_ex("lease", "b", Duration::from_secs(5))
            .await
            .unwrap());
        assert_eq!(ks.get("lease").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_zset_ordering_and_limit() {
        let ks = MemoryKeystore::new();
        ks.zadd("z", "c", 3.0).await.unwrap();
        ks.zadd("z", "a", 1.0).await.unwrap();
        ks.zadd("z", "b", 2.0).await.unwrap();

        let due = ks.zrange_by_score("z", 2.5, 10).await.unwrap();
        assert_eq!(due, vec!["a", "b"]);
        assert_eq!(ks.zcard("z").await.unwrap(), 3);
        assert!(ks.zrem("z", "a").await.unwrap());
        assert_eq!(ks.zcard("z").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_list_append_and_range() {
        let ks = MemoryKeystore::new();
        ks.rpush("l", "one").await.unwrap();
        ks.rpush("l", "two").await.unwrap();
        assert_eq!(ks.lrange("l", 0, -1).await.unwrap(), vec!["one", "two"]);
    }
}
