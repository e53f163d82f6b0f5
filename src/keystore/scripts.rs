//! Server-Side Script Registry
//!
//! The fixed set of scripts the engine installs in the keystore. Each script
//! is one unit of isolation; the commit script is the only place stock is
//! decremented and the per-user counter incremented.

use redis::Script;
use std::collections::HashMap;

/// Reply codes shared by the commit script and its Rust mapping.
pub const CODE_OK: i64 = 0;
pub const CODE_ACTIVITY_NOT_ACTIVE: i64 = 1;
pub const CODE_INSUFFICIENT_STOCK: i64 = 2;
pub const CODE_USER_LIMIT_EXCEEDED: i64 = 3;
pub const CODE_INVALID_PARAMS: i64 = 4;

/// Atomic commit.
///
/// KEYS: activity:{id}, status:{id}, stock:{id}, userlimit:{uid}:{aid}, stockver:{id}
/// ARGV: qty, now_millis, per_user_limit, userlimit_ttl_secs, start_buffer_ms
/// Reply: {code, new_stock, user_purchased, remaining_quota}
///
/// Every precondition is re-checked here: the cheap validator pre-check can
/// race with a concurrent admission, the script cannot. The start boundary
/// uses the same skew buffer as the validator, so a request admitted at
/// `start_time - buffer` cannot bounce off the script.
pub const COMMIT_SCRIPT: &str = r#"
local qty = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local buffer = tonumber(ARGV[5]) or 0
if not qty or qty <= 0 or not limit or limit <= 0 then
    return {4, -1, -1, -1}
end
local raw = redis.call('GET', KEYS[1])
if not raw then
    return {1, -1, -1, -1}
end
local status = redis.call('GET', KEYS[2])
if status ~= 'active' then
    return {1, -1, -1, -1}
end
local activity = cjson.decode(raw)
if activity.start_time and now < tonumber(activity.start_time) - buffer then
    return {1, -1, -1, -1}
end
if activity.end_time and now > tonumber(activity.end_time) then
    return {1, -1, -1, -1}
end
local purchased = tonumber(redis.call('GET', KEYS[4]) or '0')
if purchased + qty > limit then
    return {3, -1, purchased, limit - purchased}
end
local stock = tonumber(redis.call('GET', KEYS[3]) or '-1')
if stock < 0 then
    return {1, -1, -1, -1}
end
if stock < qty then
    return {2, stock, purchased, limit - purchased}
end
local new_stock = redis.call('DECRBY', KEYS[3], qty)
local new_purchased = redis.call('INCRBY', KEYS[4], qty)
redis.call('EXPIRE', KEYS[4], ttl)
redis.call('INCR', KEYS[5])
return {0, new_stock, new_purchased, limit - new_purchased}
"#;

/// Compensating rollback.
///
/// KEYS: stock:{id}, userlimit:{uid}:{aid}, activity:{id}, stockver:{id}
/// ARGV: qty
/// Reply: {new_stock, new_purchased}
///
/// Stock is clamped at the activity's total_stock ceiling, the user counter
/// at zero, so a duplicate rollback cannot push either out of range.
pub const ROLLBACK_SCRIPT: &str = r#"
local qty = tonumber(ARGV[1])
if not qty or qty <= 0 then
    return {-1, -1}
end
local ceiling = nil
local raw = redis.call('GET', KEYS[3])
if raw then
    local activity = cjson.decode(raw)
    ceiling = tonumber(activity.total_stock)
end
local stock = tonumber(redis.call('GET', KEYS[1]) or '0')
local new_stock = stock + qty
if ceiling and new_stock > ceiling then
    new_stock = ceiling
end
redis.call('SET', KEYS[1], new_stock)
local purchased = tonumber(redis.call('GET', KEYS[2]) or '0')
local new_purchased = purchased - qty
if new_purchased < 0 then
    new_purchased = 0
end
redis.call('SET', KEYS[2], new_purchased)
redis.call('INCR', KEYS[4])
return {new_stock, new_purchased}
"#;

/// Names for the registered scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptId {
    Commit,
    Rollback,
}

impl ScriptId {
    pub fn source(&self) -> &'static str {
        match self {
            ScriptId::Commit => COMMIT_SCRIPT,
            ScriptId::Rollback => ROLLBACK_SCRIPT,
        }
    }

    pub fn all() -> [ScriptId; 2] {
        [ScriptId::Commit, ScriptId::Rollback]
    }
}

/// Holds the compiled scripts with their content hashes.
///
/// `redis::Script` computes the SHA at construction and invokes by hash,
/// falling back to the source on a NOSCRIPT reply, which is exactly the
/// re-register-and-retry contract the engine needs.
pub struct ScriptRegistry {
    scripts: HashMap<ScriptId, Script>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        let mut scripts = HashMap::new();
        for id in ScriptId::all() {
            scripts.insert(id, Script::new(id.source()));
        }
        Self { scripts }
    }

    pub fn get(&self, id: ScriptId) -> &Script {
        // The registry is constructed with every variant present.
        &self.scripts[&id]
    }
}

impl Default for ScriptRegistry {
    fn default() -> Self {
        Self::new()
    }
}
