//! Key-value surface backing the full-text index and the rate limiter.
//!
//! The trait exposes the handful of Redis primitives the index needs plus a
//! pipelined batch so every index mutation and every scoring read happens in
//! a single round trip. Values are strings only; integers travel as decimal
//! strings. `RedisIndexStore` adapts a real Redis; `MemoryIndexStore` keeps
//! the whole keyspace behind a process-local lock for tests and for running
//! without a Redis URL configured.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error::ServiceError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("kv i/o error: {0}")]
    Io(String),
    #[error("unexpected kv reply: {0}")]
    UnexpectedReply(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// One command inside a pipelined batch.
#[derive(Debug, Clone)]
pub enum PipeCmd {
    Get(String),
    Set(String, String),
    /// SET key value EX ttl NX: first write within the window wins.
    SetNxEx(String, String, u64),
    Incr(String),
    Decr(String),
    SetAdd(String, String),
    SetRemove(String, String),
    SetCard(String),
    Del(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipeReply {
    Nil,
    Ok,
    Value(String),
    Int(i64),
}

impl PipeReply {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PipeReply::Int(n) => Some(*n),
            PipeReply::Value(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PipeReply::Value(s) => Some(s),
            _ => None,
        }
    }
}

pub trait IndexStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn incr(&self, key: &str) -> Result<i64, StoreError>;
    fn decr(&self, key: &str) -> Result<i64, StoreError>;
    fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;
    fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;
    fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
    fn set_card(&self, key: &str) -> Result<i64, StoreError>;
    /// Key enumeration; only literal prefixes with a trailing `*` are used.
    fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
    fn delete(&self, keys: &[String]) -> Result<(), StoreError>;
    fn pipeline(&self, cmds: &[PipeCmd]) -> Result<Vec<PipeReply>, StoreError>;
}

/// Counts a hit against `{prefix}rate:{endpoint}` and rejects once the
/// window's budget is spent. The TTL-bounded first write and the increment
/// run atomically in one pipeline.
pub fn check_rate_limit(
    store: &dyn IndexStore,
    prefix: &str,
    endpoint: &str,
    max_count: i64,
    window_secs: u64,
) -> Result<(), ServiceError> {
    let key = format!("{prefix}rate:{endpoint}");
    let replies = store.pipeline(&[
        PipeCmd::SetNxEx(key.clone(), "0".to_string(), window_secs),
        PipeCmd::Incr(key),
    ])?;
    let count = replies.get(1).and_then(PipeReply::as_int).unwrap_or(0);
    if count > max_count {
        return Err(ServiceError::RateLimited);
    }
    Ok(())
}

// ─── Redis adapter ───

pub struct RedisIndexStore {
    conn: Mutex<redis::Connection>,
}

impl RedisIndexStore {
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection()?;
        Ok(RedisIndexStore { conn: Mutex::new(conn) })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, StoreError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Io("redis connection lock poisoned".to_string()))?;
        Ok(f(&mut conn)?)
    }
}

fn reply_from_value(value: redis::Value) -> PipeReply {
    match value {
        redis::Value::Nil => PipeReply::Nil,
        redis::Value::Okay => PipeReply::Ok,
        redis::Value::Int(n) => PipeReply::Int(n),
        redis::Value::Data(bytes) => PipeReply::Value(String::from_utf8_lossy(&bytes).into_owned()),
        redis::Value::Status(s) => PipeReply::Value(s),
        redis::Value::Bulk(_) => PipeReply::Nil,
    }
}

impl IndexStore for RedisIndexStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| redis::cmd("GET").arg(key).query(conn))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| redis::cmd("SET").arg(key).arg(value).query(conn))
    }

    fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.with_conn(|conn| redis::cmd("INCR").arg(key).query(conn))
    }

    fn decr(&self, key: &str) -> Result<i64, StoreError> {
        self.with_conn(|conn| redis::cmd("DECR").arg(key).query(conn))
    }

    fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| redis::cmd("SADD").arg(key).arg(member).query(conn))
    }

    fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| redis::cmd("SREM").arg(key).arg(member).query(conn))
    }

    fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| redis::cmd("SMEMBERS").arg(key).query(conn))
    }

    fn set_card(&self, key: &str) -> Result<i64, StoreError> {
        self.with_conn(|conn| redis::cmd("SCARD").arg(key).query(conn))
    }

    fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| redis::cmd("KEYS").arg(pattern).query(conn))
    }

    fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let mut cmd = redis::cmd("DEL");
            for key in keys {
                cmd.arg(key);
            }
            cmd.query(conn)
        })
    }

    fn pipeline(&self, cmds: &[PipeCmd]) -> Result<Vec<PipeReply>, StoreError> {
        let mut pipe = redis::pipe();
        for cmd in cmds {
            match cmd {
                PipeCmd::Get(key) => {
                    pipe.cmd("GET").arg(key);
                }
                PipeCmd::Set(key, value) => {
                    pipe.cmd("SET").arg(key).arg(value);
                }
                PipeCmd::SetNxEx(key, value, ttl) => {
                    pipe.cmd("SET").arg(key).arg(value).arg("EX").arg(*ttl).arg("NX");
                }
                PipeCmd::Incr(key) => {
                    pipe.cmd("INCR").arg(key);
                }
                PipeCmd::Decr(key) => {
                    pipe.cmd("DECR").arg(key);
                }
                PipeCmd::SetAdd(key, member) => {
                    pipe.cmd("SADD").arg(key).arg(member);
                }
                PipeCmd::SetRemove(key, member) => {
                    pipe.cmd("SREM").arg(key).arg(member);
                }
                PipeCmd::SetCard(key) => {
                    pipe.cmd("SCARD").arg(key);
                }
                PipeCmd::Del(keys) => {
                    let mut del = redis::cmd("DEL");
                    for key in keys {
                        del.arg(key);
                    }
                    pipe.add_command(del);
                }
            }
        }
        let values: Vec<redis::Value> = self.with_conn(|conn| pipe.query(conn))?;
        Ok(values.into_iter().map(reply_from_value).collect())
    }
}

// ─── In-memory adapter ───

#[derive(Debug, Clone)]
enum Entry {
    Str {
        value: String,
        expires_at: Option<Instant>,
    },
    Set(BTreeSet<String>),
}

#[derive(Default)]
pub struct MemoryIndexStore {
    data: Mutex<HashMap<String, Entry>>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        MemoryIndexStore::default()
    }

    fn locked<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| StoreError::Io("memory store lock poisoned".to_string()))?;
        f(&mut data)
    }
}

fn expired(entry: &Entry) -> bool {
    match entry {
        Entry::Str { expires_at: Some(at), .. } => *at <= Instant::now(),
        _ => false,
    }
}

fn string_entry<'a>(
    data: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<Option<&'a mut String>, StoreError> {
    if data.get(key).is_some_and(expired) {
        data.remove(key);
    }
    match data.get_mut(key) {
        None => Ok(None),
        Some(Entry::Str { value, .. }) => Ok(Some(value)),
        Some(Entry::Set(_)) => Err(StoreError::UnexpectedReply(format!(
            "key {key} holds a set, not a string"
        ))),
    }
}

fn add_to_counter(
    data: &mut HashMap<String, Entry>,
    key: &str,
    delta: i64,
) -> Result<i64, StoreError> {
    let current = match string_entry(data, key)? {
        Some(value) => value
            .parse::<i64>()
            .map_err(|_| StoreError::UnexpectedReply(format!("key {key} is not an integer")))?,
        None => 0,
    };
    let next = current + delta;
    match data.entry(key.to_string()).or_insert(Entry::Str {
        value: String::new(),
        expires_at: None,
    }) {
        Entry::Str { value, .. } => *value = next.to_string(),
        Entry::Set(_) => unreachable!("checked by string_entry"),
    }
    Ok(next)
}

fn set_entry<'a>(data: &'a mut HashMap<String, Entry>, key: &str) -> &'a mut BTreeSet<String> {
    match data
        .entry(key.to_string())
        .or_insert_with(|| Entry::Set(BTreeSet::new()))
    {
        Entry::Set(members) => members,
        // A string here would be WRONGTYPE in Redis; replace it.
        entry => {
            *entry = Entry::Set(BTreeSet::new());
            match entry {
                Entry::Set(members) => members,
                _ => unreachable!(),
            }
        }
    }
}

fn apply(data: &mut HashMap<String, Entry>, cmd: &PipeCmd) -> Result<PipeReply, StoreError> {
    match cmd {
        PipeCmd::Get(key) => Ok(match string_entry(data, key)? {
            Some(value) => PipeReply::Value(value.clone()),
            None => PipeReply::Nil,
        }),
        PipeCmd::Set(key, value) => {
            data.insert(
                key.clone(),
                Entry::Str { value: value.clone(), expires_at: None },
            );
            Ok(PipeReply::Ok)
        }
        PipeCmd::SetNxEx(key, value, ttl) => {
            if string_entry(data, key)?.is_some() {
                return Ok(PipeReply::Nil);
            }
            data.insert(
                key.clone(),
                Entry::Str {
                    value: value.clone(),
                    expires_at: Some(Instant::now() + Duration::from_secs(*ttl)),
                },
            );
            Ok(PipeReply::Ok)
        }
        PipeCmd::Incr(key) => Ok(PipeReply::Int(add_to_counter(data, key, 1)?)),
        PipeCmd::Decr(key) => Ok(PipeReply::Int(add_to_counter(data, key, -1)?)),
        PipeCmd::SetAdd(key, member) => {
            let added = set_entry(data, key).insert(member.clone());
            Ok(PipeReply::Int(added as i64))
        }
        PipeCmd::SetRemove(key, member) => {
            let removed = match data.get_mut(key) {
                Some(Entry::Set(members)) => members.remove(member),
                _ => false,
            };
            Ok(PipeReply::Int(removed as i64))
        }
        PipeCmd::SetCard(key) => Ok(PipeReply::Int(match data.get(key) {
            Some(Entry::Set(members)) => members.len() as i64,
            _ => 0,
        })),
        PipeCmd::Del(keys) => {
            let mut removed = 0;
            for key in keys {
                if data.remove(key).is_some() {
                    removed += 1;
                }
            }
            Ok(PipeReply::Int(removed))
        }
    }
}

impl IndexStore for MemoryIndexStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.locked(|data| Ok(string_entry(data, key)?.map(|v| v.clone())))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.locked(|data| {
            apply(data, &PipeCmd::Set(key.to_string(), value.to_string())).map(|_| ())
        })
    }

    fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.locked(|data| add_to_counter(data, key, 1))
    }

    fn decr(&self, key: &str) -> Result<i64, StoreError> {
        self.locked(|data| add_to_counter(data, key, -1))
    }

    fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.locked(|data| {
            set_entry(data, key).insert(member.to_string());
            Ok(())
        })
    }

    fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.locked(|data| {
            apply(data, &PipeCmd::SetRemove(key.to_string(), member.to_string())).map(|_| ())
        })
    }

    fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.locked(|data| {
            Ok(match data.get(key) {
                Some(Entry::Set(members)) => members.iter().cloned().collect(),
                _ => Vec::new(),
            })
        })
    }

    fn set_card(&self, key: &str) -> Result<i64, StoreError> {
        self.locked(|data| {
            Ok(match data.get(key) {
                Some(Entry::Set(members)) => members.len() as i64,
                _ => 0,
            })
        })
    }

    fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.locked(|data| {
            Ok(match pattern.strip_suffix('*') {
                Some(prefix) => data
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect(),
                None => data.keys().filter(|k| *k == pattern).cloned().collect(),
            })
        })
    }

    fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        self.locked(|data| {
            for key in keys {
                data.remove(key);
            }
            Ok(())
        })
    }

    /// The lock is held for the whole batch, so the pipeline is atomic from
    /// any other client's view.
    fn pipeline(&self, cmds: &[PipeCmd]) -> Result<Vec<PipeReply>, StoreError> {
        self.locked(|data| cmds.iter().map(|cmd| apply(data, cmd)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_decrement() {
        let store = MemoryIndexStore::new();
        assert_eq!(store.incr("n").unwrap(), 1);
        assert_eq!(store.incr("n").unwrap(), 2);
        assert_eq!(store.decr("n").unwrap(), 1);
        assert_eq!(store.get("n").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn set_operations() {
        let store = MemoryIndexStore::new();
        store.set_add("s", "1").unwrap();
        store.set_add("s", "2").unwrap();
        store.set_add("s", "2").unwrap();
        assert_eq!(store.set_card("s").unwrap(), 2);
        assert_eq!(store.set_members("s").unwrap(), vec!["1", "2"]);
        store.set_remove("s", "1").unwrap();
        assert_eq!(store.set_members("s").unwrap(), vec!["2"]);
    }

    #[test]
    fn keys_matches_literal_prefix() {
        let store = MemoryIndexStore::new();
        store.set("idx:doc:1:tokens", "{}").unwrap();
        store.set("idx:doc:count", "1").unwrap();
        store.set("other", "x").unwrap();
        let mut keys = store.keys("idx:doc:*").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["idx:doc:1:tokens", "idx:doc:count"]);
    }

    #[test]
    fn pipeline_returns_positional_replies() {
        let store = MemoryIndexStore::new();
        let replies = store
            .pipeline(&[
                PipeCmd::Set("k".to_string(), "v".to_string()),
                PipeCmd::Get("k".to_string()),
                PipeCmd::Incr("c".to_string()),
                PipeCmd::Get("missing".to_string()),
            ])
            .unwrap();
        assert_eq!(replies[0], PipeReply::Ok);
        assert_eq!(replies[1], PipeReply::Value("v".to_string()));
        assert_eq!(replies[2], PipeReply::Int(1));
        assert_eq!(replies[3], PipeReply::Nil);
    }

    #[test]
    fn set_nx_only_writes_once() {
        let store = MemoryIndexStore::new();
        let first = store
            .pipeline(&[PipeCmd::SetNxEx("k".to_string(), "0".to_string(), 60)])
            .unwrap();
        let second = store
            .pipeline(&[PipeCmd::SetNxEx("k".to_string(), "9".to_string(), 60)])
            .unwrap();
        assert_eq!(first[0], PipeReply::Ok);
        assert_eq!(second[0], PipeReply::Nil);
        assert_eq!(store.get("k").unwrap().as_deref(), Some("0"));
    }

    #[test]
    fn expired_keys_read_as_missing() {
        let store = MemoryIndexStore::new();
        store
            .pipeline(&[PipeCmd::SetNxEx("k".to_string(), "0".to_string(), 0)])
            .unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn rate_limit_rejects_above_threshold() {
        let store = MemoryIndexStore::new();
        for _ in 0..3 {
            assert!(check_rate_limit(&store, "t:", "login", 3, 60).is_ok());
        }
        assert!(matches!(
            check_rate_limit(&store, "t:", "login", 3, 60),
            Err(ServiceError::RateLimited)
        ));
    }
}
