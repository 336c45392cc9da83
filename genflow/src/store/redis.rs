//! Redis handoff backend.
//!
//! Values are stored as plain strings with `SET key value EX ttl`, so the
//! write and its expiry land in a single command. Pattern iteration uses
//! `SCAN ... MATCH ... COUNT`, never `KEYS`.

use ::redis::aio::MultiplexedConnection;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use std::time::Duration;

use super::{HandoffBackend, ScanPage};
use crate::config::MAX_TTL_SECS;
use crate::errors::StoreError;

/// Redis-backed handoff store.
///
/// Holds a [`MultiplexedConnection`]; every operation clones it, and all
/// clones share one TCP connection.
#[derive(Debug, Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    key_prefix: Option<String>,
}

impl RedisBackend {
    /// Connects to Redis at `url` (`redis://[:<password>@]<host>:<port>[/<db>]`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the client cannot be created or
    /// the connection cannot be established.
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(url)
            .map_err(|e| StoreError::Connection(format!("invalid Redis url: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(format!("failed to connect to Redis: {e}")))?;
        Ok(Self {
            conn,
            key_prefix: None,
        })
    }

    /// Wraps an existing connection.
    #[must_use]
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: None,
        }
    }

    /// Namespaces every key under `{prefix}:`.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    fn full_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key.to_string(),
        }
    }

    fn strip_prefix(&self, key: String) -> String {
        match &self.key_prefix {
            Some(prefix) => key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                .map_or_else(|| key.clone(), str::to_string),
            None => key,
        }
    }
}

#[async_trait]
impl HandoffBackend for RedisBackend {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Connection(format!("Redis PING failed: {e}")))?;
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // EX rejects 0; a sub-second TTL still expires at the next second.
        let seconds = ttl.as_secs().clamp(1, MAX_TTL_SECS);
        let _: () = conn
            .set_ex(self.full_key(key), value, seconds)
            .await
            .map_err(|e| StoreError::backend("set", key, e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(self.full_key(key))
            .await
            .map_err(|e| StoreError::backend("get", key, e))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .del(self.full_key(key))
            .await
            .map_err(|e| StoreError::backend("delete", key, e))?;
        Ok(removed > 0)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage, StoreError> {
        let mut conn = self.conn.clone();
        let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(self.full_key(pattern))
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::backend("scan", pattern, e))?;

        Ok(ScanPage {
            cursor: next,
            keys: keys.into_iter().map(|k| self.strip_prefix(k)).collect(),
        })
    }
}
