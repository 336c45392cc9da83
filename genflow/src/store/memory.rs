//! In-process handoff backend.
//!
//! Expiry is measured with `tokio::time::Instant`, so tests running on a
//! paused clock can advance past a TTL without sleeping. Expired entries are
//! swept on writes at most once per [`SWEEP_INTERVAL`], and abandoned scan
//! cursors are dropped after [`CURSOR_TTL`].

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use super::{HandoffBackend, ScanPage};
use crate::config::MAX_TTL_SECS;
use crate::errors::StoreError;

/// Minimum spacing between full sweeps of expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How long an unfinished scan cursor stays valid.
pub const CURSOR_TTL: Duration = Duration::from_secs(60);

/// Upper bound on live scan cursors; the oldest is evicted past this.
pub const MAX_CURSORS: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone)]
struct Cursor {
    after: String,
    issued_at: Instant,
}

/// Expiry instant for `ttl`, capped at [`MAX_TTL_SECS`].
fn expiry(now: Instant, ttl: Duration) -> Instant {
    let ttl = ttl.min(Duration::from_secs(MAX_TTL_SECS));
    now.checked_add(ttl).unwrap_or(now)
}

/// Handoff backend backed by a sorted in-memory map.
///
/// Scan cursors remember the last key examined, so deleting keys between
/// pages never causes a later key to be skipped.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: Mutex<BTreeMap<String, Entry>>,
    cursors: Mutex<HashMap<u64, Cursor>>,
    next_cursor: AtomicU64,
    next_sweep: Mutex<Option<Instant>>,
    unavailable: AtomicBool,
    failing_reads: Mutex<Option<Regex>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail, simulating an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes `get` fail for keys matching the glob `pattern`, leaving every
    /// other operation working. `None` clears it.
    pub fn fail_reads_matching(&self, pattern: Option<&str>) -> Result<(), regex::Error> {
        *self.failing_reads.lock() = pattern.map(glob_to_regex).transpose()?;
        Ok(())
    }

    /// Number of live (unexpired) keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    /// Returns true if no live keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes a raw value, bypassing encoding. Useful for simulating corruption.
    pub fn insert_raw(&self, key: &str, value: &str, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        self.sweep_if_due(&mut entries, now);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: expiry(now, ttl),
            },
        );
    }

    fn sweep_if_due(&self, entries: &mut BTreeMap<String, Entry>, now: Instant) {
        let mut next_sweep = self.next_sweep.lock();
        if next_sweep.is_some_and(|at| now < at) {
            return;
        }
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let swept = before - entries.len();
        if swept > 0 {
            tracing::trace!(swept, remaining = entries.len(), "Swept expired handoff entries");
        }
        *next_sweep = Some(expiry(now, SWEEP_INTERVAL));
    }

    fn issue_cursor(&self, after: String, now: Instant) -> u64 {
        let mut cursors = self.cursors.lock();
        cursors.retain(|_, cursor| now.duration_since(cursor.issued_at) < CURSOR_TTL);
        if cursors.len() >= MAX_CURSORS {
            let oldest = cursors
                .iter()
                .min_by_key(|(id, cursor)| (cursor.issued_at, **id))
                .map(|(id, _)| *id);
            if let Some(id) = oldest {
                cursors.remove(&id);
            }
        }
        let id = self.next_cursor.fetch_add(1, Ordering::SeqCst) + 1;
        cursors.insert(id, Cursor { after, issued_at: now });
        id
    }

    fn check_available(&self, operation: &'static str, key: &str) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::backend(operation, key, "backend unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl HandoffBackend for InMemoryBackend {
    async fn ping(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("in-memory backend unavailable".to_string()));
        }
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_available("set", key)?;
        self.insert_raw(key, value, ttl);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available("get", key)?;
        if self
            .failing_reads
            .lock()
            .as_ref()
            .is_some_and(|matcher| matcher.is_match(key))
        {
            return Err(StoreError::backend("get", key, "read failed"));
        }
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(Instant::now()) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available("delete", key)?;
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|entry| !entry.is_expired(now)))
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage, StoreError> {
        self.check_available("scan", pattern)?;
        let matcher = glob_to_regex(pattern)
            .map_err(|e| StoreError::backend("scan", pattern, e))?;

        let now = Instant::now();
        let resume_after = if cursor == 0 {
            None
        } else {
            match self.cursors.lock().remove(&cursor) {
                Some(c) if now.duration_since(c.issued_at) < CURSOR_TTL => Some(c.after),
                _ => return Err(StoreError::backend("scan", pattern, "unknown cursor")),
            }
        };

        let entries = self.entries.lock();
        let lower = match &resume_after {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };

        let mut keys = Vec::new();
        let mut last_examined = None;
        let mut range = entries.range((lower, Bound::Unbounded)).peekable();
        for _ in 0..count.max(1) {
            let Some((key, entry)) = range.next() else {
                break;
            };
            if !entry.is_expired(now) && matcher.is_match(key) {
                keys.push(key.clone());
            }
            last_examined = Some(key.clone());
        }
        let exhausted = range.peek().is_none();
        drop(entries);

        let next = match last_examined {
            Some(key) if !exhausted => self.issue_cursor(key, now),
            _ => 0,
        };

        Ok(ScanPage { cursor: next, keys })
    }
}

/// Compiles a Redis-style glob (`*`, `?`, `[...]`, `\x`) into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if inner == '\\' || inner == '[' {
                        out.push('\\');
                    }
                    out.push(inner);
                }
                out.push(']');
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("pipeline:*:story").unwrap();
        assert!(re.is_match("pipeline:abc:story"));
        assert!(!re.is_match("pipeline:abc:story:extra"));

        let re = glob_to_regex("k?y").unwrap();
        assert!(re.is_match("key"));
        assert!(!re.is_match("keey"));

        let re = glob_to_regex("h[ae]llo").unwrap();
        assert!(re.is_match("hallo"));
        assert!(!re.is_match("hillo"));

        let re = glob_to_regex("a.b\\*").unwrap();
        assert!(re.is_match("a.b*"));
        assert!(!re.is_match("axb*"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let backend = InMemoryBackend::new();
        backend.set_with_ttl("k", "v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_scan_pages_survive_deletes() {
        let backend = InMemoryBackend::new();
        for i in 0..10 {
            backend
                .set_with_ttl(&format!("p:{i}"), "x", Duration::from_secs(60))
                .await
                .unwrap();
        }

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let page = backend.scan(cursor, "p:*", 3).await.unwrap();
            assert!(page.keys.len() <= 3);
            for key in &page.keys {
                assert!(backend.delete(key).await.unwrap());
            }
            seen.extend(page.keys);
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }

        assert_eq!(seen.len(), 10);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let backend = InMemoryBackend::new();
        backend.set_unavailable(true);
        assert!(matches!(backend.ping().await, Err(StoreError::Connection(_))));
        assert!(backend.get("k").await.is_err());
        backend.set_unavailable(false);
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_swept_on_write() {
        let backend = InMemoryBackend::new();
        for i in 0..50 {
            backend
                .set_with_ttl(&format!("old:{i}"), "x", Duration::from_secs(5))
                .await
                .unwrap();
        }
        assert_eq!(backend.entries.lock().len(), 50);

        tokio::time::advance(Duration::from_secs(10)).await;
        backend.set_with_ttl("fresh", "y", Duration::from_secs(5)).await.unwrap();

        assert_eq!(backend.entries.lock().len(), 1);
        assert_eq!(backend.get("fresh").await.unwrap(), Some("y".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_ttl_is_capped() {
        let backend = InMemoryBackend::new();
        backend.set_with_ttl("k", "v", Duration::MAX).await.unwrap();
        backend
            .set_with_ttl("n", "v", Duration::from_secs(u64::MAX))
            .await
            .unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::advance(Duration::from_secs(MAX_TTL_SECS)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert_eq!(backend.get("n").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_cursors_are_bounded() {
        let backend = InMemoryBackend::new();
        for i in 0..4 {
            backend
                .set_with_ttl(&format!("p:{i}"), "x", Duration::from_secs(600))
                .await
                .unwrap();
        }

        let evicted = backend.scan(0, "p:*", 1).await.unwrap().cursor;
        for _ in 0..(MAX_CURSORS + 200) {
            let page = backend.scan(0, "p:*", 1).await.unwrap();
            assert_ne!(page.cursor, 0);
        }
        assert_eq!(backend.cursors.lock().len(), MAX_CURSORS);
        assert!(backend.scan(evicted, "p:*", 1).await.is_err());

        tokio::time::advance(CURSOR_TTL).await;
        let page = backend.scan(0, "p:*", 1).await.unwrap();
        assert_eq!(backend.cursors.lock().len(), 1);
        assert!(backend.scan(page.cursor, "p:*", 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_reads_only_affect_matching_keys() {
        let backend = InMemoryBackend::new();
        backend.set_with_ttl("a:summary:x", "1", Duration::from_secs(60)).await.unwrap();
        backend.set_with_ttl("a:story", "2", Duration::from_secs(60)).await.unwrap();

        backend.fail_reads_matching(Some("*:summary:*")).unwrap();
        assert!(backend.get("a:summary:x").await.is_err());
        assert_eq!(backend.get("a:story").await.unwrap(), Some("2".to_string()));

        backend.fail_reads_matching(None).unwrap();
        assert_eq!(backend.get("a:summary:x").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_cursor_rejected() {
        let backend = InMemoryBackend::new();
        assert!(backend.scan(42, "*", 10).await.is_err());
    }
}
