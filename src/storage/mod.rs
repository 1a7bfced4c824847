//! Keyspace storage: named databases over tries, plus the expiration index.
//!
//! Every database and the expiration index live behind one lock (the store
//! lock); handlers and the sweeper take it for the whole of each operation,
//! so prefix scans never observe half-applied mutations.

mod expire;
mod trie;

pub use expire::{ExpireIndex, ExpireRecord};
pub use trie::{Entry, PrefixIter, Trie, NO_TTL};

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Seconds since the UNIX epoch
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Name of the database every session starts on
pub const DEFAULT_DB: &str = "db0";

/// Result of a point increment/decrement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericOutcome {
    Updated,
    Missing,
    NotNumeric,
}

/// A named keyspace
#[derive(Debug)]
pub struct Database {
    pub name: String,
    trie: Trie,
}

impl Database {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            trie: Trie::new(),
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    dbs: HashMap<String, Database>,
    expiring: ExpireIndex,
}

impl StoreInner {
    fn db_mut(&mut self, name: &str) -> &mut Database {
        self.dbs
            .entry(name.to_string())
            .or_insert_with(|| Database::new(name))
    }

    fn evict(&mut self, db: &str, key: &[u8]) {
        if let Some(database) = self.dbs.get_mut(db) {
            database.trie.remove(key);
        }
        self.expiring.cancel(db, key);
    }
}

/// The process-wide database registry and expiration index, guarded by the
/// store lock. Cloning handles is done by wrapping in `Arc` at the caller.
#[derive(Debug)]
pub struct Store {
    inner: Mutex<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let mut inner = StoreInner::default();
        inner.dbs.insert(DEFAULT_DB.into(), Database::new(DEFAULT_DB));
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Insert or replace `key`. A non-negative TTL registers (or refreshes)
    /// the expiration record; a negative one clears it.
    pub fn insert(&self, db: &str, key: &[u8], value: Bytes, ttl: i32) {
        let now = unix_now();
        let mut inner = self.inner.lock();
        inner.db_mut(db).trie.insert(key, value, ttl, now);
        if ttl >= 0 {
            inner.expiring.register(db, key, now + i64::from(ttl));
        } else {
            inner.expiring.cancel(db, key);
        }
    }

    /// Replace value and TTL on every entry under `prefix`.
    /// Returns the number of entries touched.
    pub fn prefix_set(&self, db: &str, prefix: &[u8], value: Bytes, ttl: i32) -> usize {
        let now = unix_now();
        let mut inner = self.inner.lock();

        let mut touched = Vec::new();
        inner.db_mut(db).trie.for_each_mut(prefix, |key, entry| {
            entry.data = value.clone();
            entry.ttl = ttl;
            entry.ctime = now;
            entry.latime = now;
            touched.push(Bytes::copy_from_slice(key));
        });

        for key in &touched {
            if ttl >= 0 {
                inner.expiring.register(db, key, now + i64::from(ttl));
            } else {
                inner.expiring.cancel(db, key);
            }
        }
        touched.len()
    }

    /// Point lookup. Expired entries are evicted on the spot and reported as
    /// a miss; a hit refreshes the last-access timestamp.
    pub fn get(&self, db: &str, key: &[u8]) -> Option<Entry> {
        let now = unix_now();
        let mut inner = self.inner.lock();

        let expired = inner.dbs.get(db)?.trie.get(key)?.is_expired(now);
        if expired {
            inner.evict(db, key);
            debug!(key = %String::from_utf8_lossy(key), "expired on access");
            return None;
        }

        let entry = inner.dbs.get_mut(db)?.trie.get_mut(key)?;
        entry.latime = now;
        Some(entry.clone())
    }

    /// Subtree read: every live `(key, entry)` under `prefix` in scan order.
    /// Entries found expired are evicted before the result is returned.
    pub fn prefix_get(&self, db: &str, prefix: &[u8]) -> Vec<(Bytes, Entry)> {
        let now = unix_now();
        let mut inner = self.inner.lock();

        let Some(database) = inner.dbs.get(db) else {
            return Vec::new();
        };

        let mut live = Vec::new();
        let mut dead = Vec::new();
        for (key, entry) in database.trie.scan(prefix) {
            if entry.is_expired(now) {
                dead.push(key);
            } else {
                live.push((key, entry.clone()));
            }
        }

        for key in dead {
            inner.evict(db, &key);
        }
        for (key, _) in &live {
            if let Some(entry) = inner.db_mut(db).trie.get_mut(key) {
                entry.latime = now;
            }
        }
        live
    }

    pub fn remove(&self, db: &str, key: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner
            .dbs
            .get_mut(db)
            .is_some_and(|database| database.trie.remove(key));
        if removed {
            inner.expiring.cancel(db, key);
        }
        removed
    }

    /// Remove the whole subtree under `prefix`; returns the number of keys
    /// removed.
    pub fn prefix_remove(&self, db: &str, prefix: &[u8]) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner
            .dbs
            .get_mut(db)
            .map_or(0, |database| database.trie.prefix_remove(prefix));
        if removed > 0 {
            inner.expiring.cancel_prefix(db, prefix);
        }
        removed
    }

    /// Assign a TTL to an existing key. False when the key is absent.
    pub fn set_ttl(&self, db: &str, key: &[u8], ttl: i32) -> bool {
        let now = unix_now();
        let mut inner = self.inner.lock();

        let Some(entry) = inner.dbs.get_mut(db).and_then(|d| d.trie.get_mut(key)) else {
            return false;
        };
        entry.ttl = ttl;
        entry.ctime = now;
        entry.latime = now;

        if ttl >= 0 {
            inner.expiring.register(db, key, now + i64::from(ttl));
        } else {
            inner.expiring.cancel(db, key);
        }
        true
    }

    /// Assign a TTL to every entry under `prefix`; returns the number touched.
    pub fn prefix_ttl(&self, db: &str, prefix: &[u8], ttl: i32) -> usize {
        let now = unix_now();
        let mut inner = self.inner.lock();

        let mut touched = Vec::new();
        inner.db_mut(db).trie.for_each_mut(prefix, |key, entry| {
            entry.ttl = ttl;
            entry.ctime = now;
            entry.latime = now;
            touched.push(Bytes::copy_from_slice(key));
        });

        for key in &touched {
            if ttl >= 0 {
                inner.expiring.register(db, key, now + i64::from(ttl));
            } else {
                inner.expiring.cancel(db, key);
            }
        }
        touched.len()
    }

    /// Add `delta` to the decimal integer stored at `key`
    pub fn incr(&self, db: &str, key: &[u8], delta: i64) -> NumericOutcome {
        let now = unix_now();
        let mut inner = self.inner.lock();

        let expired = match inner.dbs.get(db).and_then(|d| d.trie.get(key)) {
            Some(entry) => entry.is_expired(now),
            None => return NumericOutcome::Missing,
        };
        if expired {
            inner.evict(db, key);
            return NumericOutcome::Missing;
        }

        let Some(entry) = inner.dbs.get_mut(db).and_then(|d| d.trie.get_mut(key)) else {
            return NumericOutcome::Missing;
        };
        match trie::numeric_update(&entry.data, delta) {
            Some(data) => {
                entry.data = data;
                entry.latime = now;
                NumericOutcome::Updated
            }
            None => NumericOutcome::NotNumeric,
        }
    }

    /// Add `delta` to every numeric entry under `prefix`; non-numeric entries
    /// are left untouched. Returns the number mutated.
    pub fn prefix_incr(&self, db: &str, prefix: &[u8], delta: i64) -> usize {
        let now = unix_now();
        let mut inner = self.inner.lock();

        let mut mutated = 0;
        inner.db_mut(db).trie.for_each_mut(prefix, |_, entry| {
            if entry.is_expired(now) {
                return;
            }
            if let Some(data) = trie::numeric_update(&entry.data, delta) {
                entry.data = data;
                entry.latime = now;
                mutated += 1;
            }
        });
        mutated
    }

    /// Number of keys in `db`
    pub fn count(&self, db: &str) -> u64 {
        let inner = self.inner.lock();
        inner.dbs.get(db).map_or(0, |d| d.trie.len() as u64)
    }

    pub fn prefix_count(&self, db: &str, prefix: &[u8]) -> u64 {
        let inner = self.inner.lock();
        inner
            .dbs
            .get(db)
            .map_or(0, |d| d.trie.prefix_count(prefix) as u64)
    }

    /// Select-or-create a database by name (the USE operation)
    pub fn select(&self, name: &str) {
        let mut inner = self.inner.lock();
        inner.db_mut(name);
    }

    /// Drop every key in `db`
    pub fn flush(&self, db: &str) {
        let mut inner = self.inner.lock();
        if let Some(database) = inner.dbs.get_mut(db) {
            database.trie.flush();
        }
        inner.expiring.cancel_db(db);
    }

    /// Total keys across all databases
    pub fn total_keys(&self) -> u64 {
        let inner = self.inner.lock();
        inner.dbs.values().map(|d| d.trie.len() as u64).sum()
    }

    pub fn database_count(&self) -> usize {
        self.inner.lock().dbs.len()
    }

    /// Approximate keyspace memory: the sum of key and value lengths
    pub fn approx_memory(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .dbs
            .values()
            .flat_map(|d| d.trie.scan(b""))
            .map(|(key, entry)| key.len() + entry.data.len())
            .sum()
    }

    /// Evict every entry whose deadline has passed. Runs under the store
    /// lock; relies on the index sort to stop at the first future deadline.
    pub fn sweep_expired(&self) -> usize {
        let now = unix_now();
        let mut inner = self.inner.lock();

        let due = inner.expiring.take_due(now);
        let mut evicted = 0;
        for record in due {
            let expired = inner
                .dbs
                .get(&record.db)
                .and_then(|d| d.trie.get(&record.key))
                .is_some_and(|entry| entry.is_expired(now));
            if expired {
                if let Some(database) = inner.dbs.get_mut(&record.db) {
                    database.trie.remove(&record.key);
                    evicted += 1;
                    debug!(
                        db = %record.db,
                        key = %String::from_utf8_lossy(&record.key),
                        "expired"
                    );
                }
            }
        }
        evicted
    }

    /// Number of records currently held by the expiration index
    pub fn expiring_len(&self) -> usize {
        self.inner.lock().expiring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn insert_get_roundtrip() {
        let store = Store::new();
        store.insert(DEFAULT_DB, b"foo", bytes("bar"), NO_TTL);

        let entry = store.get(DEFAULT_DB, b"foo").expect("hit");
        assert_eq!(entry.data.as_ref(), b"bar");
        assert_eq!(entry.ttl, NO_TTL);
        assert!(store.get(DEFAULT_DB, b"missing").is_none());
    }

    #[test]
    fn zero_ttl_expires_on_access() {
        let store = Store::new();
        store.insert(DEFAULT_DB, b"tmp", bytes("x"), 0);
        assert_eq!(store.expiring_len(), 1);

        // deadline == ctime, so the key is already due
        assert!(store.get(DEFAULT_DB, b"tmp").is_none());
        assert_eq!(store.count(DEFAULT_DB), 0);
        assert_eq!(store.expiring_len(), 0);
    }

    #[test]
    fn sweep_evicts_due_keys_only() {
        let store = Store::new();
        store.insert(DEFAULT_DB, b"due", bytes("x"), 0);
        store.insert(DEFAULT_DB, b"later", bytes("x"), 1000);
        store.insert(DEFAULT_DB, b"forever", bytes("x"), NO_TTL);

        let evicted = store.sweep_expired();
        assert_eq!(evicted, 1);
        assert_eq!(store.count(DEFAULT_DB), 2);
        assert_eq!(store.expiring_len(), 1);
    }

    #[test]
    fn replacing_with_persistent_value_clears_record() {
        let store = Store::new();
        store.insert(DEFAULT_DB, b"k", bytes("a"), 100);
        assert_eq!(store.expiring_len(), 1);

        store.insert(DEFAULT_DB, b"k", bytes("b"), NO_TTL);
        assert_eq!(store.expiring_len(), 0);
        assert!(store.get(DEFAULT_DB, b"k").is_some());
    }

    #[test]
    fn ttl_refresh_keeps_one_record() {
        let store = Store::new();
        store.insert(DEFAULT_DB, b"k", bytes("a"), 100);
        assert!(store.set_ttl(DEFAULT_DB, b"k", 200));
        assert_eq!(store.expiring_len(), 1);

        assert!(store.set_ttl(DEFAULT_DB, b"k", NO_TTL));
        assert_eq!(store.expiring_len(), 0);
        assert!(!store.set_ttl(DEFAULT_DB, b"missing", 5));
    }

    #[test]
    fn prefix_set_rewrites_subtree() {
        let store = Store::new();
        store.insert(DEFAULT_DB, b"alpha", bytes("1"), NO_TTL);
        store.insert(DEFAULT_DB, b"alphax", bytes("2"), NO_TTL);
        store.insert(DEFAULT_DB, b"beta", bytes("3"), NO_TTL);

        let touched = store.prefix_set(DEFAULT_DB, b"alpha", bytes("z"), 50);
        assert_eq!(touched, 2);
        assert_eq!(store.expiring_len(), 2);
        assert_eq!(store.get(DEFAULT_DB, b"alphax").unwrap().data.as_ref(), b"z");
        assert_eq!(store.get(DEFAULT_DB, b"beta").unwrap().data.as_ref(), b"3");
    }

    #[test]
    fn prefix_remove_drops_records() {
        let store = Store::new();
        store.insert(DEFAULT_DB, b"alpha", bytes("1"), 100);
        store.insert(DEFAULT_DB, b"alphax", bytes("2"), 100);
        store.insert(DEFAULT_DB, b"beta", bytes("3"), 100);

        assert_eq!(store.prefix_remove(DEFAULT_DB, b"alpha"), 2);
        assert_eq!(store.expiring_len(), 1);
        assert_eq!(store.count(DEFAULT_DB), 1);
    }

    #[test]
    fn incr_outcomes() {
        let store = Store::new();
        store.insert(DEFAULT_DB, b"n", bytes("9"), NO_TTL);
        store.insert(DEFAULT_DB, b"s", bytes("abc"), NO_TTL);

        assert_eq!(store.incr(DEFAULT_DB, b"n", 1), NumericOutcome::Updated);
        assert_eq!(store.get(DEFAULT_DB, b"n").unwrap().data.as_ref(), b"10");

        assert_eq!(store.incr(DEFAULT_DB, b"s", 1), NumericOutcome::NotNumeric);
        assert_eq!(store.get(DEFAULT_DB, b"s").unwrap().data.as_ref(), b"abc");

        assert_eq!(store.incr(DEFAULT_DB, b"nope", 1), NumericOutcome::Missing);
    }

    #[test]
    fn prefix_incr_skips_non_numeric() {
        let store = Store::new();
        store.insert(DEFAULT_DB, b"n1", bytes("1"), NO_TTL);
        store.insert(DEFAULT_DB, b"n2", bytes("x"), NO_TTL);
        store.insert(DEFAULT_DB, b"n3", bytes("3"), NO_TTL);

        assert_eq!(store.prefix_incr(DEFAULT_DB, b"n", -1), 2);
        assert_eq!(store.get(DEFAULT_DB, b"n1").unwrap().data.as_ref(), b"0");
        assert_eq!(store.get(DEFAULT_DB, b"n2").unwrap().data.as_ref(), b"x");
        assert_eq!(store.get(DEFAULT_DB, b"n3").unwrap().data.as_ref(), b"2");
    }

    #[test]
    fn databases_are_isolated() {
        let store = Store::new();
        store.select("scratch");
        store.insert("scratch", b"x", bytes("1"), NO_TTL);

        assert!(store.get(DEFAULT_DB, b"x").is_none());
        assert!(store.get("scratch", b"x").is_some());
        assert_eq!(store.database_count(), 2);
        assert_eq!(store.total_keys(), 1);
    }

    #[test]
    fn flush_clears_keys_and_records() {
        let store = Store::new();
        store.insert(DEFAULT_DB, b"a", bytes("1"), 100);
        store.insert(DEFAULT_DB, b"b", bytes("2"), NO_TTL);

        store.flush(DEFAULT_DB);
        assert_eq!(store.count(DEFAULT_DB), 0);
        assert_eq!(store.expiring_len(), 0);
    }

    #[test]
    fn prefix_get_returns_scan_order() {
        let store = Store::new();
        store.insert(DEFAULT_DB, b"alphax", bytes("2"), NO_TTL);
        store.insert(DEFAULT_DB, b"alpha", bytes("1"), NO_TTL);
        store.insert(DEFAULT_DB, b"beta", bytes("3"), NO_TTL);

        let hits = store.prefix_get(DEFAULT_DB, b"a");
        let keys: Vec<_> = hits.iter().map(|(k, _)| k.as_ref()).collect();
        assert_eq!(keys, [b"alpha".as_ref(), b"alphax"]);
    }

    #[test]
    fn prefix_get_evicts_expired() {
        let store = Store::new();
        store.insert(DEFAULT_DB, b"alpha", bytes("1"), NO_TTL);
        store.insert(DEFAULT_DB, b"alphax", bytes("2"), 0);

        let hits = store.prefix_get(DEFAULT_DB, b"alpha");
        assert_eq!(hits.len(), 1);
        assert_eq!(store.count(DEFAULT_DB), 1);
        assert_eq!(store.expiring_len(), 0);
    }

    #[test]
    fn approx_memory_tracks_contents() {
        let store = Store::new();
        assert_eq!(store.approx_memory(), 0);
        store.insert(DEFAULT_DB, b"abc", bytes("12345"), NO_TTL);
        assert_eq!(store.approx_memory(), 8);
    }
}
