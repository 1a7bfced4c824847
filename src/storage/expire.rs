use bytes::Bytes;

/// One expiring key: the absolute deadline plus enough addressing to walk
/// back to the entry (owning database name and full key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpireRecord {
    pub deadline: i64,
    pub db: String,
    pub key: Bytes,
}

/// Index of keys carrying a TTL, kept sorted ascending by deadline.
///
/// The sort is a full re-sort after every TTL mutation rather than an
/// incremental structure; TTL writes are rare next to reads. Invariant:
/// at most one record per `(db, key)` pair.
#[derive(Debug, Default)]
pub struct ExpireIndex {
    records: Vec<ExpireRecord>,
}

impl ExpireIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Register or refresh the record for `(db, key)`
    pub fn register(&mut self, db: &str, key: &[u8], deadline: i64) {
        self.cancel(db, key);
        self.records.push(ExpireRecord {
            deadline,
            db: db.to_string(),
            key: Bytes::copy_from_slice(key),
        });
        self.records.sort_unstable_by_key(|r| r.deadline);
    }

    /// Drop the record for `(db, key)` if one exists
    pub fn cancel(&mut self, db: &str, key: &[u8]) {
        self.records
            .retain(|r| !(r.db == db && r.key.as_ref() == key));
    }

    /// Drop every record whose key lives under `prefix` in `db`
    pub fn cancel_prefix(&mut self, db: &str, prefix: &[u8]) {
        self.records
            .retain(|r| !(r.db == db && r.key.starts_with(prefix)));
    }

    /// Drop every record belonging to `db`
    pub fn cancel_db(&mut self, db: &str) {
        self.records.retain(|r| r.db != db);
    }

    /// Drain records whose deadline has passed. Stops at the first record
    /// with a future deadline, which the sort invariant makes correct.
    pub fn take_due(&mut self, now: i64) -> Vec<ExpireRecord> {
        let due = self.records.partition_point(|r| r.deadline <= now);
        self.records.drain(..due).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_keys(index: &ExpireIndex) -> Vec<&[u8]> {
        index.records.iter().map(|r| r.key.as_ref()).collect()
    }

    #[test]
    fn register_keeps_one_record_per_key() {
        let mut index = ExpireIndex::new();
        index.register("db0", b"k", 10);
        index.register("db0", b"k", 20);

        assert_eq!(index.len(), 1);
        assert_eq!(index.records[0].deadline, 20);
    }

    #[test]
    fn records_sorted_by_deadline() {
        let mut index = ExpireIndex::new();
        index.register("db0", b"late", 30);
        index.register("db0", b"early", 10);
        index.register("db0", b"mid", 20);

        assert_eq!(record_keys(&index), [b"early".as_ref(), b"mid", b"late"]);
    }

    #[test]
    fn take_due_stops_at_future_deadline() {
        let mut index = ExpireIndex::new();
        index.register("db0", b"a", 5);
        index.register("db0", b"b", 10);
        index.register("db0", b"c", 50);

        let due = index.take_due(10);
        assert_eq!(due.len(), 2);
        assert_eq!(index.len(), 1);
        assert_eq!(index.records[0].key.as_ref(), b"c");
    }

    #[test]
    fn cancel_variants() {
        let mut index = ExpireIndex::new();
        index.register("db0", b"alpha", 10);
        index.register("db0", b"alphax", 20);
        index.register("db0", b"beta", 30);
        index.register("scratch", b"alpha", 40);

        index.cancel("db0", b"beta");
        assert_eq!(index.len(), 3);

        index.cancel_prefix("db0", b"alpha");
        assert_eq!(index.len(), 1);
        assert_eq!(index.records[0].db, "scratch");

        index.cancel_db("scratch");
        assert!(index.is_empty());
    }
}
