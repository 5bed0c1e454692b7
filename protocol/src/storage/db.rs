//! # LedgerDb — Persistent Storage Engine
//!
//! The persistence layer for the relationship ledger, built on sled's
//! embedded key-value store. Every engine reads and writes through this
//! module; nothing else touches sled directly.
//!
//! ## Tree Layout
//!
//! One sled tree per namespace, so point lookups never scan:
//!
//! | Tree                | Key                              | Value                       |
//! |---------------------|----------------------------------|-----------------------------|
//! | `identity`          | identity id                      | `bincode(ParticipantIdentity)` |
//! | `challenge`         | challenge id                     | `bincode(PairingChallenge)` |
//! | `pairing_queue`     | request id                       | `bincode(QueuedPairingRequest)` |
//! | `proxy_queue_index` | `proxy \0 request id`            | request id                  |
//! | `relationship`      | relationship id                  | `bincode(RelationshipToken)` |
//! | `participant_index` | `participant \0 relationship id` | relationship id             |
//! | `tensor`            | tensor id                        | `bincode(TrustTensor)`      |
//! | `tensor_index`      | `relationship \0 context`        | tensor id                   |
//! | `evidence`          | `tensor id \0 version (8B BE)`   | `bincode(EvidenceRecord)`   |
//! | `pool`              | pool id                          | `bincode(ResourcePool)`     |
//! | `pool_binding`      | context                          | pool id                     |
//! | `resource_token`    | token id                         | `bincode(ResourceToken)`    |
//! | `event`             | sequence (8B BE)                 | `bincode(AuditEvent)`       |
//!
//! Composite keys use a NUL separator so a prefix scan over
//! `participant \0` can never pick up `participant-2`. Ids and contexts are
//! checked with [`is_valid_key_component`] before they reach a key.
//!
//! ## Atomicity
//!
//! Single-record writes are plain inserts. Anything that has to land in
//! more than one tree at once (a discharge updates the pool, writes a
//! token and appends an audit event) goes through a sled multi-tree
//! transaction: either everything lands or nothing does.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::TransactionError;
use sled::{Db, Tree};
use std::path::Path;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<TransactionError<DbError>> for DbError {
    fn from(err: TransactionError<DbError>) -> Self {
        match err {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(inner) => DbError::Sled(inner),
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Separator for composite keys.
pub const KEY_SEPARATOR: u8 = 0;

/// Build `first \0 second`.
pub fn composite_key(first: &str, second: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(first.len() + 1 + second.len());
    key.extend_from_slice(first.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(second.as_bytes());
    key
}

/// Whether `s` may be stored as one part of a composite key.
///
/// Blank strings and anything with a control character (the separator
/// included) are refused.
pub fn is_valid_key_component(s: &str) -> bool {
    !s.trim().is_empty() && !s.chars().any(char::is_control)
}

/// Prefix for scanning every `first \0 *` entry.
pub fn composite_prefix(first: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(first.len() + 1);
    key.extend_from_slice(first.as_bytes());
    key.push(KEY_SEPARATOR);
    key
}

/// Serialize a value with bincode.
pub fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

/// Deserialize a bincode value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// LedgerDb
// ---------------------------------------------------------------------------

/// Persistent storage for the ledger.
///
/// Cloning is cheap: sled handles are reference counted, so every engine
/// holds its own `LedgerDb` pointing at the same database.
///
/// # Thread Safety
///
/// sled trees support concurrent reads and serialized writes. Read-modify-
/// write sequences are *not* atomic on their own; engines wrap them in a
/// [`KeyedLocks`](super::KeyedLocks) guard for the record they mutate.
#[derive(Debug, Clone)]
pub struct LedgerDb {
    db: Db,
    pub(crate) identities: Tree,
    pub(crate) challenges: Tree,
    pub(crate) pairing_queue: Tree,
    pub(crate) proxy_queue_index: Tree,
    pub(crate) relationships: Tree,
    pub(crate) participant_index: Tree,
    pub(crate) tensors: Tree,
    pub(crate) tensor_index: Tree,
    pub(crate) evidence: Tree,
    pub(crate) pools: Tree,
    pub(crate) pool_bindings: Tree,
    pub(crate) resource_tokens: Tree,
    pub(crate) events: Tree,
}

impl LedgerDb {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a temporary database that is removed when dropped.
    ///
    /// What every test uses.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            identities: db.open_tree("identity")?,
            challenges: db.open_tree("challenge")?,
            pairing_queue: db.open_tree("pairing_queue")?,
            proxy_queue_index: db.open_tree("proxy_queue_index")?,
            relationships: db.open_tree("relationship")?,
            participant_index: db.open_tree("participant_index")?,
            tensors: db.open_tree("tensor")?,
            tensor_index: db.open_tree("tensor_index")?,
            evidence: db.open_tree("evidence")?,
            pools: db.open_tree("pool")?,
            pool_bindings: db.open_tree("pool_binding")?,
            resource_tokens: db.open_tree("resource_token")?,
            events: db.open_tree("event")?,
            db,
        })
    }

    // -- Typed accessors ----------------------------------------------------

    /// Fetch and decode `key` from `tree`.
    pub fn get<T: DeserializeOwned>(tree: &Tree, key: impl AsRef<[u8]>) -> DbResult<Option<T>> {
        match tree.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encode and store `value` under `key`.
    pub fn put<T: Serialize>(tree: &Tree, key: impl AsRef<[u8]>, value: &T) -> DbResult<()> {
        tree.insert(key.as_ref(), encode(value)?)?;
        Ok(())
    }

    /// Whether `key` is present in `tree`.
    pub fn contains(tree: &Tree, key: impl AsRef<[u8]>) -> DbResult<bool> {
        Ok(tree.contains_key(key)?)
    }

    /// Decode every value whose key starts with `prefix`, in key order.
    pub fn scan_prefix<T: DeserializeOwned>(
        tree: &Tree,
        prefix: impl AsRef<[u8]>,
    ) -> DbResult<Vec<T>> {
        let mut out = Vec::new();
        for entry in tree.scan_prefix(prefix) {
            let (_key, value) = entry?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Decode every value in `tree`, in key order.
    pub fn scan_all<T: DeserializeOwned>(tree: &Tree) -> DbResult<Vec<T>> {
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (_key, value) = entry?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Next value of sled's monotonic id counter.
    ///
    /// Used as the event log sequence; big-endian keys keep scans ordered.
    pub fn next_sequence(&self) -> DbResult<u64> {
        Ok(self.db.generate_id()?)
    }

    /// Force a flush of all pending writes to disk.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: String,
        value: u64,
    }

    #[test]
    fn open_temporary_database() {
        let db = LedgerDb::open_temporary().expect("should create temp db");
        assert!(db.identities.is_empty());
        assert!(db.pools.is_empty());
    }

    #[test]
    fn open_persistent_database_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let db = LedgerDb::open(dir.path()).expect("should open db");
            let record = Record {
                id: "pool-1".into(),
                value: 7,
            };
            LedgerDb::put(&db.pools, "pool-1", &record).unwrap();
            db.flush().unwrap();
        }

        let db = LedgerDb::open(dir.path()).expect("should reopen db");
        let back: Record = LedgerDb::get(&db.pools, "pool-1").unwrap().unwrap();
        assert_eq!(back.value, 7);
    }

    #[test]
    fn get_returns_none_for_missing_key() {
        let db = LedgerDb::open_temporary().unwrap();
        let missing: Option<Record> = LedgerDb::get(&db.identities, "nobody").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn composite_prefix_does_not_leak_into_neighbours() {
        let db = LedgerDb::open_temporary().unwrap();
        let r = |id: &str| Record {
            id: id.into(),
            value: 0,
        };
        LedgerDb::put(&db.participant_index, composite_key("alice", "r1"), &r("r1")).unwrap();
        LedgerDb::put(&db.participant_index, composite_key("alice", "r2"), &r("r2")).unwrap();
        LedgerDb::put(&db.participant_index, composite_key("alice-2", "r3"), &r("r3")).unwrap();

        let found: Vec<Record> =
            LedgerDb::scan_prefix(&db.participant_index, composite_prefix("alice")).unwrap();
        let ids: Vec<_> = found.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[test]
    fn contains_reports_presence() {
        let db = LedgerDb::open_temporary().unwrap();
        assert!(!LedgerDb::contains(&db.pools, "grid").unwrap());
        LedgerDb::put(&db.pools, "grid", &Record { id: "grid".into(), value: 1 }).unwrap();
        assert!(LedgerDb::contains(&db.pools, "grid").unwrap());
    }

    #[test]
    fn key_components_reject_separator_and_control_chars() {
        assert!(is_valid_key_component("pack-1"));
        assert!(is_valid_key_component("energy grid"));
        assert!(!is_valid_key_component(""));
        assert!(!is_valid_key_component("   "));
        assert!(!is_valid_key_component("pack\0evil"));
        assert!(!is_valid_key_component("pack\nevil"));
    }

    #[test]
    fn sequence_is_monotonic() {
        let db = LedgerDb::open_temporary().unwrap();
        let a = db.next_sequence().unwrap();
        let b = db.next_sequence().unwrap();
        assert!(b > a);
    }

    #[test]
    fn corrupt_bytes_surface_as_serialization_error() {
        let db = LedgerDb::open_temporary().unwrap();
        db.pools.insert("bad", &[0xff_u8][..]).unwrap();
        let result: DbResult<Option<Record>> = LedgerDb::get(&db.pools, "bad");
        assert!(matches!(result, Err(DbError::Serialization(_))));
    }
}
