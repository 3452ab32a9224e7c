use std::fs;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info};

use crate::error::KVError;
use crate::traits::KVStore;

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("items");

fn storage_err(e: impl std::fmt::Display) -> KVError {
    KVError::Storage(e.to_string())
}

/// RedbStore is a KVStore implementation backed by redb, a pure-Rust embedded
/// key-value database with MVCC reads and serialized write transactions.
///
/// The database handle sits behind a lock: every operation holds the read side
/// for the length of its transaction, `close` takes the write side and drops
/// the handle, so it never races a running transaction.
pub struct RedbStore {
    db: RwLock<Option<Database>>,
}

impl RedbStore {
    /// Open or create a redb database at the given path.
    ///
    /// Missing parent directories are created. A path held open by another
    /// store, a corrupt file or a permission problem yields `KVError::Open`.
    pub fn open(path: &Path) -> Result<Self, KVError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| KVError::Open(format!("{}: {}", parent.display(), e)))?;
        }

        let open_err =
            |e: &dyn std::fmt::Display| KVError::Open(format!("{}: {}", path.display(), e));
        let db = Database::create(path).map_err(|e| open_err(&e))?;

        // Ensure the table exists by doing a write transaction.
        let write_txn = db.begin_write().map_err(|e| open_err(&e))?;
        {
            let _table = write_txn.open_table(TABLE).map_err(|e| open_err(&e))?;
        }
        write_txn.commit().map_err(|e| open_err(&e))?;

        info!(path = %path.display(), "item store opened");
        Ok(Self {
            db: RwLock::new(Some(db)),
        })
    }

    /// Run `f` against the open database, or fail with `KVError::Closed`.
    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T, KVError>) -> Result<T, KVError> {
        let guard = self.db.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(KVError::Closed),
        }
    }
}

impl KVStore for RedbStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, KVError> {
        debug!(key, "get");
        self.with_db(|db| {
            let read_txn = db.begin_read().map_err(storage_err)?;
            let table = read_txn.open_table(TABLE).map_err(storage_err)?;

            match table.get(key).map_err(storage_err)? {
                Some(val) => Ok(val.value().to_vec()),
                None => Err(KVError::NotFound(key.to_string())),
            }
        })
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), KVError> {
        debug!(key, len = value.len(), "set");
        self.with_db(|db| {
            // An uncommitted write transaction is rolled back on drop.
            let write_txn = db.begin_write().map_err(storage_err)?;
            {
                let mut table = write_txn.open_table(TABLE).map_err(storage_err)?;
                table.insert(key, value).map_err(storage_err)?;
            }
            write_txn.commit().map_err(storage_err)
        })
    }

    fn delete(&self, key: &str) -> Result<(), KVError> {
        debug!(key, "delete");
        self.with_db(|db| {
            let write_txn = db.begin_write().map_err(storage_err)?;
            {
                let mut table = write_txn.open_table(TABLE).map_err(storage_err)?;
                table.remove(key).map_err(storage_err)?;
            }
            write_txn.commit().map_err(storage_err)
        })
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KVError> {
        debug!(prefix, "list keys");
        self.with_db(|db| {
            let read_txn = db.begin_read().map_err(storage_err)?;
            let table = read_txn.open_table(TABLE).map_err(storage_err)?;

            let mut keys = Vec::new();
            let iter = table.range(prefix..).map_err(storage_err)?;

            for entry in iter {
                let (key, _value) = entry.map_err(storage_err)?;
                let key = key.value();
                if !key.starts_with(prefix) {
                    break;
                }
                keys.push(key.to_string());
            }

            Ok(keys)
        })
    }

    fn close(&self) -> Result<(), KVError> {
        let mut guard = self.db.write().unwrap_or_else(PoisonError::into_inner);
        match guard.take() {
            Some(db) => {
                drop(db);
                info!("item store closed");
                Ok(())
            }
            None => Err(KVError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn open_temp() -> (RedbStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(&dir.path().join("test.redb")).unwrap();
        (store, dir)
    }

    #[test]
    fn set_then_get_round_trips() {
        let (store, _dir) = open_temp();
        store.set("x", br#"{"n":1}"#).unwrap();
        assert_eq!(store.get("x").unwrap(), br#"{"n":1}"#.to_vec());
    }

    #[test]
    fn set_is_upsert() {
        let (store, _dir) = open_temp();
        store.set("k", b"1").unwrap();
        store.set("k", b"2").unwrap();
        assert_eq!(store.get("k").unwrap(), b"2".to_vec());
        assert_eq!(store.list_keys("").unwrap(), vec!["k".to_string()]);
    }

    #[test]
    fn get_missing_key_is_not_found() {
        let (store, _dir) = open_temp();
        let err = store.get("missing").unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err}");
    }

    #[test]
    fn get_after_delete_is_not_found() {
        let (store, _dir) = open_temp();
        store.set("gone", b"true").unwrap();
        store.delete("gone").unwrap();
        assert!(matches!(store.get("gone"), Err(KVError::NotFound(k)) if k == "gone"));
    }

    #[test]
    fn delete_is_idempotent() {
        let (store, _dir) = open_temp();
        store.delete("never-set").unwrap();

        store.set("twice", b"1").unwrap();
        store.delete("twice").unwrap();
        store.delete("twice").unwrap();
        assert!(store.get("twice").unwrap_err().is_not_found());
        assert!(store.list_keys("").unwrap().is_empty());
    }

    #[test]
    fn list_keys_by_prefix_in_order() {
        let (store, _dir) = open_temp();
        // Insert out of order.
        store.set("b/1", b"3").unwrap();
        store.set("a/2", b"2").unwrap();
        store.set("a/1", b"1").unwrap();

        assert_eq!(store.list_keys("a/").unwrap(), vec!["a/1", "a/2"]);
        assert_eq!(store.list_keys("").unwrap(), vec!["a/1", "a/2", "b/1"]);
        assert!(store.list_keys("z").unwrap().is_empty());
    }

    #[test]
    fn list_keys_stops_at_prefix_boundary() {
        let (store, _dir) = open_temp();
        store.set("app", b"1").unwrap();
        store.set("apple", b"2").unwrap();
        store.set("apq", b"3").unwrap();
        store.set("ap", b"4").unwrap();

        assert_eq!(store.list_keys("app").unwrap(), vec!["app", "apple"]);
        assert_eq!(store.list_keys("ap").unwrap(), vec!["ap", "app", "apple", "apq"]);
    }

    #[test]
    fn list_keys_orders_by_bytes() {
        let (store, _dir) = open_temp();
        store.set("é", b"1").unwrap();
        store.set("Z", b"1").unwrap();
        store.set("a", b"1").unwrap();
        assert_eq!(store.list_keys("").unwrap(), vec!["Z", "a", "é"]);
    }

    #[test]
    fn reopen_recovers_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.redb");

        let store = RedbStore::open(&path).unwrap();
        store.set("a", b"1").unwrap();
        store.set("b", b"2").unwrap();
        store.delete("b").unwrap();
        store.close().unwrap();
        drop(store);

        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get("a").unwrap(), b"1".to_vec());
        assert!(store.get("b").unwrap_err().is_not_found());
        assert_eq!(store.list_keys("").unwrap(), vec!["a"]);
    }

    #[test]
    fn open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/data.redb");
        let store = RedbStore::open(&path).unwrap();
        store.set("k", b"1").unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn open_locked_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.redb");
        let _first = RedbStore::open(&path).unwrap();

        let err = RedbStore::open(&path).err().expect("second open must fail");
        assert!(matches!(err, KVError::Open(_)), "unexpected error: {err}");
    }

    #[test]
    fn open_directory_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = RedbStore::open(dir.path()).err().expect("directory is not a database");
        assert!(matches!(err, KVError::Open(_)), "unexpected error: {err}");
    }

    #[test]
    fn open_corrupt_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.redb");
        fs::write(&path, vec![0x5a; 8192]).unwrap();

        let err = RedbStore::open(&path).err().expect("junk file is not a database");
        match err {
            KVError::Open(msg) => assert!(msg.contains("bad.redb"), "message lacks path: {msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn open_mismatched_table_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreign.redb");
        {
            // A database whose "items" table has other key and value types.
            let foreign: TableDefinition<u64, u64> = TableDefinition::new("items");
            let db = Database::create(&path).unwrap();
            let txn = db.begin_write().unwrap();
            txn.open_table(foreign).unwrap().insert(1, 2).unwrap();
            txn.commit().unwrap();
        }

        let err = RedbStore::open(&path).err().expect("table type mismatch must fail open");
        assert!(matches!(err, KVError::Open(_)), "unexpected error: {err}");
    }

    #[test]
    fn operations_after_close_fail_fast() {
        let (store, _dir) = open_temp();
        store.set("k", b"1").unwrap();
        store.close().unwrap();

        assert!(matches!(store.get("k"), Err(KVError::Closed)));
        assert!(matches!(store.set("k", b"2"), Err(KVError::Closed)));
        assert!(matches!(store.delete("k"), Err(KVError::Closed)));
        assert!(matches!(store.list_keys(""), Err(KVError::Closed)));
        assert!(matches!(store.close(), Err(KVError::Closed)));
    }

    #[test]
    fn concurrent_sets_on_different_keys() {
        let (store, _dir) = open_temp();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for j in 0..20 {
                        let key = format!("t{}/{:02}", i, j);
                        store.set(&key, key.as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for i in 0..8 {
            let keys = store.list_keys(&format!("t{}/", i)).unwrap();
            assert_eq!(keys.len(), 20);
            for key in keys {
                assert_eq!(store.get(&key).unwrap(), key.as_bytes().to_vec());
            }
        }
    }

    #[test]
    fn reader_sees_old_or_new_value() {
        let (store, _dir) = open_temp();
        let store = Arc::new(store);
        let old = vec![b'a'; 4096];
        let new = vec![b'b'; 4096];
        store.set("hot", &old).unwrap();

        let writer = {
            let store = Arc::clone(&store);
            let new = new.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    store.set("hot", &new).unwrap();
                }
            })
        };

        for _ in 0..200 {
            let value = store.get("hot").unwrap();
            assert!(value == old || value == new, "observed a partial write");
        }
        writer.join().unwrap();
        assert_eq!(store.get("hot").unwrap(), new);
    }
}
