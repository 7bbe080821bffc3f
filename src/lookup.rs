//! 完全重复图片的查找表
//!
//! 以图片的 dHash 为 key 保存图片路径，用于在近邻检索之前快速找到完全相同的图片。
//! 查找表只是加速手段，不可用时检索会退化为只使用近邻索引。

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, WithTls};
use log::debug;

use crate::dhash::DHash;
use crate::error::{Error, Result};

pub trait LookupStore: Send + Sync {
    fn put(&self, key: &[u8], value: &str) -> Result<()>;

    /// 批量写入，后写入的同名 key 覆盖先写入的
    fn put_all(&self, items: &[(DHash, String)]) -> Result<()> {
        for (key, value) in items {
            self.put(key, value)?;
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<String>>;

    fn clear(&self) -> Result<()>;
}

fn unavailable(e: impl ToString) -> Error {
    Error::LookupUnavailable(e.to_string())
}

#[derive(Default)]
pub struct MemoryLookup {
    data: RwLock<HashMap<Vec<u8>, String>>,
}

impl MemoryLookup {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LookupStore for MemoryLookup {
    fn put(&self, key: &[u8], value: &str) -> Result<()> {
        self.data.write().map_err(unavailable)?.insert(key.to_vec(), value.to_string());
        Ok(())
    }

    fn put_all(&self, items: &[(DHash, String)]) -> Result<()> {
        let mut data = self.data.write().map_err(unavailable)?;
        data.extend(items.iter().map(|(key, value)| (key.to_vec(), value.clone())));
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<String>> {
        Ok(self.data.read().map_err(unavailable)?.get(key).cloned())
    }

    fn clear(&self) -> Result<()> {
        self.data.write().map_err(unavailable)?.clear();
        Ok(())
    }
}

pub struct LmdbLookup {
    env: Env<WithTls>,
    db: Database<Bytes, Str>,
}

impl LmdbLookup {
    /// 打开或创建查找表，超过 `timeout` 仍未打开时返回 [`Error::LookupUnavailable`]
    pub fn open(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (tx, rx) = mpsc::channel();
        let display = path.display().to_string();
        thread::spawn(move || {
            let _ = tx.send(Self::open_blocking(path));
        });
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err(unavailable(format!("timed out opening {display}"))),
        }
    }

    fn open_blocking(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&path).map_err(unavailable)?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(1 << 30)
                .max_dbs(1)
                .open(&path)
                .map_err(unavailable)?
        };
        let mut txn = env.write_txn().map_err(unavailable)?;
        let db = env
            .create_database::<Bytes, Str>(&mut txn, Some("dhash"))
            .map_err(unavailable)?;
        txn.commit().map_err(unavailable)?;
        debug!("已打开查找表 {}", path.display());
        Ok(Self { env, db })
    }
}

impl LookupStore for LmdbLookup {
    fn put(&self, key: &[u8], value: &str) -> Result<()> {
        let mut txn = self.env.write_txn().map_err(unavailable)?;
        self.db.put(&mut txn, key, value).map_err(unavailable)?;
        txn.commit().map_err(unavailable)
    }

    /// 整个图库只用一个写事务
    fn put_all(&self, items: &[(DHash, String)]) -> Result<()> {
        let mut txn = self.env.write_txn().map_err(unavailable)?;
        for (key, value) in items {
            self.db.put(&mut txn, key, value).map_err(unavailable)?;
        }
        txn.commit().map_err(unavailable)
    }

    fn get(&self, key: &[u8]) -> Result<Option<String>> {
        let txn = self.env.read_txn().map_err(unavailable)?;
        let value = self.db.get(&txn, key).map_err(unavailable)?;
        Ok(value.map(str::to_string))
    }

    fn clear(&self) -> Result<()> {
        let mut txn = self.env.write_txn().map_err(unavailable)?;
        self.db.clear(&mut txn).map_err(unavailable)?;
        txn.commit().map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_roundtrip(store: &dyn LookupStore) {
        assert_eq!(store.get(b"a").unwrap(), None);
        store.put(b"a", "x.jpg").unwrap();
        store.put(b"b", "y.jpg").unwrap();
        store.put(b"a", "z.jpg").unwrap();
        assert_eq!(store.get(b"a").unwrap().as_deref(), Some("z.jpg"));
        store.clear().unwrap();
        assert_eq!(store.get(b"b").unwrap(), None);
    }

    fn check_batch(store: &dyn LookupStore) {
        let items = vec![
            ([1u8; 8], "x.jpg".to_string()),
            ([2u8; 8], "y.jpg".to_string()),
            ([1u8; 8], "z.jpg".to_string()),
        ];
        store.put_all(&items).unwrap();
        assert_eq!(store.get(&[1u8; 8]).unwrap().as_deref(), Some("z.jpg"));
        assert_eq!(store.get(&[2u8; 8]).unwrap().as_deref(), Some("y.jpg"));
        assert_eq!(store.get(&[3u8; 8]).unwrap(), None);
        store.put_all(&[]).unwrap();
        assert_eq!(store.get(&[2u8; 8]).unwrap().as_deref(), Some("y.jpg"));
    }

    #[test]
    fn test_memory_lookup() {
        check_roundtrip(&MemoryLookup::new());
        check_batch(&MemoryLookup::new());
    }

    #[test]
    fn test_lmdb_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = LmdbLookup::open(dir.path().join("lookup"), Duration::from_secs(5)).unwrap();
        check_roundtrip(&store);
        check_batch(&store);
    }

    #[test]
    fn test_lmdb_lookup_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"").unwrap();
        let result = LmdbLookup::open(&file, Duration::from_secs(5));
        assert!(matches!(result, Err(Error::LookupUnavailable(_))));
    }
}
