//! 产物存储
//!
//! 词汇表、索引、直方图、分类器模型都通过 [`ArtifactCache`] 读写：存在则直接加载，
//! 不存在时在锁内构建并写入，同一个 key 同时只会有一个构建者。

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

pub const INDEX_KEY: &str = "index/corpus";
pub const TRAINING_KEY: &str = "training/histograms";
pub const MODEL_KEY: &str = "classifier/model";

pub fn vocabulary_key(name: &str) -> String {
    format!("vocabulary/{name}")
}

/// 单张图片直方图的 key，图片路径取哈希避免出现特殊字符
pub fn histogram_key(label: Option<&str>, identity: &str) -> String {
    let hash = blake3::hash(identity.as_bytes());
    format!("histograms/{}/{}", label.unwrap_or("_"), &hash.to_hex()[..32])
}

pub trait ArtifactStore: Send + Sync {
    fn exists(&self, key: &str) -> Result<bool>;

    fn read(&self, key: &str) -> Result<Vec<u8>>;

    fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// 删除 `prefix` 下的所有产物，`prefix` 为空时删除全部
    fn remove(&self, prefix: &str) -> Result<()>;

    /// 获取跨进程的构建锁，默认实现不加锁
    fn lock(&self, _key: &str) -> Result<BuildLock> {
        Ok(BuildLock { _file: None })
    }
}

/// 构建锁，持有锁文件上的排他锁，drop 或进程退出时由系统释放
#[derive(Debug)]
pub struct BuildLock {
    _file: Option<File>,
}

/// 以目录为根的文件存储，key 中的 `/` 对应子目录
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(Error::InvalidInput(format!("invalid artifact key: {key}")));
        }
        Ok(self.root.join(rel))
    }

    fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
        let mut s = path.as_os_str().to_owned();
        s.push(suffix);
        PathBuf::from(s)
    }
}

impl ArtifactStore for DirStore {
    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_of(key)?.is_file())
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.path_of(key)?)?)
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // 先写临时文件再重命名，读者不会看到写了一半的文件
        let tmp = Self::with_suffix(&path, ".tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, prefix: &str) -> Result<()> {
        let path = if prefix.is_empty() { self.root.clone() } else { self.path_of(prefix)? };
        let result = if path.is_dir() { fs::remove_dir_all(&path) } else { fs::remove_file(&path) };
        match result {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn lock(&self, key: &str) -> Result<BuildLock> {
        let path = Self::with_suffix(&self.path_of(key)?, ".lock");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // 锁文件不删除
        let file = OpenOptions::new().create(true).truncate(false).write(true).open(&path)?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                debug!("等待 {} 的构建锁", key);
                file.lock()?;
            }
            Err(TryLockError::Error(e)) => return Err(e.into()),
        }
        Ok(BuildLock { _file: Some(file) })
    }
}

/// 内存存储，用于测试和一次性的检索
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for MemoryStore {
    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.read().unwrap_or_else(|e| e.into_inner()).contains_key(key))
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, key.to_string()).into())
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, prefix: &str) -> Result<()> {
        self.data.write().unwrap_or_else(|e| e.into_inner()).retain(|k, _| {
            !(prefix.is_empty() || k == prefix || k.starts_with(&format!("{prefix}/")))
        });
        Ok(())
    }
}

/// 已加载产物的处理方式
enum Verdict {
    Use,
    Rebuild,
}

pub struct ArtifactCache {
    store: Arc<dyn ArtifactStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    hits: AtomicUsize,
    builds: AtomicUsize,
}

impl ArtifactCache {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            builds: AtomicUsize::new(0),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn store(&self) -> &dyn ArtifactStore {
        self.store.as_ref()
    }

    /// 从缓存命中的次数
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    /// 调用构建函数的次数
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        if !self.store.exists(key)? {
            return Ok(None);
        }
        let bytes = self.store.read(key)?;
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.store.write(key, &bytes)
    }

    /// 存在则加载，否则构建并保存
    pub fn get_or_build<T, F>(&self, key: &str, build: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        self.get_or_build_inner(key, |_| Ok(Verdict::Use), build)
    }

    /// 加载后用 `validate` 检查，检查失败时直接返回错误，不会覆盖已有产物
    pub fn get_or_build_validated<T, V, F>(&self, key: &str, validate: V, build: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        V: Fn(&T) -> Result<()>,
        F: FnOnce() -> Result<T>,
    {
        self.get_or_build_inner(key, |v| validate(v).map(|_| Verdict::Use), build)
    }

    /// 加载后用 `is_fresh` 检查，过期时重新构建并覆盖
    pub fn get_or_rebuild<T, P, F>(&self, key: &str, is_fresh: P, build: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        P: Fn(&T) -> bool,
        F: FnOnce() -> Result<T>,
    {
        self.get_or_build_inner(
            key,
            |v| Ok(if is_fresh(v) { Verdict::Use } else { Verdict::Rebuild }),
            build,
        )
    }

    fn get_or_build_inner<T, C, F>(&self, key: &str, check: C, build: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        C: Fn(&T) -> Result<Verdict>,
        F: FnOnce() -> Result<T>,
    {
        if let Some(value) = self.load::<T>(key)? {
            if let Verdict::Use = check(&value)? {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
        }

        let key_lock = self.key_lock(key);
        let _guard = key_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _file_lock = self.store.lock(key)?;

        // 拿到锁之后再检查一次，其他构建者可能已经完成
        if let Some(value) = self.load::<T>(key)? {
            if let Verdict::Use = check(&value)? {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
            info!("{} 已过期，重新构建", key);
        }

        debug!("构建 {}", key);
        self.builds.fetch_add(1, Ordering::Relaxed);
        let value = build()?;
        self.save(key, &value)?;
        Ok(value)
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_dir_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());
        assert!(!store.exists("vocabulary/default").unwrap());
        store.write("vocabulary/default", b"abc").unwrap();
        assert!(store.exists("vocabulary/default").unwrap());
        assert_eq!(store.read("vocabulary/default").unwrap(), b"abc");
        assert!(!dir.path().join("vocabulary/default.tmp").exists());

        store.remove("vocabulary").unwrap();
        assert!(!store.exists("vocabulary/default").unwrap());
        store.remove("vocabulary").unwrap();
    }

    #[test]
    fn test_dir_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());
        assert!(matches!(store.write("../x", b""), Err(Error::InvalidInput(_))));
        assert!(matches!(store.exists("/etc/passwd"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_dir_store_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());
        let lock_file = dir.path().join("index/corpus.lock");
        let lock = store.lock(INDEX_KEY).unwrap();
        assert!(lock_file.exists());

        let other = File::options().write(true).open(&lock_file).unwrap();
        assert!(matches!(other.try_lock(), Err(TryLockError::WouldBlock)));
        drop(lock);
        other.try_lock().unwrap();
    }

    #[test]
    fn test_leftover_lock_file_does_not_block() {
        // 构建者被杀死后留下的锁文件
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("vocabulary")).unwrap();
        fs::write(dir.path().join("vocabulary/default.lock"), b"").unwrap();

        let cache = ArtifactCache::new(Arc::new(DirStore::new(dir.path())));
        let value: u32 = cache.get_or_build("vocabulary/default", || Ok(42)).unwrap();
        assert_eq!(value, 42);
        assert_eq!(cache.builds(), 1);
    }

    #[test]
    fn test_memory_store_remove_prefix() {
        let store = MemoryStore::new();
        store.write("histograms/a/1", b"1").unwrap();
        store.write("histograms/b/2", b"2").unwrap();
        store.write("histogramsx", b"3").unwrap();
        store.remove("histograms").unwrap();
        assert!(!store.exists("histograms/a/1").unwrap());
        assert!(store.exists("histogramsx").unwrap());
        store.remove("").unwrap();
        assert!(!store.exists("histogramsx").unwrap());
    }

    #[test]
    fn test_get_or_build_once() {
        let cache = ArtifactCache::in_memory();
        let calls = AtomicUsize::new(0);
        let build = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1u32, 2, 3])
        };
        let a: Vec<u32> = cache.get_or_build("k", build).unwrap();
        let b: Vec<u32> = cache.get_or_build("k", build).unwrap();
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.builds(), 1);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn test_get_or_build_concurrent() {
        let cache = ArtifactCache::in_memory();
        let calls = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let v: u64 = cache
                        .get_or_build("k", || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            Ok(42)
                        })
                        .unwrap();
                    assert_eq!(v, 42);
                });
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_build_error_is_not_saved() {
        let cache = ArtifactCache::in_memory();
        let r: Result<u32> = cache.get_or_build("k", || Err(Error::InvalidInput("x".into())));
        assert!(r.is_err());
        assert!(!cache.store().exists("k").unwrap());
    }

    #[test]
    fn test_validated_and_rebuild() {
        let cache = ArtifactCache::in_memory();
        cache.save("k", &1u32).unwrap();

        let r: Result<u32> = cache.get_or_build_validated(
            "k",
            |v| if *v == 2 { Ok(()) } else { Err(Error::StaleArtifact { key: "k".into() }) },
            || Ok(2),
        );
        assert!(matches!(r, Err(Error::StaleArtifact { .. })));

        let v: u32 = cache.get_or_rebuild("k", |v| *v == 2, || Ok(2)).unwrap();
        assert_eq!(v, 2);
        assert_eq!(cache.load::<u32>("k").unwrap(), Some(2));
    }

    #[test]
    fn test_histogram_key() {
        let a = histogram_key(Some("cat"), "/data/001.cat/a.jpg");
        assert!(a.starts_with("histograms/cat/"));
        assert_eq!(a, histogram_key(Some("cat"), "/data/001.cat/a.jpg"));
        assert!(histogram_key(None, "x").starts_with("histograms/_/"));
    }
}
