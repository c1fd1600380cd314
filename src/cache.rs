//! 本地持久缓存
//!
//! 提供一个跨进程重启存活的键值持久化表面，存放序列化后的 JSON
//! 文本：复习进度、语言列表、各语言的分类树。缓存读写都可能失败
//! （如磁盘不可用），调用方应降级为仅记录警告，绝不向上抛出。

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rusqlite::Connection;

use crate::{StoreError, StoreResult};

// ============================================================
// 常用缓存键
// ============================================================

/// 复习进度（扁平 JSON 表）
pub const KEY_REVIEW_PROGRESS: &str = "reviewProgress";
/// 支持的语言列表
pub const KEY_SUPPORTED_LANGUAGES: &str = "supportedLanguages";
/// 数据归属者 id
pub const KEY_DATA_OWNER_ID: &str = "dataOwnerId";

/// 某语言分类树的缓存键
pub fn category_cache_key(language: &str) -> String {
    format!("categories_{}", language)
}

// ============================================================
// DurableCache - 缓存接口
// ============================================================

/// 键值持久缓存接口
pub trait DurableCache: Send + Sync {
    /// 读取键值；键不存在返回 `Ok(None)`
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// 写入键值
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// 删除键；返回是否确有删除
    fn remove(&self, key: &str) -> StoreResult<bool>;
}

// ============================================================
// SqliteCache - SQLite 实现
// ============================================================

/// 建表 SQL
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entry (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// 基于 SQLite 的持久缓存
pub struct SqliteCache {
    conn: Mutex<Connection>,
    db_path: String,
}

impl SqliteCache {
    /// 打开（或创建）缓存数据库
    ///
    /// 自动启用 WAL 模式并建表。
    ///
    /// # Arguments
    /// * `db_path` - 数据库文件路径
    pub fn new<P: AsRef<Path>>(db_path: P) -> StoreResult<Self> {
        let path_str = db_path.as_ref().to_string_lossy().to_string();
        let connection = Connection::open(&db_path)?;

        // WAL 模式提高并发读写性能
        connection.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=-64000;",
        )?;
        connection.execute_batch(CACHE_SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(connection),
            db_path: path_str,
        })
    }

    /// 创建内存缓存数据库（用于测试）
    pub fn in_memory() -> StoreResult<Self> {
        let connection = Connection::open_in_memory()?;
        connection.execute_batch(CACHE_SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(connection),
            db_path: ":memory:".to_string(),
        })
    }

    /// 数据库文件路径
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }
}

impl DurableCache for SqliteCache {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.lock()?;
        let result: Option<String> = conn
            .query_row(
                "SELECT value FROM cache_entry WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .ok();
        Ok(result)
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO cache_entry (key, value, updated_at)
             VALUES (?1, ?2, datetime('now'))",
            [key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let affected = conn.execute("DELETE FROM cache_entry WHERE key = ?1", [key])?;
        Ok(affected > 0)
    }
}

// ============================================================
// MemoryCache - 内存实现
// ============================================================

/// 内存键值缓存
///
/// 除测试外也可用作缓存完全不可用时的会话内降级容器。
/// `set_unavailable` 可以模拟无痕模式等存储被禁用的场景。
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 切换为不可用状态：之后所有读写都返回 `StorageUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::StorageUnavailable(
                "本地存储被禁用".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl DurableCache for MemoryCache {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check_available()?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(entries.remove(key).is_some())
    }
}

// ============================================================
// 测试
// ============================================================
