//! 进程内参考网关
//!
//! 用 `Mutex<HashMap>` 模拟远端文档库的可观测行为：服务端分配
//! id 与时间戳、按创建时间降序列举、订阅建立后立即推送当前
//! 快照、每次写入后向所有订阅者广播新快照。另带读路径故障注入，
//! 供重试逻辑测试使用。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::gateway::{CollectionPath, Document, RemoteGateway, Subscription, SubscriptionGuard};
use crate::models::{normalize_document_timestamps, now_iso, synthetic_id};
use crate::{StoreError, StoreResult};

struct StoredDoc {
    id: String,
    data: Value,
    /// 创建序号，用作创建时间排序键
    seq: u64,
}

struct Watcher {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<Document>>,
}

#[derive(Default)]
struct Inner {
    /// 集合路径 -> 文档列表
    collections: HashMap<String, Vec<StoredDoc>>,
    /// owner id -> 聚合文档字段
    owner_docs: HashMap<String, Map<String, Value>>,
    /// 集合路径 -> 订阅者
    watchers: HashMap<String, Vec<Watcher>>,
    seq: u64,
    next_watcher: u64,
    /// 接下来多少次读操作直接失败
    fail_reads: u32,
}

/// 进程内网关实现
#[derive(Clone, Default)]
pub struct MemoryGateway {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注入读路径故障：接下来 `n` 次 list / get_owner_doc 返回
    /// `RemoteTransient`
    pub fn fail_next_reads(&self, n: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_reads = n;
        }
    }

    /// 当前某集合的文档数（测试辅助）
    pub fn collection_len(&self, path: &CollectionPath) -> usize {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.collections.get(&path.to_string()).map(Vec::len))
            .unwrap_or(0)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|e| StoreError::Lock(e.to_string()))
    }

    fn consume_read_failure(inner: &mut Inner) -> StoreResult<()> {
        if inner.fail_reads > 0 {
            inner.fail_reads -= 1;
            return Err(StoreError::RemoteTransient(
                "模拟的远端读取故障".to_string(),
            ));
        }
        Ok(())
    }

    /// 当前集合快照，按创建时间降序
    fn snapshot(inner: &Inner, path_key: &str) -> Vec<Document> {
        let mut docs: Vec<&StoredDoc> = inner
            .collections
            .get(path_key)
            .map(|docs| docs.iter().collect())
            .unwrap_or_default();
        docs.sort_by(|a, b| b.seq.cmp(&a.seq));
        docs.iter()
            .map(|doc| {
                let mut data = doc.data.clone();
                normalize_document_timestamps(&mut data);
                Document {
                    id: doc.id.clone(),
                    data,
                }
            })
            .collect()
    }

    /// 向某集合的所有订阅者推送当前快照，顺带清理已断开的订阅
    fn notify(inner: &mut Inner, path_key: &str) {
        let snapshot = Self::snapshot(inner, path_key);
        if let Some(watchers) = inner.watchers.get_mut(path_key) {
            watchers.retain(|watcher| watcher.tx.send(snapshot.clone()).is_ok());
        }
    }
}

impl RemoteGateway for MemoryGateway {
    async fn add(&self, path: &CollectionPath, data: Value) -> StoreResult<Document> {
        let path_key = path.to_string();
        let mut inner = self.lock()?;

        let mut data = data;
        if let Value::Object(map) = &mut data {
            let now = now_iso();
            map.insert("createdAt".to_string(), Value::String(now.clone()));
            map.insert("updatedAt".to_string(), Value::String(now));
        }

        inner.seq += 1;
        let seq = inner.seq;
        let id = synthetic_id();
        inner
            .collections
            .entry(path_key.clone())
            .or_default()
            .push(StoredDoc {
                id: id.clone(),
                data: data.clone(),
                seq,
            });

        Self::notify(&mut inner, &path_key);
        Ok(Document { id, data })
    }

    async fn update(&self, path: &CollectionPath, id: &str, patch: Value) -> StoreResult<()> {
        let path_key = path.to_string();
        let mut inner = self.lock()?;

        let doc = inner
            .collections
            .get_mut(&path_key)
            .and_then(|docs| docs.iter_mut().find(|doc| doc.id == id))
            .ok_or_else(|| StoreError::NotFound(format!("{path_key}/{id}")))?;

        if let (Value::Object(target), Value::Object(fields)) = (&mut doc.data, patch) {
            for (key, value) in fields {
                target.insert(key, value);
            }
            target.insert("updatedAt".to_string(), Value::String(now_iso()));
        }

        Self::notify(&mut inner, &path_key);
        Ok(())
    }

    async fn delete(&self, path: &CollectionPath, id: &str) -> StoreResult<()> {
        let path_key = path.to_string();
        let mut inner = self.lock()?;

        if let Some(docs) = inner.collections.get_mut(&path_key) {
            docs.retain(|doc| doc.id != id);
        }

        Self::notify(&mut inner, &path_key);
        Ok(())
    }

    async fn list(&self, path: &CollectionPath) -> StoreResult<Vec<Document>> {
        let mut inner = self.lock()?;
        Self::consume_read_failure(&mut inner)?;
        Ok(Self::snapshot(&inner, &path.to_string()))
    }

    fn subscribe(&self, path: &CollectionPath) -> StoreResult<Subscription> {
        let path_key = path.to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher_id = {
            let mut inner = self.lock()?;
            inner.next_watcher += 1;
            let watcher_id = inner.next_watcher;

            // 建立订阅即推送一份当前快照
            let snapshot = Self::snapshot(&inner, &path_key);
            let _ = tx.send(snapshot);

            inner
                .watchers
                .entry(path_key.clone())
                .or_default()
                .push(Watcher {
                    id: watcher_id,
                    tx,
                });
            watcher_id
        };

        let registry = Arc::clone(&self.inner);
        let guard = SubscriptionGuard::from_fn(move || {
            if let Ok(mut inner) = registry.lock() {
                if let Some(watchers) = inner.watchers.get_mut(&path_key) {
                    watchers.retain(|watcher| watcher.id != watcher_id);
                }
            }
        });

        Ok(Subscription::new(rx, guard))
    }

    async fn get_owner_doc(&self, owner_id: &str, name: &str) -> StoreResult<Option<Value>> {
        let mut inner = self.lock()?;
        Self::consume_read_failure(&mut inner)?;
        Ok(inner
            .owner_docs
            .get(owner_id)
            .and_then(|doc| doc.get(name))
            .cloned())
    }

    async fn set_owner_doc_merge(
        &self,
        owner_id: &str,
        name: &str,
        value: Value,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner
            .owner_docs
            .entry(owner_id.to_string())
            .or_default()
            .insert(name.to_string(), value);
        Ok(())
    }
}

// ============================================================
// 测试
// ============================================================
