//! 远端集合网关
//!
//! 以能力接口的形式抽象按 owner 定界的云端文档库：类型化的
//! CRUD、按创建时间排序的列举、实时订阅，以及每个 owner 一份的
//! 聚合文档（复习进度、分类树）。网关的传输协议与查询引擎不在
//! 本 crate 范围内；[`memory::MemoryGateway`] 提供进程内参考实现，
//! [`rest::RestSink`] 提供落盘备份用的 HTTP 兜底通道。

pub mod memory;
pub mod rest;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::models::ItemKind;
use crate::StoreResult;

// ============================================================
// CollectionPath - 集合路径
// ============================================================

/// 按 owner 定界的集合路径
///
/// 形如 `owner/{ownerId}/languages/{lang}/{collection}`。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath {
    pub owner_id: String,
    pub language: String,
    pub collection: String,
}

impl CollectionPath {
    pub fn new(
        owner_id: impl Into<String>,
        language: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            language: language.into(),
            collection: collection.into(),
        }
    }

    /// 某条目类型在指定语言下的集合路径
    pub fn for_kind(owner_id: &str, language: &str, kind: ItemKind) -> Self {
        Self::new(owner_id, language, kind.collection_name())
    }
}

impl std::fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "owner/{}/languages/{}/{}",
            self.owner_id, self.language, self.collection
        )
    }
}

// ============================================================
// Document - 远端文档
// ============================================================

/// 远端文档
///
/// `data` 中的 createdAt / updatedAt 已在读取时归一化为
/// ISO-8601 字符串。
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

/// 一次订阅推送的完整集合快照
pub type CollectionSnapshot = Vec<Document>;

// ============================================================
// Subscription - 实时订阅
// ============================================================

struct CancelState {
    cancelled: AtomicBool,
    cancel_fn: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// 订阅取消句柄
///
/// 可克隆、可跨任务共享；`cancel` 同步执行且幂等。取消后网关
/// 不再推送新的快照（已入队的快照由消费方依据取消标记丢弃）。
#[derive(Clone)]
pub struct SubscriptionGuard(Arc<CancelState>);

impl SubscriptionGuard {
    /// 用注销闭包构造句柄（由网关实现调用）
    pub fn from_fn(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self(Arc::new(CancelState {
            cancelled: AtomicBool::new(false),
            cancel_fn: Mutex::new(Some(Box::new(cancel))),
        }))
    }

    /// 同步取消订阅；重复调用无效果
    pub fn cancel(&self) {
        if self.0.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancel = self.0.cancel_fn.lock().ok().and_then(|mut f| f.take());
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }
}

/// 实时订阅对象
///
/// 惰性产出集合快照序列；取消后 `recv` 在耗尽已入队快照后返回
/// None。直接丢弃该对象同样会取消订阅。
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<CollectionSnapshot>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<CollectionSnapshot>, guard: SubscriptionGuard) -> Self {
        Self { rx, guard }
    }

    /// 等待下一份快照
    pub async fn recv(&mut self) -> Option<CollectionSnapshot> {
        self.rx.recv().await
    }

    /// 共享的取消句柄
    pub fn guard(&self) -> SubscriptionGuard {
        self.guard.clone()
    }

    /// 同步取消
    pub fn cancel(&self) {
        self.guard.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.guard.cancel();
    }
}

// ============================================================
// RemoteGateway - 网关接口
// ============================================================

/// 远端文档库能力接口
///
/// 所有读取返回的文档时间戳均已归一化；`subscribe` 与取消都是
/// 同步操作，保证先取消旧订阅、后建立新订阅的顺序可被调用方
/// 严格控制。
pub trait RemoteGateway: Send + Sync + 'static {
    /// 新增文档：远端分配 id，并打上服务端创建 / 更新时间戳
    fn add(
        &self,
        path: &CollectionPath,
        data: Value,
    ) -> impl Future<Output = StoreResult<Document>> + Send;

    /// 按字段合并更新文档，并刷新更新时间戳
    fn update(
        &self,
        path: &CollectionPath,
        id: &str,
        patch: Value,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// 删除文档；文档不存在时视为成功
    fn delete(
        &self,
        path: &CollectionPath,
        id: &str,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// 列举集合全部文档，按创建时间降序
    fn list(
        &self,
        path: &CollectionPath,
    ) -> impl Future<Output = StoreResult<Vec<Document>>> + Send;

    /// 建立实时订阅；建立后立即推送一份当前快照
    fn subscribe(&self, path: &CollectionPath) -> StoreResult<Subscription>;

    /// 读取 owner 聚合文档中的指定字段；文档或字段不存在返回 None
    fn get_owner_doc(
        &self,
        owner_id: &str,
        name: &str,
    ) -> impl Future<Output = StoreResult<Option<Value>>> + Send;

    /// 以合并语义写入 owner 聚合文档的指定字段
    ///
    /// 合并发生在文档顶层：该字段的值被整体替换，其余字段不动。
    fn set_owner_doc_merge(
        &self,
        owner_id: &str,
        name: &str,
        value: Value,
    ) -> impl Future<Output = StoreResult<()>> + Send;
}

// ============================================================
// 测试
// ============================================================
