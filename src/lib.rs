//! 多语言闪卡学习数据核心
//!
//! 提供本地缓存与云端文档库之间的双向同步能力，包括：
//! - 复习进度（时间戳 + 永久标记）的合并与持久化
//! - 按语言划分的单词 / 句子 / 问答集合管理
//! - 分类树的维护与级联更新
//! - 数据导出与导入
//!
//! UI 层、认证提供方与远端文档库本身均不在本 crate 范围内，
//! 它们分别通过 getter/action、[`identity::IdentityBinding`] 与
//! [`gateway::RemoteGateway`] 这三个接口与核心交互。

// ============================================================
// 子模块声明
// ============================================================

pub mod cache;
pub mod categories;
pub mod collections;
pub mod engine;
pub mod gateway;
pub mod identity;
pub mod models;
pub mod progress;
pub mod store;
pub mod transfer;

// ============================================================
// 重新导出主要类型
// ============================================================

pub use cache::{DurableCache, MemoryCache, SqliteCache};
pub use categories::{CategoryManager, CategoryNode};
pub use collections::{CollectionManager, DefaultDataSet, DefaultLanguageData};
pub use engine::{ProgressEngine, SyncConfig};
pub use gateway::memory::MemoryGateway;
pub use gateway::rest::RestSink;
pub use gateway::{CollectionPath, Document, RemoteGateway, Subscription, SubscriptionGuard};
pub use identity::IdentityBinding;
pub use models::{
    ItemKind, ItemPayload, Language, LearningItem, QaFields, QuizRecord, SentenceFields,
    WordFields,
};
pub use progress::{ItemRef, ReviewProgress, ReviewSets};
pub use store::{LearnStore, StoreEvent, StoreState};
pub use transfer::{ExportDocument, ImportSummary, LanguageCollections, EXPORT_SCHEMA_VERSION};

// ============================================================
// 依赖导入
// ============================================================

use thiserror::Error;

// ============================================================
// 错误类型定义
// ============================================================

/// 数据核心错误类型
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("需要网络连接: {0}")]
    Offline(String),

    #[error("内容重复: {0}")]
    Duplicate(String),

    #[error("远端请求失败: {0}")]
    RemoteTransient(String),

    #[error("本地存储不可用: {0}")]
    StorageUnavailable(String),

    #[error("数据未找到: {0}")]
    NotFound(String),

    #[error("不支持的语言: {0}")]
    UnsupportedLanguage(String),

    #[error("校验失败: {0}")]
    Validation(String),

    #[error("锁获取失败: {0}")]
    Lock(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
