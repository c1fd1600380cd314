//! 数据导出与导入
//!
//! 导出文档包含全部语言的条目集合、各语言分类树、完整复习进度
//! 表与测验历史，并带格式版本号。导入对重复数据幂等：按结构化
//! 内容键查重，重复条目跳过，同一份文件导入两次不会产生重复。

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::{category_cache_key, DurableCache};
use crate::categories::CategoryNode;
use crate::gateway::{CollectionPath, RemoteGateway};
use crate::models::{
    normalize_document_timestamps, now_iso, ItemKind, ItemPayload, Language, LearningItem,
    QuizRecord,
};
use crate::progress::ReviewProgress;
use crate::store::{LearnStore, StoreEvent};
use crate::{StoreError, StoreResult};

/// 导出文档格式版本
pub const EXPORT_SCHEMA_VERSION: u32 = 1;

// ============================================================
// 导出文档结构
// ============================================================

/// 某语言的三个条目集合（原始文档对象，含 id 与时间戳）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LanguageCollections {
    #[serde(default)]
    pub words: Vec<Value>,
    #[serde(default)]
    pub sentences: Vec<Value>,
    #[serde(default)]
    pub qa: Vec<Value>,
}

impl LanguageCollections {
    fn items(&self, kind: ItemKind) -> &[Value] {
        match kind {
            ItemKind::Word => &self.words,
            ItemKind::Sentence => &self.sentences,
            ItemKind::Qa => &self.qa,
        }
    }

    fn items_mut(&mut self, kind: ItemKind) -> &mut Vec<Value> {
        match kind {
            ItemKind::Word => &mut self.words,
            ItemKind::Sentence => &mut self.sentences,
            ItemKind::Qa => &mut self.qa,
        }
    }
}

/// 导出文档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(default)]
    pub languages: Vec<Language>,
    /// 语言代码 -> 条目集合
    #[serde(default)]
    pub collections: BTreeMap<String, LanguageCollections>,
    /// 语言代码 -> 分类森林
    #[serde(default)]
    pub categories: BTreeMap<String, Vec<CategoryNode>>,
    /// 扁平复习进度表
    #[serde(rename = "reviewProgress", default)]
    pub review_progress: Map<String, Value>,
    #[serde(rename = "quizHistory", default)]
    pub quiz_history: Vec<QuizRecord>,
    #[serde(rename = "exportedAt")]
    pub exported_at: String,
}

/// 导入结果统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// 从原始文档对象解析条目内容（忽略 id 与时间戳字段）
fn payload_from_value(kind: ItemKind, value: &Value) -> StoreResult<ItemPayload> {
    Ok(match kind {
        ItemKind::Word => ItemPayload::Word(serde_json::from_value(value.clone())?),
        ItemKind::Sentence => ItemPayload::Sentence(serde_json::from_value(value.clone())?),
        ItemKind::Qa => ItemPayload::Qa(serde_json::from_value(value.clone())?),
    })
}

fn payload_to_value(payload: &ItemPayload) -> StoreResult<Value> {
    Ok(match payload {
        ItemPayload::Word(w) => serde_json::to_value(w)?,
        ItemPayload::Sentence(s) => serde_json::to_value(s)?,
        ItemPayload::Qa(q) => serde_json::to_value(q)?,
    })
}

// ============================================================
// 导出 / 导入
// ============================================================

impl<G: RemoteGateway, C: DurableCache> LearnStore<G, C> {
    /// 导出全部数据
    ///
    /// 逐语言从云端拉取三个集合的完整文档，连同分类树、复习进度
    /// 与测验历史组成一份带版本号的 JSON 文档。
    pub async fn export_data(&self) -> StoreResult<ExportDocument> {
        let online = self.with_state(|state| state.is_online)?;
        let owner = match (online, self.identity.current_owner_id()) {
            (true, Some(owner)) => owner,
            _ => {
                return Err(StoreError::Offline(
                    "需要网络连接才能导出数据".to_string(),
                ))
            }
        };

        let languages = self.with_state(|state| state.supported_languages.clone())?;
        log::info!("导出当前数据: {} 个语言", languages.len());

        let mut collections = BTreeMap::new();
        let mut categories = BTreeMap::new();
        for language in &languages {
            let mut entry = LanguageCollections::default();
            for kind in ItemKind::ALL {
                let path = CollectionPath::for_kind(&owner, &language.code, kind);
                let docs = self.gateway.list(&path).await?;
                let values = entry.items_mut(kind);
                for doc in docs {
                    let mut value = doc.data;
                    if let Value::Object(map) = &mut value {
                        map.insert("id".to_string(), Value::String(doc.id));
                    }
                    values.push(value);
                }
            }
            collections.insert(language.code.clone(), entry);

            let trees = self.export_categories_for(&owner, &language.code).await;
            if !trees.is_empty() {
                categories.insert(language.code.clone(), trees);
            }
        }

        let (review_progress, quiz_history) = self.with_state(|state| {
            (state.progress.to_flat_map(), state.quiz_history.clone())
        })?;

        Ok(ExportDocument {
            schema_version: EXPORT_SCHEMA_VERSION,
            languages,
            collections,
            categories,
            review_progress,
            quiz_history,
            exported_at: now_iso(),
        })
    }

    /// 某语言的分类树：优先取内存，缺失时回退云端聚合文档
    async fn export_categories_for(&self, owner: &str, language: &str) -> Vec<CategoryNode> {
        let local = self
            .with_state(|state| state.categories.get(language).cloned())
            .ok()
            .flatten();
        if let Some(trees) = local {
            if !trees.is_empty() {
                return trees;
            }
        }

        match self
            .gateway
            .get_owner_doc(owner, &category_cache_key(language))
            .await
        {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(e) => {
                log::warn!("导出时拉取分类树失败: {}", e);
                Vec::new()
            }
        }
    }

    /// 导入一份导出文档
    ///
    /// 逐条目走结构化查重：内容相同的条目跳过，因此对同一份文件
    /// 重复导入是幂等的。时间戳字段在导入前归一化（兼容远端原生
    /// 时间戳对象）。单条失败只记警告，不中断整体导入。
    pub async fn import_data(&self, doc: &ExportDocument) -> StoreResult<ImportSummary> {
        let online = self.with_state(|state| state.is_online)?;
        let owner = match (online, self.identity.current_owner_id()) {
            (true, Some(owner)) => owner,
            _ => {
                return Err(StoreError::Offline(
                    "需要登录后才能导入数据".to_string(),
                ))
            }
        };

        log::info!("开始导入数据: 格式版本 {}", doc.schema_version);
        let current = self.with_state(|state| state.current_language.clone())?;
        let mut summary = ImportSummary::default();

        for (code, entry) in &doc.collections {
            for kind in ItemKind::ALL {
                let raw_items = entry.items(kind);
                if raw_items.is_empty() {
                    continue;
                }
                let path = CollectionPath::for_kind(&owner, code, kind);

                // 现有条目的内容键：当前语言取内存集合，其余语言列举云端
                let mut existing: HashSet<(String, String)> = if *code == current {
                    self.with_state(|state| {
                        state
                            .items(kind)
                            .iter()
                            .map(LearningItem::content_key)
                            .collect()
                    })?
                } else {
                    self.gateway
                        .list(&path)
                        .await?
                        .iter()
                        .filter_map(|doc| LearningItem::from_document(kind, doc).ok())
                        .map(|item| item.content_key())
                        .collect()
                };

                for raw in raw_items {
                    let mut value = raw.clone();
                    normalize_document_timestamps(&mut value);

                    let payload = match payload_from_value(kind, &value) {
                        Ok(payload) => payload,
                        Err(e) => {
                            log::warn!("条目导入失败，格式异常: {}", e);
                            summary.failed += 1;
                            continue;
                        }
                    };

                    let key = payload.content_key();
                    if existing.contains(&key) {
                        summary.skipped += 1;
                        continue;
                    }

                    match self.gateway.add(&path, payload_to_value(&payload)?).await {
                        Ok(_) => {
                            existing.insert(key);
                            summary.imported += 1;
                        }
                        Err(e) => {
                            log::warn!("条目导入失败: {}", e);
                            summary.failed += 1;
                        }
                    }
                }
            }
        }

        // 复习进度：导入内容覆盖合并进内存后整体持久化
        if !doc.review_progress.is_empty() {
            let imported = ReviewProgress::from_flat_map(&doc.review_progress);
            self.with_state(|state| {
                state.progress.overlay(imported);
                state.sets.rebuild(&state.progress);
            })?;
            self.engine.persist().await;
            let _ = self.events.send(StoreEvent::ProgressChanged);
        }

        // 测验历史直接追加
        if !doc.quiz_history.is_empty() {
            self.with_state(|state| {
                state.quiz_history.extend(doc.quiz_history.iter().cloned())
            })?;
        }

        // 分类树：本地为空的语言直接采用导入的树
        for (code, trees) in &doc.categories {
            if trees.is_empty() {
                continue;
            }
            let local_empty = self.with_state(|state| {
                state
                    .categories
                    .get(code)
                    .map(|trees| trees.is_empty())
                    .unwrap_or(true)
            })?;
            if local_empty {
                self.with_state(|state| {
                    state.categories.insert(code.clone(), trees.clone());
                })?;
                self.categories.persist(code).await;
                let _ = self
                    .events
                    .send(StoreEvent::CategoriesChanged(code.clone()));
            }
        }

        log::info!(
            "数据导入完成: 新增 {} 条, 跳过 {} 条, 失败 {} 条",
            summary.imported,
            summary.skipped,
            summary.failed
        );
        Ok(summary)
    }
}
