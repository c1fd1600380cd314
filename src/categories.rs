//! 分类树管理
//!
//! 每个语言维护一棵单词分类森林。条目通过名称路径（而非节点 id）
//! 引用分类，因此重命名与删除都要把变更级联到所有引用该路径的
//! 单词上：重命名改写路径段，删除把条目重置为未分类——数据只
//! 解除关联，绝不删除。
//!
//! 树本身双路持久化：本地缓存立即写入，在线时同步到 owner 的
//! 分类聚合文档。

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;

use crate::cache::{category_cache_key, DurableCache};
use crate::gateway::{CollectionPath, RemoteGateway};
use crate::identity::IdentityBinding;
use crate::models::{synthetic_id, ItemKind, LearningItem};
use crate::store::{StoreEvent, StoreState};
use crate::{StoreError, StoreResult};

// ============================================================
// CategoryNode - 分类节点
// ============================================================

/// 分类树节点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub children: Vec<CategoryNode>,
}

impl CategoryNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: synthetic_id(),
            name: name.into(),
            children: Vec::new(),
        }
    }
}

/// 沿名称路径定位子节点列表；空路径返回森林根
fn children_at<'a>(
    forest: &'a mut Vec<CategoryNode>,
    path: &[String],
) -> Option<&'a mut Vec<CategoryNode>> {
    let mut current = forest;
    for name in path {
        let node = current.iter_mut().find(|node| node.name == *name)?;
        current = &mut node.children;
    }
    Some(current)
}

/// 沿名称路径定位节点
fn node_at_mut<'a>(
    forest: &'a mut Vec<CategoryNode>,
    path: &[String],
) -> Option<&'a mut CategoryNode> {
    let (last, parents) = path.split_last()?;
    let siblings = children_at(forest, parents)?;
    siblings.iter_mut().find(|node| node.name == *last)
}

/// 判断条目路径是否以给定分类路径为前缀
fn has_prefix(item_path: &[String], prefix: &[String]) -> bool {
    item_path.len() >= prefix.len() && item_path[..prefix.len()] == *prefix
}

// ============================================================
// CategoryManager - 分类管理器
// ============================================================

/// 分类树管理器
pub struct CategoryManager<G, C> {
    state: Arc<Mutex<StoreState>>,
    gateway: Arc<G>,
    cache: Arc<C>,
    identity: Arc<IdentityBinding>,
    events: broadcast::Sender<StoreEvent>,
}

impl<G: RemoteGateway, C: DurableCache> CategoryManager<G, C> {
    pub fn new(
        state: Arc<Mutex<StoreState>>,
        gateway: Arc<G>,
        cache: Arc<C>,
        identity: Arc<IdentityBinding>,
        events: broadcast::Sender<StoreEvent>,
    ) -> Self {
        Self {
            state,
            gateway,
            cache,
            identity,
            events,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> StoreResult<R> {
        let mut guard = self
            .state
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(f(&mut guard))
    }

    fn online_owner(&self) -> Option<String> {
        let online = self
            .with_state(|state| state.is_online)
            .unwrap_or(false);
        if online {
            self.identity.current_owner_id()
        } else {
            None
        }
    }

    /// 某语言的分类森林（克隆）
    pub fn trees(&self, language: &str) -> StoreResult<Vec<CategoryNode>> {
        self.with_state(|state| state.categories.get(language).cloned().unwrap_or_default())
    }

    // ========== 树结构操作 ==========

    /// 在指定父路径下新增分类
    ///
    /// 父路径逐级按名称查找；同级重名被拒绝。离线也可用，树会
    /// 先落本地缓存，联网后随下一次持久化同步到云端。
    pub async fn add_category(
        &self,
        language: &str,
        parent_path: &[String],
        name: &str,
    ) -> StoreResult<()> {
        if name.trim().is_empty() {
            return Err(StoreError::Validation("分类名称不能为空".to_string()));
        }

        self.with_state(|state| {
            let forest = state.categories.entry(language.to_string()).or_default();
            let siblings = children_at(forest, parent_path).ok_or_else(|| {
                StoreError::NotFound(format!("父分类不存在: {}", parent_path.join("/")))
            })?;
            if siblings.iter().any(|node| node.name == name) {
                return Err(StoreError::Duplicate(format!(
                    "分类 \"{}\" 已存在",
                    name
                )));
            }
            siblings.push(CategoryNode::new(name));
            Ok(())
        })??;

        log::info!("添加分类: {}/{}", parent_path.join("/"), name);
        self.persist(language).await;
        self.emit_changed(language);
        Ok(())
    }

    /// 重命名分类，并改写所有引用该路径的单词的分类路径
    ///
    /// 级联需要联网（逐条改写云端单词文档）；级联失败时树保持
    /// 原状。
    pub async fn rename_category(
        &self,
        language: &str,
        path: &[String],
        new_name: &str,
    ) -> StoreResult<()> {
        if path.is_empty() {
            return Err(StoreError::Validation("分类路径不能为空".to_string()));
        }
        if new_name.trim().is_empty() {
            return Err(StoreError::Validation("分类名称不能为空".to_string()));
        }
        let owner = self.online_owner().ok_or_else(|| {
            StoreError::Offline("需要网络连接才能重命名分类".to_string())
        })?;

        let (last, parents) = path
            .split_last()
            .ok_or_else(|| StoreError::Validation("分类路径不能为空".to_string()))?;

        // 先校验：节点存在，且新名字不与兄弟冲突
        self.with_state(|state| {
            let forest = state.categories.entry(language.to_string()).or_default();
            let siblings = children_at(forest, parents).ok_or_else(|| {
                StoreError::NotFound(format!("分类不存在: {}", path.join("/")))
            })?;
            if !siblings.iter().any(|node| node.name == *last) {
                return Err(StoreError::NotFound(format!(
                    "分类不存在: {}",
                    path.join("/")
                )));
            }
            if siblings
                .iter()
                .any(|node| node.name == new_name && node.name != *last)
            {
                return Err(StoreError::Duplicate(format!(
                    "分类 \"{}\" 已存在",
                    new_name
                )));
            }
            Ok(())
        })??;

        // 级联改写引用该路径的单词
        let segment = path.len() - 1;
        let words = self.words_for(&owner, language).await?;
        let words_path = CollectionPath::for_kind(&owner, language, ItemKind::Word);
        let mut rewritten = 0usize;
        for word in words {
            if !has_prefix(word.category_path(), path) {
                continue;
            }
            let mut new_path = word.category_path().to_vec();
            new_path[segment] = new_name.to_string();
            self.gateway
                .update(&words_path, &word.id, json!({ "categoryPath": new_path }))
                .await?;
            rewritten += 1;
        }

        self.with_state(|state| {
            let forest = state.categories.entry(language.to_string()).or_default();
            if let Some(node) = node_at_mut(forest, path) {
                node.name = new_name.to_string();
            }
        })?;

        log::info!(
            "重命名分类: {} -> {}，改写 {} 个单词",
            path.join("/"),
            new_name,
            rewritten
        );
        self.persist(language).await;
        self.emit_changed(language);
        Ok(())
    }

    /// 删除分类（连同子树），引用它的单词重置为未分类
    pub async fn delete_category(&self, language: &str, path: &[String]) -> StoreResult<()> {
        if path.is_empty() {
            return Err(StoreError::Validation("分类路径不能为空".to_string()));
        }
        let owner = self.online_owner().ok_or_else(|| {
            StoreError::Offline("需要网络连接才能删除分类".to_string())
        })?;

        let exists = self.with_state(|state| {
            let forest = state.categories.entry(language.to_string()).or_default();
            node_at_mut(forest, path).is_some()
        })?;
        if !exists {
            return Err(StoreError::NotFound(format!(
                "分类不存在: {}",
                path.join("/")
            )));
        }

        // 级联：引用该路径（含子路径）的单词全部解除关联
        let words = self.words_for(&owner, language).await?;
        let words_path = CollectionPath::for_kind(&owner, language, ItemKind::Word);
        let mut unlinked = 0usize;
        for word in words {
            if !has_prefix(word.category_path(), path) {
                continue;
            }
            self.gateway
                .update(
                    &words_path,
                    &word.id,
                    json!({ "categoryPath": Vec::<String>::new() }),
                )
                .await?;
            unlinked += 1;
        }

        let (last, parents) = path
            .split_last()
            .ok_or_else(|| StoreError::Validation("分类路径不能为空".to_string()))?;
        self.with_state(|state| {
            let forest = state.categories.entry(language.to_string()).or_default();
            if let Some(siblings) = children_at(forest, parents) {
                siblings.retain(|node| node.name != *last);
            }
        })?;

        log::info!(
            "删除分类: {}，解除 {} 个单词的关联",
            path.join("/"),
            unlinked
        );
        self.persist(language).await;
        self.emit_changed(language);
        Ok(())
    }

    // ========== 持久化 ==========

    /// 双路持久化：缓存立即写入，在线时写 owner 聚合文档
    pub async fn persist(&self, language: &str) {
        let trees = match self.trees(language) {
            Ok(trees) => trees,
            Err(e) => {
                log::warn!("读取分类树失败: {}", e);
                return;
            }
        };
        let key = category_cache_key(language);

        match serde_json::to_string(&trees) {
            Ok(text) => {
                if let Err(e) = self.cache.set(&key, &text) {
                    log::warn!("保存分类树到缓存失败: {}", e);
                }
            }
            Err(e) => log::warn!("分类树序列化失败: {}", e),
        }

        if let Some(owner) = self.online_owner() {
            match serde_json::to_value(&trees) {
                Ok(value) => {
                    if let Err(e) = self.gateway.set_owner_doc_merge(&owner, &key, value).await {
                        log::error!("同步分类树到云端失败: {}", e);
                    }
                }
                Err(e) => log::warn!("分类树序列化失败: {}", e),
            }
        }
    }

    /// 从缓存恢复某语言的分类树（失败只记警告）
    pub fn load_from_cache(&self, language: &str) {
        let key = category_cache_key(language);
        let text = match self.cache.get(&key) {
            Ok(Some(text)) => text,
            Ok(None) => return,
            Err(e) => {
                log::warn!("从缓存加载分类树失败: {}", e);
                return;
            }
        };
        match serde_json::from_str::<Vec<CategoryNode>>(&text) {
            Ok(trees) => {
                let count = trees.len();
                if self
                    .with_state(|state| {
                        state.categories.insert(language.to_string(), trees);
                    })
                    .is_ok()
                {
                    log::info!("从缓存加载分类树: {} 个根分类", count);
                }
            }
            Err(e) => log::warn!("缓存中的分类树损坏: {}", e),
        }
    }

    /// 与云端对账某语言的分类树
    ///
    /// 云端文档存在时整棵替换本地（文档级最后写入为准）；云端
    /// 没有而本地有时把本地推上去。
    pub async fn sync_from_cloud(&self, language: &str) {
        let Some(owner) = self.online_owner() else {
            return;
        };
        let key = category_cache_key(language);

        match self.gateway.get_owner_doc(&owner, &key).await {
            Ok(Some(value)) => match serde_json::from_value::<Vec<CategoryNode>>(value) {
                Ok(trees) => {
                    let changed = self.with_state(|state| {
                        state.categories.insert(language.to_string(), trees)
                    });
                    if changed.is_ok() {
                        self.persist(language).await;
                        self.emit_changed(language);
                    }
                }
                Err(e) => log::warn!("云端分类树格式异常: {}", e),
            },
            Ok(None) => {
                let local_nonempty = self
                    .trees(language)
                    .map(|trees| !trees.is_empty())
                    .unwrap_or(false);
                if local_nonempty {
                    self.persist(language).await;
                }
            }
            Err(e) => log::warn!("拉取云端分类树失败: {}", e),
        }
    }

    fn emit_changed(&self, language: &str) {
        let _ = self
            .events
            .send(StoreEvent::CategoriesChanged(language.to_string()));
    }

    /// 某语言的全部单词：当前语言直接取内存集合，否则从云端列举
    async fn words_for(&self, owner: &str, language: &str) -> StoreResult<Vec<LearningItem>> {
        let (current, words) =
            self.with_state(|state| (state.current_language.clone(), state.words.clone()))?;
        if current == language {
            return Ok(words);
        }

        let path = CollectionPath::for_kind(owner, language, ItemKind::Word);
        let docs = self.gateway.list(&path).await?;
        Ok(docs
            .iter()
            .filter_map(|doc| LearningItem::from_document(ItemKind::Word, doc).ok())
            .collect())
    }
}

// ============================================================
// 测试
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    fn sample_forest() -> Vec<CategoryNode> {
        let mut noun = CategoryNode::new("名词");
        noun.children.push(CategoryNode::new("动物"));
        noun.children.push(CategoryNode::new("植物"));
        let verb = CategoryNode::new("动词");
        vec![noun, verb]
    }

    #[test]
    fn test_children_at_walks_by_name() {
        let mut forest = sample_forest();

        let root = children_at(&mut forest, &[]).expect("Root must exist");
        assert_eq!(root.len(), 2);

        let mut forest = sample_forest();
        let children = children_at(&mut forest, &path(&["名词"])).expect("Failed to walk");
        assert_eq!(children.len(), 2);

        let mut forest = sample_forest();
        assert!(children_at(&mut forest, &path(&["形容词"])).is_none());
    }

    #[test]
    fn test_node_at_mut_finds_nested_node() {
        let mut forest = sample_forest();
        let node =
            node_at_mut(&mut forest, &path(&["名词", "动物"])).expect("Failed to find node");
        assert_eq!(node.name, "动物");

        assert!(node_at_mut(&mut forest, &path(&["名词", "矿物"])).is_none());
        assert!(node_at_mut(&mut forest, &[]).is_none());
    }

    #[test]
    fn test_has_prefix_matches_exact_segments() {
        let item = path(&["名词", "动物", "猫科"]);
        assert!(has_prefix(&item, &path(&["名词"])));
        assert!(has_prefix(&item, &path(&["名词", "动物"])));
        assert!(has_prefix(&item, &item));
        assert!(!has_prefix(&item, &path(&["动词"])));
        assert!(!has_prefix(&path(&["名词"]), &path(&["名词", "动物"])));
    }
}
