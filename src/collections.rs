//! 按语言划分的集合管理
//!
//! 负责单词 / 句子 / 问答三个集合的增删改、结构化重复检测、
//! 实时订阅的建立与重绑，以及语言切换。写操作一律要求在线：
//! 新增不在本地追加，依赖实时订阅把远端变更推回来（读己之写
//! 受订阅延迟约束，最终一致）。
//!
//! 切换语言或登出时必须先同步取消全部旧订阅、再建立新订阅，
//! 防止旧作用域的快照覆盖新语言的数据。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cache::{DurableCache, KEY_SUPPORTED_LANGUAGES};
use crate::engine::ProgressEngine;
use crate::gateway::{CollectionPath, RemoteGateway, Subscription, SubscriptionGuard};
use crate::identity::IdentityBinding;
use crate::models::{
    now_iso, ItemKind, ItemPayload, Language, LearningItem, QaFields, SentenceFields, WordFields,
};
use crate::store::{StoreEvent, StoreState};
use crate::{StoreError, StoreResult};

/// 条目类型的界面用语
fn kind_label(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Word => "单词",
        ItemKind::Sentence => "句子",
        ItemKind::Qa => "问答",
    }
}

// ============================================================
// 默认数据集
// ============================================================

/// 某语言的默认学习数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultLanguageData {
    #[serde(default)]
    pub words: Vec<WordFields>,
    #[serde(default)]
    pub sentences: Vec<SentenceFields>,
    #[serde(default)]
    pub qa: Vec<QaFields>,
}

/// 语言代码 -> 默认数据
pub type DefaultDataSet = HashMap<String, DefaultLanguageData>;

// ============================================================
// CollectionManager - 集合管理器
// ============================================================

struct PumpHandle {
    guard: SubscriptionGuard,
    task: JoinHandle<()>,
}

/// 集合管理器
pub struct CollectionManager<G, C> {
    state: Arc<Mutex<StoreState>>,
    gateway: Arc<G>,
    cache: Arc<C>,
    identity: Arc<IdentityBinding>,
    events: broadcast::Sender<StoreEvent>,
    engine: Arc<ProgressEngine<G, C>>,
    subscriptions: Mutex<Vec<PumpHandle>>,
}

impl<G: RemoteGateway, C: DurableCache> CollectionManager<G, C> {
    pub fn new(
        state: Arc<Mutex<StoreState>>,
        gateway: Arc<G>,
        cache: Arc<C>,
        identity: Arc<IdentityBinding>,
        events: broadcast::Sender<StoreEvent>,
        engine: Arc<ProgressEngine<G, C>>,
    ) -> Self {
        Self {
            state,
            gateway,
            cache,
            identity,
            events,
            engine,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> StoreResult<R> {
        let mut guard = self
            .state
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(f(&mut guard))
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    /// 写操作的在线前置检查；返回 (owner, 当前语言)
    fn require_online(&self, action: &str) -> StoreResult<(String, String)> {
        let online = self.with_state(|state| state.is_online)?;
        match (online, self.identity.current_owner_id()) {
            (true, Some(owner)) => {
                let language = self.with_state(|state| state.current_language.clone())?;
                Ok((owner, language))
            }
            _ => Err(StoreError::Offline(format!(
                "需要网络连接才能{}数据",
                action
            ))),
        }
    }

    // ========== 条目增删改 ==========

    /// 新增条目
    ///
    /// 离线返回 [`StoreError::Offline`]；当前语言集合中已有结构化
    /// 内容相同的条目时返回 [`StoreError::Duplicate`]，集合保持
    /// 不变。成功时不在本地追加，由实时订阅反映新条目。
    pub async fn add_item(&self, payload: ItemPayload) -> StoreResult<crate::gateway::Document> {
        let kind = payload.kind();
        let (owner, language) = self.require_online("添加")?;

        let key = payload.content_key();
        let duplicate =
            self.with_state(|state| state.items(kind).iter().any(|item| item.content_key() == key))?;
        if duplicate {
            return Err(StoreError::Duplicate(format!(
                "该{}已存在，请勿重复添加",
                kind_label(kind)
            )));
        }

        let data = match &payload {
            ItemPayload::Word(w) => serde_json::to_value(w)?,
            ItemPayload::Sentence(s) => serde_json::to_value(s)?,
            ItemPayload::Qa(q) => serde_json::to_value(q)?,
        };

        let path = CollectionPath::for_kind(&owner, &language, kind);
        let doc = self.gateway.add(&path, data).await?;
        log::info!("{}添加成功: {}", kind_label(kind), doc.id);
        Ok(doc)
    }

    /// 更新条目（字段合并），依赖订阅反映结果
    pub async fn update_item(&self, kind: ItemKind, id: &str, patch: Value) -> StoreResult<()> {
        let (owner, language) = self.require_online("更新")?;
        let path = CollectionPath::for_kind(&owner, &language, kind);
        self.gateway.update(&path, id, patch).await?;
        log::info!("{}更新成功: {}", kind_label(kind), id);
        Ok(())
    }

    /// 删除条目，依赖订阅反映结果
    pub async fn delete_item(&self, kind: ItemKind, id: &str) -> StoreResult<()> {
        let (owner, language) = self.require_online("删除")?;
        let path = CollectionPath::for_kind(&owner, &language, kind);
        self.gateway.delete(&path, id).await?;
        log::info!("{}删除成功: {}", kind_label(kind), id);
        Ok(())
    }

    // ========== 实时订阅 ==========

    /// 同步取消全部活动订阅
    ///
    /// 语言切换与登出路径都要求先完成这里、再建立任何新订阅。
    pub fn cancel_subscriptions(&self) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            for handle in subscriptions.drain(..) {
                handle.guard.cancel();
                handle.task.abort();
            }
        }
    }

    /// 为当前语言的三个集合建立实时订阅
    ///
    /// 会先取消已有订阅；离线或未绑定身份时跳过。
    pub fn rebind_subscriptions(&self) -> StoreResult<()> {
        self.cancel_subscriptions();

        let online = self.with_state(|state| state.is_online)?;
        let owner = match (online, self.identity.current_owner_id()) {
            (true, Some(owner)) => owner,
            _ => {
                log::info!("未连接到云端，跳过实时同步设置");
                return Ok(());
            }
        };
        let language = self.with_state(|state| state.current_language.clone())?;

        let mut handles = Vec::with_capacity(ItemKind::ALL.len());
        for kind in ItemKind::ALL {
            let path = CollectionPath::for_kind(&owner, &language, kind);
            let subscription = self.gateway.subscribe(&path)?;
            handles.push(self.spawn_pump(kind, subscription, language.clone()));
        }

        *self
            .subscriptions
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))? = handles;

        log::info!("实时同步监听已设置: 语言 {}", language);
        Ok(())
    }

    /// 把一个订阅的快照流泵入共享状态
    ///
    /// 快照应用前校验当前语言仍是订阅建立时的语言，旧作用域的
    /// 迟到快照直接丢弃并结束泵任务。
    fn spawn_pump(&self, kind: ItemKind, mut sub: Subscription, language: String) -> PumpHandle {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let guard = sub.guard();
        let pump_guard = guard.clone();

        let task = tokio::spawn(async move {
            while let Some(snapshot) = sub.recv().await {
                if pump_guard.is_cancelled() {
                    break;
                }

                let items: Vec<LearningItem> = snapshot
                    .iter()
                    .filter_map(|doc| match LearningItem::from_document(kind, doc) {
                        Ok(item) => Some(item),
                        Err(e) => {
                            log::warn!("忽略无法解析的文档 {}: {}", doc.id, e);
                            None
                        }
                    })
                    .collect();

                let applied = match state.lock() {
                    Ok(mut state) => {
                        if state.current_language == language {
                            log::info!("{}数据更新: {} 个", kind_label(kind), items.len());
                            *state.items_mut(kind) = items;
                            true
                        } else {
                            log::warn!(
                                "丢弃过期订阅快照: 语言 {} 已不是当前语言",
                                language
                            );
                            false
                        }
                    }
                    Err(_) => false,
                };

                if applied {
                    let _ = events.send(StoreEvent::ItemsChanged(kind));
                } else {
                    break;
                }
            }
        });

        PumpHandle { guard, task }
    }

    // ========== 云端同步 ==========

    /// 从云端拉取当前语言的全部集合，随后对账复习进度
    ///
    /// 单个集合拉取失败不影响其他集合（失败的保持现有内容），
    /// 只记录警告。离线时整体跳过。
    pub async fn sync_from_cloud(&self) -> StoreResult<()> {
        let (owner, language) = match self.require_online("同步") {
            Ok(pair) => pair,
            Err(_) => {
                log::info!("未连接到云端，跳过同步");
                return Ok(());
            }
        };

        self.with_state(|state| state.sync_in_progress = true)?;
        log::info!("开始从云端获取数据: 语言 {}", language);

        let words_path = CollectionPath::for_kind(&owner, &language, ItemKind::Word);
        let sentences_path = CollectionPath::for_kind(&owner, &language, ItemKind::Sentence);
        let qa_path = CollectionPath::for_kind(&owner, &language, ItemKind::Qa);

        let (words, sentences, qa) = tokio::join!(
            self.gateway.list(&words_path),
            self.gateway.list(&sentences_path),
            self.gateway.list(&qa_path),
        );

        let mut failures = 0usize;
        for (kind, result) in [
            (ItemKind::Word, words),
            (ItemKind::Sentence, sentences),
            (ItemKind::Qa, qa),
        ] {
            match result {
                Ok(docs) => {
                    let items: Vec<LearningItem> = docs
                        .iter()
                        .filter_map(|doc| LearningItem::from_document(kind, doc).ok())
                        .collect();
                    let applied = self.with_state(|state| {
                        // 拉取期间语言可能已切换，不回填旧作用域
                        if state.current_language == language {
                            *state.items_mut(kind) = items;
                            true
                        } else {
                            false
                        }
                    })?;
                    if applied {
                        self.emit(StoreEvent::ItemsChanged(kind));
                    }
                }
                Err(e) => {
                    failures += 1;
                    log::warn!("部分数据同步失败: {} - {}", kind.collection_name(), e);
                }
            }
        }

        // 复习进度对账（内部自带重试与降级）
        let reconcile_result = self.engine.reconcile().await;

        self.with_state(|state| {
            state.sync_in_progress = false;
            state.last_sync_time = Some(now_iso());
        })?;
        reconcile_result?;

        self.emit(StoreEvent::SyncCompleted);
        log::info!("云端同步完成: 失败集合 {} 个", failures);
        Ok(())
    }

    // ========== 语言管理 ==========

    /// 切换学习语言
    ///
    /// 不支持的语言代码直接报错。切换顺序是硬性要求：先同步取消
    /// 全部旧订阅，再更新语言并清空集合，然后重建订阅并全量
    /// 同步新语言的数据。
    pub async fn switch_language(&self, code: &str) -> StoreResult<()> {
        let supported = self.with_state(|state| {
            state
                .supported_languages
                .iter()
                .any(|language| language.code == code)
        })?;
        if !supported {
            return Err(StoreError::UnsupportedLanguage(code.to_string()));
        }

        self.cancel_subscriptions();

        self.with_state(|state| {
            state.current_language = code.to_string();
            state.words.clear();
            state.sentences.clear();
            state.qa.clear();
        })?;
        log::info!("切换学习语言到: {}", code);
        self.emit(StoreEvent::LanguageChanged(code.to_string()));

        self.rebind_subscriptions()?;
        self.sync_from_cloud().await
    }

    /// 添加新语言并写入缓存
    pub fn add_language(&self, language: Language) -> StoreResult<()> {
        let exists = self.with_state(|state| {
            state
                .supported_languages
                .iter()
                .any(|existing| existing.code == language.code)
        })?;
        if exists {
            return Err(StoreError::Duplicate(format!(
                "语言代码 \"{}\" 已存在",
                language.code
            )));
        }

        log::info!("添加新语言: {} ({})", language.name, language.code);
        self.with_state(|state| state.supported_languages.push(language))?;
        self.persist_languages();
        Ok(())
    }

    /// 删除语言
    ///
    /// 至少保留一个语言；删除的是当前语言时自动切换到剩余列表
    /// 中的第一个。
    pub async fn remove_language(&self, code: &str) -> StoreResult<()> {
        let (len, is_current, fallback) = self.with_state(|state| {
            let fallback = state
                .supported_languages
                .iter()
                .find(|language| language.code != code)
                .map(|language| language.code.clone());
            (
                state.supported_languages.len(),
                state.current_language == code,
                fallback,
            )
        })?;
        if len <= 1 {
            return Err(StoreError::Validation(
                "至少需要保留一个语言".to_string(),
            ));
        }

        self.with_state(|state| {
            state
                .supported_languages
                .retain(|language| language.code != code)
        })?;
        self.persist_languages();
        log::info!("删除语言: {}", code);

        if is_current {
            if let Some(fallback) = fallback {
                self.switch_language(&fallback).await?;
            }
        }
        Ok(())
    }

    /// 把语言列表写入缓存（失败只记警告）
    pub fn persist_languages(&self) {
        let languages = match self.with_state(|state| state.supported_languages.clone()) {
            Ok(languages) => languages,
            Err(e) => {
                log::warn!("读取语言列表失败: {}", e);
                return;
            }
        };
        match serde_json::to_string(&languages) {
            Ok(text) => {
                if let Err(e) = self.cache.set(KEY_SUPPORTED_LANGUAGES, &text) {
                    log::warn!("保存语言列表到缓存失败: {}", e);
                }
            }
            Err(e) => log::warn!("语言列表序列化失败: {}", e),
        }
    }

    /// 从缓存恢复语言列表（为空或失败时保留默认列表）
    pub fn load_languages_from_cache(&self) {
        let text = match self.cache.get(KEY_SUPPORTED_LANGUAGES) {
            Ok(Some(text)) => text,
            Ok(None) => return,
            Err(e) => {
                log::warn!("从缓存加载语言列表失败: {}", e);
                return;
            }
        };
        match serde_json::from_str::<Vec<Language>>(&text) {
            Ok(languages) if !languages.is_empty() => {
                let count = languages.len();
                if self
                    .with_state(|state| state.supported_languages = languages)
                    .is_ok()
                {
                    log::info!("从缓存加载语言列表: {} 个语言", count);
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("缓存中的语言列表损坏: {}", e),
        }
    }

    // ========== 默认数据 ==========

    /// 在当前语言集合为空时导入默认数据
    ///
    /// 全部通过 [`CollectionManager::add_item`] 走重复检测；重复
    /// 条目静默跳过，其余错误记警告后继续。返回成功导入的条数。
    pub async fn initialize_default_data(&self, defaults: &DefaultDataSet) -> StoreResult<usize> {
        let (has_data, language) = self.with_state(|state| {
            (
                state.has_initial_data(),
                state.current_language.clone(),
            )
        })?;
        if has_data {
            return Ok(0);
        }
        if self.require_online("初始化").is_err() {
            log::info!("设备未在线，跳过默认数据初始化");
            return Ok(0);
        }

        let Some(data) = defaults.get(&language) else {
            log::info!("当前语言没有默认数据: {}", language);
            return Ok(0);
        };

        let mut imported = 0usize;
        let payloads = data
            .words
            .iter()
            .cloned()
            .map(ItemPayload::Word)
            .chain(data.sentences.iter().cloned().map(ItemPayload::Sentence))
            .chain(data.qa.iter().cloned().map(ItemPayload::Qa));

        for payload in payloads {
            match self.add_item(payload).await {
                Ok(_) => imported += 1,
                Err(StoreError::Duplicate(_)) => {}
                Err(e) => log::warn!("默认数据导入失败: {}", e),
            }
        }

        log::info!("默认数据初始化完成: 导入 {} 条", imported);
        Ok(imported)
    }
}
