//! 数据仓库门面
//!
//! 把对账引擎、集合管理器与分类管理器装配在一份显式的共享状态
//! 上。状态容器通过依赖注入持有网关与缓存实现，不依赖任何全局
//! 变量；界面层通过 getter 读取派生视图，通过事件广播感知变化。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::cache::DurableCache;
use crate::categories::{CategoryManager, CategoryNode};
use crate::collections::{CollectionManager, DefaultDataSet};
use crate::engine::{ProgressEngine, SyncConfig};
use crate::gateway::RemoteGateway;
use crate::identity::IdentityBinding;
use crate::models::{
    now_iso, now_millis, speech_code_for, synthetic_id, ItemKind, ItemPayload, Language,
    LearningItem, QaFields, QuizRecord, SentenceFields, WordFields,
};
use crate::progress::{ItemRef, ReviewProgress, ReviewSets};
use crate::{StoreError, StoreResult};

/// 事件广播通道容量
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ============================================================
// StoreState - 共享状态
// ============================================================

/// 仓库共享状态
///
/// 所有操作都在单一协作式任务序列中通过互斥锁访问该状态；
/// 锁从不跨越 I/O 挂起点持有。
pub struct StoreState {
    pub words: Vec<LearningItem>,
    pub sentences: Vec<LearningItem>,
    pub qa: Vec<LearningItem>,
    pub progress: ReviewProgress,
    pub sets: ReviewSets,
    pub quiz_history: Vec<QuizRecord>,
    pub current_language: String,
    pub supported_languages: Vec<Language>,
    /// 语言代码 -> 分类森林
    pub categories: HashMap<String, Vec<CategoryNode>>,
    pub is_online: bool,
    pub sync_in_progress: bool,
    pub last_sync_time: Option<String>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            words: Vec::new(),
            sentences: Vec::new(),
            qa: Vec::new(),
            progress: ReviewProgress::default(),
            sets: ReviewSets::default(),
            quiz_history: Vec::new(),
            current_language: "ja".to_string(),
            supported_languages: crate::models::default_languages(),
            categories: HashMap::new(),
            is_online: false,
            sync_in_progress: false,
            last_sync_time: None,
        }
    }
}

impl StoreState {
    /// 某类型的条目集合
    pub fn items(&self, kind: ItemKind) -> &[LearningItem] {
        match kind {
            ItemKind::Word => &self.words,
            ItemKind::Sentence => &self.sentences,
            ItemKind::Qa => &self.qa,
        }
    }

    /// 某类型条目集合的可变引用
    pub fn items_mut(&mut self, kind: ItemKind) -> &mut Vec<LearningItem> {
        match kind {
            ItemKind::Word => &mut self.words,
            ItemKind::Sentence => &mut self.sentences,
            ItemKind::Qa => &mut self.qa,
        }
    }

    /// 是否已有任何学习数据
    pub fn has_initial_data(&self) -> bool {
        !self.words.is_empty() || !self.sentences.is_empty() || !self.qa.is_empty()
    }
}

// ============================================================
// StoreEvent - 仓库事件
// ============================================================

/// 仓库事件
///
/// 界面层通过 [`LearnStore::subscribe_events`] 订阅，替代
/// 回调注册。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// 某类型的条目集合已更新
    ItemsChanged(ItemKind),
    /// 复习进度已更新
    ProgressChanged,
    /// 当前学习语言已切换
    LanguageChanged(String),
    /// 某语言的分类树已更新
    CategoriesChanged(String),
    /// 一轮云端同步完成
    SyncCompleted,
    /// 身份绑定变化
    OwnerChanged(Option<String>),
}

// ============================================================
// LearnStore - 门面
// ============================================================

/// 数据仓库门面
pub struct LearnStore<G: RemoteGateway, C: DurableCache> {
    pub(crate) state: Arc<Mutex<StoreState>>,
    pub(crate) gateway: Arc<G>,
    pub(crate) cache: Arc<C>,
    pub(crate) identity: Arc<IdentityBinding>,
    pub(crate) events: broadcast::Sender<StoreEvent>,
    pub(crate) engine: Arc<ProgressEngine<G, C>>,
    pub(crate) collections: Arc<CollectionManager<G, C>>,
    pub(crate) categories: CategoryManager<G, C>,
    pub(crate) config: SyncConfig,
}

impl<G: RemoteGateway, C: DurableCache> LearnStore<G, C> {
    /// 用默认同步配置创建仓库
    pub fn new(gateway: G, cache: C) -> Self {
        Self::with_config(gateway, cache, SyncConfig::default())
    }

    /// 用自定义同步配置创建仓库
    pub fn with_config(gateway: G, cache: C, config: SyncConfig) -> Self {
        let state = Arc::new(Mutex::new(StoreState::default()));
        let gateway = Arc::new(gateway);
        let cache = Arc::new(cache);
        let identity = Arc::new(IdentityBinding::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let engine = Arc::new(ProgressEngine::new(
            Arc::clone(&state),
            Arc::clone(&gateway),
            Arc::clone(&cache),
            Arc::clone(&identity),
            events.clone(),
            config.clone(),
        ));
        let collections = Arc::new(CollectionManager::new(
            Arc::clone(&state),
            Arc::clone(&gateway),
            Arc::clone(&cache),
            Arc::clone(&identity),
            events.clone(),
            Arc::clone(&engine),
        ));
        let categories = CategoryManager::new(
            Arc::clone(&state),
            Arc::clone(&gateway),
            Arc::clone(&cache),
            Arc::clone(&identity),
            events.clone(),
        );

        Self {
            state,
            gateway,
            cache,
            identity,
            events,
            engine,
            collections,
            categories,
            config,
        }
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> StoreResult<R> {
        let mut guard = self
            .state
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(f(&mut guard))
    }

    // ========== 生命周期 ==========

    /// 启动时的本地初始化：语言列表、复习进度、身份、分类树
    /// 全部从缓存恢复，不触网。
    pub fn initialize(&self) {
        self.collections.load_languages_from_cache();
        self.engine.load_local();
        self.identity.restore_from_cache(self.cache.as_ref());
        if let Ok(language) = self.with_state(|state| state.current_language.clone()) {
            self.categories.load_from_cache(&language);
        }
    }

    /// 绑定身份并上线
    ///
    /// 先全量同步（集合 + 复习进度对账），再建立实时订阅。同步
    /// 失败不阻止订阅建立，本地数据继续可用。
    pub async fn sign_in(&self, owner_id: &str) -> StoreResult<()> {
        self.identity.set_owner(Some(owner_id.to_string()));
        self.identity.persist_to_cache(self.cache.as_ref());
        self.with_state(|state| state.is_online = true)?;
        let _ = self
            .events
            .send(StoreEvent::OwnerChanged(Some(owner_id.to_string())));

        log::info!("开始云端同步...");
        if let Err(e) = self.collections.sync_from_cloud().await {
            log::error!("云端同步失败: {}", e);
        }
        self.collections.rebind_subscriptions()?;

        let language = self.with_state(|state| state.current_language.clone())?;
        self.categories.sync_from_cloud(&language).await;

        log::info!("云端同步完成，实时监听已启动");
        Ok(())
    }

    /// 解除身份绑定并离线
    ///
    /// 先同步取消全部订阅，再清身份；之后旧订阅的任何迟到快照
    /// 都不会再落到状态上。
    pub fn sign_out(&self) -> StoreResult<()> {
        self.collections.cancel_subscriptions();
        self.with_state(|state| state.is_online = false)?;
        self.identity.set_owner(None);
        self.identity.persist_to_cache(self.cache.as_ref());
        let _ = self.events.send(StoreEvent::OwnerChanged(None));
        log::info!("设备未认证，停止云端同步");
        Ok(())
    }

    /// 手动触发一次全量同步
    pub async fn manual_sync(&self) -> StoreResult<()> {
        let online = self.with_state(|state| state.is_online)?;
        if !online {
            return Err(StoreError::Offline(
                "需要网络连接才能同步数据".to_string(),
            ));
        }
        self.collections.sync_from_cloud().await
    }

    /// 订阅仓库事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    // ========== 条目操作（委托集合管理器） ==========

    pub async fn add_word(&self, word: WordFields) -> StoreResult<crate::gateway::Document> {
        self.collections.add_item(ItemPayload::Word(word)).await
    }

    pub async fn add_sentence(
        &self,
        sentence: SentenceFields,
    ) -> StoreResult<crate::gateway::Document> {
        self.collections
            .add_item(ItemPayload::Sentence(sentence))
            .await
    }

    pub async fn add_qa(&self, qa: QaFields) -> StoreResult<crate::gateway::Document> {
        self.collections.add_item(ItemPayload::Qa(qa)).await
    }

    pub async fn update_item(&self, kind: ItemKind, id: &str, patch: Value) -> StoreResult<()> {
        self.collections.update_item(kind, id, patch).await
    }

    pub async fn delete_item(&self, kind: ItemKind, id: &str) -> StoreResult<()> {
        self.collections.delete_item(kind, id).await
    }

    pub async fn switch_language(&self, code: &str) -> StoreResult<()> {
        self.collections.switch_language(code).await
    }

    pub fn add_language(&self, language: Language) -> StoreResult<()> {
        self.collections.add_language(language)
    }

    pub async fn remove_language(&self, code: &str) -> StoreResult<()> {
        self.collections.remove_language(code).await
    }

    pub async fn initialize_default_data(&self, defaults: &DefaultDataSet) -> StoreResult<usize> {
        self.collections.initialize_default_data(defaults).await
    }

    // ========== 复习操作（委托对账引擎） ==========

    pub async fn mark_reviewed(
        &self,
        kind: ItemKind,
        id: &str,
        clear_incorrect: bool,
    ) -> StoreResult<()> {
        self.engine.mark_reviewed(kind, id, clear_incorrect).await
    }

    pub async fn mark_incorrect(&self, kind: ItemKind, id: &str) -> StoreResult<()> {
        self.engine.mark_incorrect(kind, id).await
    }

    pub async fn mark_mastered(&self, kind: ItemKind, id: &str) -> StoreResult<()> {
        self.engine.mark_mastered(kind, id).await
    }

    pub async fn clear_incorrect_items(&self) -> StoreResult<()> {
        self.engine.clear_all_incorrect().await
    }

    pub async fn clear_mastered_items(&self) -> StoreResult<()> {
        self.engine.clear_all_mastered().await
    }

    pub fn is_due_for_review(&self, kind: ItemKind, id: &str) -> StoreResult<bool> {
        self.engine.is_due_for_review(kind, id)
    }

    // ========== 分类操作（委托分类管理器） ==========

    pub async fn add_category(
        &self,
        language: &str,
        parent_path: &[String],
        name: &str,
    ) -> StoreResult<()> {
        self.categories.add_category(language, parent_path, name).await
    }

    pub async fn rename_category(
        &self,
        language: &str,
        path: &[String],
        new_name: &str,
    ) -> StoreResult<()> {
        self.categories.rename_category(language, path, new_name).await
    }

    pub async fn delete_category(&self, language: &str, path: &[String]) -> StoreResult<()> {
        self.categories.delete_category(language, path).await
    }

    pub fn category_trees(&self, language: &str) -> StoreResult<Vec<CategoryNode>> {
        self.categories.trees(language)
    }

    // ========== 派生视图 getter ==========

    /// 进入普通复习区的条目：无永久标记，且从未复习或距上次复习
    /// 超过配置的间隔
    pub fn items_to_review(&self, kind: ItemKind) -> StoreResult<Vec<LearningItem>> {
        let now = now_millis();
        let interval = self.config.review_interval_ms;
        self.with_state(|state| {
            state
                .items(kind)
                .iter()
                .filter(|item| {
                    state
                        .progress
                        .is_due(&ItemRef::new(kind, item.id.as_str()), now, interval)
                })
                .cloned()
                .collect()
        })
    }

    pub fn words_to_review(&self) -> StoreResult<Vec<LearningItem>> {
        self.items_to_review(ItemKind::Word)
    }

    pub fn sentences_to_review(&self) -> StoreResult<Vec<LearningItem>> {
        self.items_to_review(ItemKind::Sentence)
    }

    pub fn qa_to_review(&self) -> StoreResult<Vec<LearningItem>> {
        self.items_to_review(ItemKind::Qa)
    }

    /// 集中复习区的条目（带"没记住"标记）
    pub fn incorrect_items(&self, kind: ItemKind) -> StoreResult<Vec<LearningItem>> {
        self.with_state(|state| {
            state
                .items(kind)
                .iter()
                .filter(|item| state.sets.incorrect_contains(kind, &item.id))
                .cloned()
                .collect()
        })
    }

    /// 已掌握的条目
    pub fn mastered_items(&self, kind: ItemKind) -> StoreResult<Vec<LearningItem>> {
        self.with_state(|state| {
            state
                .items(kind)
                .iter()
                .filter(|item| state.sets.mastered_contains(kind, &item.id))
                .cloned()
                .collect()
        })
    }

    /// 集中复习区条目总数（按当前集合中实际存在的条目计）
    pub fn total_incorrect_items(&self) -> StoreResult<usize> {
        self.with_state(|state| {
            ItemKind::ALL
                .iter()
                .map(|kind| {
                    state
                        .items(*kind)
                        .iter()
                        .filter(|item| state.sets.incorrect_contains(*kind, &item.id))
                        .count()
                })
                .sum()
        })
    }

    pub fn items(&self, kind: ItemKind) -> StoreResult<Vec<LearningItem>> {
        self.with_state(|state| state.items(kind).to_vec())
    }

    pub fn total_items(&self, kind: ItemKind) -> StoreResult<usize> {
        self.with_state(|state| state.items(kind).len())
    }

    pub fn has_initial_data(&self) -> StoreResult<bool> {
        self.with_state(|state| state.has_initial_data())
    }

    pub fn current_language(&self) -> StoreResult<String> {
        self.with_state(|state| state.current_language.clone())
    }

    /// 当前语言的完整信息
    pub fn current_language_info(&self) -> StoreResult<Option<Language>> {
        self.with_state(|state| {
            state
                .supported_languages
                .iter()
                .find(|language| language.code == state.current_language)
                .cloned()
        })
    }

    pub fn supported_languages(&self) -> StoreResult<Vec<Language>> {
        self.with_state(|state| state.supported_languages.clone())
    }

    pub fn is_online(&self) -> StoreResult<bool> {
        self.with_state(|state| state.is_online)
    }

    pub fn last_sync_time(&self) -> StoreResult<Option<String>> {
        self.with_state(|state| state.last_sync_time.clone())
    }

    /// 语言代码对应的语音代码
    pub fn speech_code(&self, language_code: &str) -> &'static str {
        speech_code_for(language_code)
    }

    // ========== 测验历史 ==========

    /// 追加一条测验结果
    pub fn add_quiz_result(&self, details: Map<String, Value>) -> StoreResult<QuizRecord> {
        let record = QuizRecord {
            id: synthetic_id(),
            completed_at: now_iso(),
            details,
        };
        self.with_state(|state| state.quiz_history.push(record.clone()))?;
        Ok(record)
    }

    pub fn quiz_history(&self) -> StoreResult<Vec<QuizRecord>> {
        self.with_state(|state| state.quiz_history.clone())
    }

    // ========== 组件访问 ==========

    pub fn engine(&self) -> &ProgressEngine<G, C> {
        &self.engine
    }

    pub fn collection_manager(&self) -> &CollectionManager<G, C> {
        &self.collections
    }

    pub fn category_manager(&self) -> &CategoryManager<G, C> {
        &self.categories
    }

    pub fn identity(&self) -> &IdentityBinding {
        &self.identity
    }
}
