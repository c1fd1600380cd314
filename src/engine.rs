//! 复习进度对账引擎
//!
//! 在本地缓存与远端聚合文档之间维护 [`ReviewProgress`] 的一致性。
//! 多台设备可能并发写同一份远端文档，对账算法保证收敛且永不静默
//! 丢失任何一个永久标记；普通复习时间戳按"本地覆盖远端"的
//! 最后写入为准策略处理（丢几小时的新鲜度代价很低）。
//!
//! 远端读取失败时按线性退避重试，重试耗尽后降级使用本地缓存，
//! 不向调用方抛错；缓存读写失败只记警告，会话继续纯内存运行。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::cache::{DurableCache, KEY_REVIEW_PROGRESS};
use crate::gateway::RemoteGateway;
use crate::identity::IdentityBinding;
use crate::models::{now_millis, ItemKind};
use crate::progress::{ItemRef, ReviewProgress, REVIEW_INTERVAL_MS};
use crate::store::{StoreEvent, StoreState};
use crate::{StoreError, StoreResult};

// ============================================================
// SyncConfig - 同步配置
// ============================================================

/// 同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 远端读取的最大重试次数
    pub max_retries: u32,
    /// 重试基础间隔（毫秒），第 n 次重试等待 n 倍间隔
    pub retry_delay_ms: u64,
    /// 普通复习区的重复出现间隔（毫秒）
    pub review_interval_ms: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            review_interval_ms: REVIEW_INTERVAL_MS,
        }
    }
}

// ============================================================
// ProgressEngine - 对账引擎
// ============================================================

/// 复习进度对账引擎
pub struct ProgressEngine<G, C> {
    state: Arc<Mutex<StoreState>>,
    gateway: Arc<G>,
    cache: Arc<C>,
    identity: Arc<IdentityBinding>,
    events: broadcast::Sender<StoreEvent>,
    config: SyncConfig,
}

impl<G: RemoteGateway, C: DurableCache> ProgressEngine<G, C> {
    pub fn new(
        state: Arc<Mutex<StoreState>>,
        gateway: Arc<G>,
        cache: Arc<C>,
        identity: Arc<IdentityBinding>,
        events: broadcast::Sender<StoreEvent>,
        config: SyncConfig,
    ) -> Self {
        Self {
            state,
            gateway,
            cache,
            identity,
            events,
            config,
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

    // ========== 加载与拉取 ==========

    /// 从本地缓存加载复习进度
    ///
    /// 缓存不可用或内容损坏时保持当前内存状态不变，只记警告，
    /// 绝不抛错。加载结果与内存状态做会话合并：本次会话已产生的
    /// "没记住"标记优先于缓存里的旧值。
    pub fn load_local(&self) {
        let loaded = match self.cache.get(KEY_REVIEW_PROGRESS) {
            Ok(Some(text)) => match serde_json::from_str::<Map<String, Value>>(&text) {
                Ok(map) => ReviewProgress::from_flat_map(&map),
                Err(e) => {
                    log::warn!("本地复习进度内容损坏，保持内存状态: {}", e);
                    return;
                }
            },
            Ok(None) => {
                log::info!("本地没有复习进度数据");
                return;
            }
            Err(e) => {
                log::warn!("本地存储不可用，跳过本地加载: {}", e);
                return;
            }
        };

        let result = self.with_state(|state| {
            state.progress.merge_loaded(loaded);
            state.sets.rebuild(&state.progress);
            state.progress.len()
        });
        match result {
            Ok(count) => log::info!("从本地缓存加载复习进度: {} 条记录", count),
            Err(e) => log::warn!("加载复习进度时状态不可用: {}", e),
        }
    }

    /// 拉取远端复习进度（单次尝试）
    ///
    /// 聚合文档不存在时返回空表；表内容按不透明 JSON 处理，仅做
    /// 前缀切分。
    pub async fn pull_remote(&self) -> StoreResult<ReviewProgress> {
        let owner = self
            .identity
            .current_owner_id()
            .ok_or_else(|| StoreError::Offline("未绑定身份，无法拉取复习进度".to_string()))?;

        match self
            .gateway
            .get_owner_doc(&owner, KEY_REVIEW_PROGRESS)
            .await?
        {
            Some(Value::Object(map)) => Ok(ReviewProgress::from_flat_map(&map)),
            Some(other) => {
                log::warn!("远端复习进度不是对象，按空表处理: {}", other);
                Ok(ReviewProgress::default())
            }
            None => Ok(ReviewProgress::default()),
        }
    }

    /// 带线性退避重试的远端拉取
    ///
    /// 第 n 次重试前等待 `retry_delay_ms * n`；只对远端瞬时故障
    /// 重试，重试耗尽后返回最后一次错误。
    async fn pull_remote_with_retry(&self) -> StoreResult<ReviewProgress> {
        let mut attempt: u32 = 0;
        loop {
            match self.pull_remote().await {
                Ok(progress) => return Ok(progress),
                Err(e) if matches!(e, StoreError::RemoteTransient(_)) => {
                    if attempt >= self.config.max_retries {
                        log::error!("拉取复习进度重试次数已达上限: {}", e);
                        return Err(e);
                    }
                    attempt += 1;
                    let delay = self.config.retry_delay_ms * u64::from(attempt);
                    log::warn!(
                        "拉取复习进度失败，{}ms 后重试 ({}/{}): {}",
                        delay,
                        attempt,
                        self.config.max_retries,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ========== 对账 ==========

    /// 执行一次完整对账
    ///
    /// 1. 加载本地缓存（含会话合并）；
    /// 2. 拉取远端聚合文档（带重试）；
    /// 3. 合并：永久标记取并集，其余键本地覆盖远端；
    /// 4. 将合并结果整体写回缓存与远端；
    /// 5. 重建派生集合。
    ///
    /// 离线或远端持续失败时降级为仅使用本地数据，返回 Ok。
    pub async fn reconcile(&self) -> StoreResult<()> {
        self.load_local();

        let online = self.with_state(|state| state.is_online)?;
        if !online {
            log::info!("设备未在线，复习进度只从本地加载");
            self.with_state(|state| state.sets.rebuild(&state.progress))?;
            self.emit(StoreEvent::ProgressChanged);
            return Ok(());
        }

        let remote = match self.pull_remote_with_retry().await {
            Ok(remote) => remote,
            Err(e) => {
                log::error!("从云端同步复习进度失败，使用本地数据: {}", e);
                self.with_state(|state| state.sets.rebuild(&state.progress))?;
                self.emit(StoreEvent::ProgressChanged);
                return Ok(());
            }
        };

        let (merged_len, remote_len) = self.with_state(|state| {
            let merged = ReviewProgress::reconciled(&state.progress, &remote);
            let lens = (merged.len(), remote.len());
            state.progress = merged;
            state.sets.rebuild(&state.progress);
            lens
        })?;
        log::info!(
            "复习进度合并完成: 远端 {} 条, 合并后 {} 条",
            remote_len,
            merged_len
        );

        self.persist().await;
        self.emit(StoreEvent::ProgressChanged);
        Ok(())
    }

    /// 将当前复习进度整体写入两个汇：本地缓存与远端聚合文档
    ///
    /// 每个汇都是完整对象的原子写入，绝不增量写；任一汇失败只
    /// 记录日志，不向上抛出。
    pub async fn persist(&self) {
        let snapshot = self.with_state(|state| (state.progress.to_flat_map(), state.is_online));
        let (flat, online) = match snapshot {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("读取进度快照失败，跳过保存: {}", e);
                return;
            }
        };

        match serde_json::to_string(&flat) {
            Ok(text) => {
                if let Err(e) = self.cache.set(KEY_REVIEW_PROGRESS, &text) {
                    log::warn!("本地存储不可用，跳过本地保存: {}", e);
                }
            }
            Err(e) => log::warn!("复习进度序列化失败: {}", e),
        }

        if online {
            if let Some(owner) = self.identity.current_owner_id() {
                if let Err(e) = self
                    .gateway
                    .set_owner_doc_merge(&owner, KEY_REVIEW_PROGRESS, Value::Object(flat))
                    .await
                {
                    log::error!("同步复习进度到云端失败: {}", e);
                }
            }
        }
    }

    // ========== 复习操作 ==========

    /// 标记条目已复习
    ///
    /// 写入复习时间戳；仅当 `clear_incorrect` 为 true 时才把条目
    /// 移出集中复习区——复习过不等于记住了，集中复习区是永久
    /// 记忆体，只有用户明确点"记住了"才移除。
    pub async fn mark_reviewed(
        &self,
        kind: ItemKind,
        id: &str,
        clear_incorrect: bool,
    ) -> StoreResult<()> {
        let item = ItemRef::new(kind, id);
        self.with_state(|state| {
            state.progress.set_timestamp(item.clone(), now_millis());
            if clear_incorrect && state.progress.remove_incorrect(&item) {
                log::info!("条目已从集中复习区移除: {}_{}", kind, id);
            }
            state.sets.rebuild(&state.progress);
        })?;

        self.persist().await;
        self.emit(StoreEvent::ProgressChanged);
        Ok(())
    }

    /// 标记条目"没记住"（加入集中复习区，幂等）
    pub async fn mark_incorrect(&self, kind: ItemKind, id: &str) -> StoreResult<()> {
        let newly = self.with_state(|state| {
            let newly = state.progress.set_incorrect(ItemRef::new(kind, id));
            state.sets.rebuild(&state.progress);
            newly
        })?;
        if newly {
            log::info!("条目已加入集中复习区: {}_{}", kind, id);
        }

        self.persist().await;
        self.emit(StoreEvent::ProgressChanged);
        Ok(())
    }

    /// 标记条目"已掌握"
    ///
    /// 同时移除同一条目的"没记住"标记：掌握优先于待复习。
    pub async fn mark_mastered(&self, kind: ItemKind, id: &str) -> StoreResult<()> {
        self.with_state(|state| {
            state.progress.set_mastered(ItemRef::new(kind, id));
            state.sets.rebuild(&state.progress);
        })?;
        log::info!("条目已标记为已掌握: {}_{}", kind, id);

        self.persist().await;
        self.emit(StoreEvent::ProgressChanged);
        Ok(())
    }

    /// 清空集中复习区
    pub async fn clear_all_incorrect(&self) -> StoreResult<()> {
        self.with_state(|state| {
            state.progress.clear_incorrect_flags();
            state.sets.rebuild(&state.progress);
        })?;

        self.persist().await;
        self.emit(StoreEvent::ProgressChanged);
        Ok(())
    }

    /// 清空全部"已掌握"标记
    pub async fn clear_all_mastered(&self) -> StoreResult<()> {
        self.with_state(|state| {
            state.progress.clear_mastered_flags();
            state.sets.rebuild(&state.progress);
        })?;

        self.persist().await;
        self.emit(StoreEvent::ProgressChanged);
        Ok(())
    }

    // ========== 到期判断 ==========

    /// 条目是否进入普通复习区（以当前时刻判断）
    pub fn is_due_for_review(&self, kind: ItemKind, id: &str) -> StoreResult<bool> {
        self.is_due_at(kind, id, now_millis())
    }

    /// 条目在指定时刻是否到期
    pub fn is_due_at(&self, kind: ItemKind, id: &str, now_millis: i64) -> StoreResult<bool> {
        let item = ItemRef::new(kind, id);
        let interval = self.config.review_interval_ms;
        self.with_state(|state| state.progress.is_due(&item, now_millis, interval))
    }
}

// ============================================================
// 测试
// ============================================================
