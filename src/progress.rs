//! 复习进度模型
//!
//! 历史存储格式是一张扁平的字符串键值表，通过键前缀区分三类数据：
//! - `"{type}_{id}" -> epoch 毫秒`：最近复习时间；
//! - `"incorrect_{type}_{id}" -> true`：永久"没记住"标记；
//! - `"mastered_{type}_{id}" -> true`：永久"已掌握"标记。
//!
//! 内存中将其拆为三张显式表加一个不透明余量（无法识别的键原样
//! 保留并随写回往返），仅在存储边界序列化回扁平格式以保持兼容。
//!
//! 已知限制：进度键不携带语言信息，而条目集合是按语言划分的，
//! 不同语言集合中的同名 id 会共用一条进度记录。此行为与历史
//! 数据格式一致，这里原样保留。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde_json::{Map, Number, Value};

use crate::models::ItemKind;

/// 普通复习区的重复出现间隔：24 小时
pub const REVIEW_INTERVAL_MS: i64 = 24 * 60 * 60 * 1000;

// ============================================================
// ItemRef - 条目引用
// ============================================================

/// 条目引用：类型 + id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemRef {
    pub kind: ItemKind,
    pub id: String,
}

impl ItemRef {
    pub fn new(kind: ItemKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// 复习时间戳在扁平表中的键
    pub fn timestamp_key(&self) -> String {
        format!("{}_{}", self.kind.as_str(), self.id)
    }

    /// "没记住"标记在扁平表中的键
    pub fn incorrect_key(&self) -> String {
        format!("incorrect_{}_{}", self.kind.as_str(), self.id)
    }

    /// "已掌握"标记在扁平表中的键
    pub fn mastered_key(&self) -> String {
        format!("mastered_{}_{}", self.kind.as_str(), self.id)
    }

    /// 从 `"{type}_{id}"` 形式的键解析
    ///
    /// id 中允许出现下划线，只在类型前缀后切一刀。
    pub fn parse(key: &str) -> Option<Self> {
        for kind in ItemKind::ALL {
            if let Some(id) = key.strip_prefix(kind.as_str()) {
                if let Some(id) = id.strip_prefix('_') {
                    if !id.is_empty() {
                        return Some(Self::new(kind, id));
                    }
                }
            }
        }
        None
    }
}

// ============================================================
// ReviewProgress - 复习进度
// ============================================================

/// 复习进度：三张显式表 + 不透明余量
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReviewProgress {
    /// 最近复习时间（epoch 毫秒）
    pub timestamps: BTreeMap<ItemRef, i64>,
    /// 永久"没记住"标记
    pub incorrect: BTreeSet<ItemRef>,
    /// 永久"已掌握"标记
    pub mastered: BTreeSet<ItemRef>,
    /// 无法识别的键，原样往返
    pub extra: BTreeMap<String, Value>,
}

impl ReviewProgress {
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
            && self.incorrect.is_empty()
            && self.mastered.is_empty()
            && self.extra.is_empty()
    }

    /// 记录条目总数（按扁平表键计）
    pub fn len(&self) -> usize {
        self.timestamps.len() + self.incorrect.len() + self.mastered.len() + self.extra.len()
    }

    // ========== 扁平格式编解码 ==========

    /// 从扁平键值表解析
    ///
    /// 标记键以存在为准（历史数据中值恒为 true）；时间戳键要求
    /// 数值；其余一律进入 `extra`。
    pub fn from_flat_map(map: &Map<String, Value>) -> Self {
        let mut progress = Self::default();

        for (key, value) in map {
            if let Some(rest) = key.strip_prefix("incorrect_") {
                if let Some(item) = ItemRef::parse(rest) {
                    progress.incorrect.insert(item);
                    continue;
                }
            } else if let Some(rest) = key.strip_prefix("mastered_") {
                if let Some(item) = ItemRef::parse(rest) {
                    progress.mastered.insert(item);
                    continue;
                }
            } else if let Some(item) = ItemRef::parse(key) {
                if let Some(millis) = value.as_i64() {
                    progress.timestamps.insert(item, millis);
                    continue;
                }
            }
            progress.extra.insert(key.clone(), value.clone());
        }

        progress
    }

    /// 序列化为扁平键值表
    pub fn to_flat_map(&self) -> Map<String, Value> {
        let mut map = Map::new();

        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }
        for (item, millis) in &self.timestamps {
            map.insert(item.timestamp_key(), Value::Number(Number::from(*millis)));
        }
        for item in &self.incorrect {
            map.insert(item.incorrect_key(), Value::Bool(true));
        }
        for item in &self.mastered {
            map.insert(item.mastered_key(), Value::Bool(true));
        }

        map
    }

    // ========== 合并规则 ==========

    /// 加载本地缓存时的会话合并
    ///
    /// 已在内存中的"没记住"标记优先于刚加载的数据（本次会话新增
    /// 的标记不能被旧缓存覆盖）；其余内容以加载结果为准。
    pub fn merge_loaded(&mut self, loaded: ReviewProgress) {
        let session_incorrect = std::mem::take(&mut self.incorrect);
        *self = loaded;
        self.incorrect.extend(session_incorrect);
    }

    /// 本地与远端的对账合并
    ///
    /// 永久标记取两侧并集（任何一侧出现过的标记都不丢失）；
    /// 时间戳与不透明键以远端为底、本地覆盖（键冲突时本地胜出，
    /// 即使远端时间戳更新）。标记之间不做交叉裁决：同一条目在
    /// 两侧分别带有 incorrect 与 mastered 时，两个标记都保留。
    pub fn reconciled(local: &ReviewProgress, remote: &ReviewProgress) -> ReviewProgress {
        let mut merged = ReviewProgress::default();

        merged.timestamps = remote.timestamps.clone();
        merged.timestamps.extend(
            local
                .timestamps
                .iter()
                .map(|(item, millis)| (item.clone(), *millis)),
        );

        merged.extra = remote.extra.clone();
        merged
            .extra
            .extend(local.extra.iter().map(|(k, v)| (k.clone(), v.clone())));

        merged.incorrect = remote.incorrect.union(&local.incorrect).cloned().collect();
        merged.mastered = remote.mastered.union(&local.mastered).cloned().collect();

        merged
    }

    /// 导入数据时的覆盖合并：导入内容在键冲突时胜出，
    /// 永久标记取并集
    pub fn overlay(&mut self, imported: ReviewProgress) {
        self.timestamps.extend(imported.timestamps);
        self.incorrect.extend(imported.incorrect);
        self.mastered.extend(imported.mastered);
        self.extra.extend(imported.extra);
    }

    // ========== 基本操作 ==========

    /// 写入复习时间戳
    pub fn set_timestamp(&mut self, item: ItemRef, millis: i64) {
        self.timestamps.insert(item, millis);
    }

    /// 设置"没记住"标记（幂等）
    pub fn set_incorrect(&mut self, item: ItemRef) -> bool {
        self.incorrect.insert(item)
    }

    /// 移除"没记住"标记
    pub fn remove_incorrect(&mut self, item: &ItemRef) -> bool {
        self.incorrect.remove(item)
    }

    /// 设置"已掌握"标记，并移除同一条目的"没记住"标记
    ///
    /// 反向不成立：设置"没记住"不会动"已掌握"标记。
    pub fn set_mastered(&mut self, item: ItemRef) {
        self.incorrect.remove(&item);
        self.mastered.insert(item);
    }

    /// 清空全部"没记住"标记
    pub fn clear_incorrect_flags(&mut self) {
        self.incorrect.clear();
    }

    /// 清空全部"已掌握"标记
    pub fn clear_mastered_flags(&mut self) {
        self.mastered.clear();
    }

    /// 判断条目是否进入普通复习区
    ///
    /// 带任一永久标记的条目只出现在各自的专属队列中；其余条目
    /// 在从未复习或距上次复习超过间隔时到期。
    pub fn is_due(&self, item: &ItemRef, now_millis: i64, interval_ms: i64) -> bool {
        if self.incorrect.contains(item) || self.mastered.contains(item) {
            return false;
        }
        match self.timestamps.get(item) {
            None => true,
            Some(last) => now_millis - last >= interval_ms,
        }
    }
}

// ============================================================
// ReviewSets - 派生集合
// ============================================================

/// 按类型划分的派生 id 集合
///
/// 仅用于 O(1) 成员判断，非权威数据；每次进度加载、合并或变更
/// 后由线性扫描重建。必须先持久化 [`ReviewProgress`] 再信任
/// 这里的内容。
#[derive(Debug, Clone, Default)]
pub struct ReviewSets {
    incorrect: HashMap<ItemKind, HashSet<String>>,
    mastered: HashMap<ItemKind, HashSet<String>>,
}

impl ReviewSets {
    /// 从进度全量重建
    pub fn rebuild(&mut self, progress: &ReviewProgress) {
        self.incorrect.clear();
        self.mastered.clear();
        for item in &progress.incorrect {
            self.incorrect
                .entry(item.kind)
                .or_default()
                .insert(item.id.clone());
        }
        for item in &progress.mastered {
            self.mastered
                .entry(item.kind)
                .or_default()
                .insert(item.id.clone());
        }
    }

    pub fn incorrect_contains(&self, kind: ItemKind, id: &str) -> bool {
        self.incorrect
            .get(&kind)
            .map(|set| set.contains(id))
            .unwrap_or(false)
    }

    pub fn mastered_contains(&self, kind: ItemKind, id: &str) -> bool {
        self.mastered
            .get(&kind)
            .map(|set| set.contains(id))
            .unwrap_or(false)
    }

    pub fn incorrect_count(&self, kind: ItemKind) -> usize {
        self.incorrect.get(&kind).map(HashSet::len).unwrap_or(0)
    }

    pub fn mastered_count(&self, kind: ItemKind) -> usize {
        self.mastered.get(&kind).map(HashSet::len).unwrap_or(0)
    }

    pub fn total_incorrect(&self) -> usize {
        ItemKind::ALL
            .iter()
            .map(|kind| self.incorrect_count(*kind))
            .sum()
    }

    pub fn total_mastered(&self) -> usize {
        ItemKind::ALL
            .iter()
            .map(|kind| self.mastered_count(*kind))
            .sum()
    }
}

// ============================================================
// 测试
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn word(id: &str) -> ItemRef {
        ItemRef::new(ItemKind::Word, id)
    }

    #[test]
    fn test_item_ref_parse() {
        assert_eq!(ItemRef::parse("word_abc"), Some(word("abc")));
        assert_eq!(
            ItemRef::parse("sentence_x_y"),
            Some(ItemRef::new(ItemKind::Sentence, "x_y"))
        );
        assert_eq!(ItemRef::parse("qa_1"), Some(ItemRef::new(ItemKind::Qa, "1")));
        assert_eq!(ItemRef::parse("word_"), None);
        assert_eq!(ItemRef::parse("verb_1"), None);
    }

    #[test]
    fn test_flat_map_roundtrip_preserves_unknown_keys() {
        let mut map = Map::new();
        map.insert("word_5".to_string(), json!(1700000000000i64));
        map.insert("incorrect_sentence_9".to_string(), json!(true));
        map.insert("mastered_qa_3".to_string(), json!(true));
        map.insert("schema_hint".to_string(), json!("v1"));
        map.insert("word_broken".to_string(), json!("not-a-number"));

        let progress = ReviewProgress::from_flat_map(&map);
        assert_eq!(progress.timestamps.len(), 1);
        assert_eq!(progress.incorrect.len(), 1);
        assert_eq!(progress.mastered.len(), 1);
        // 非数值时间戳与陌生键都进入 extra
        assert_eq!(progress.extra.len(), 2);

        let back = progress.to_flat_map();
        assert_eq!(back, map);
    }

    #[test]
    fn test_merge_loaded_keeps_session_incorrect() {
        let mut current = ReviewProgress::default();
        current.set_incorrect(word("new-this-session"));
        current.set_timestamp(word("stale"), 1);

        let mut loaded = ReviewProgress::default();
        loaded.set_timestamp(word("stale"), 42);
        loaded.set_incorrect(word("from-disk"));

        current.merge_loaded(loaded);

        assert!(current.incorrect.contains(&word("new-this-session")));
        assert!(current.incorrect.contains(&word("from-disk")));
        // 时间戳以加载结果为准
        assert_eq!(current.timestamps.get(&word("stale")), Some(&42));
    }

    #[test]
    fn test_reconcile_unions_permanent_flags() {
        let mut local = ReviewProgress::default();
        local.set_incorrect(word("a"));

        let mut remote = ReviewProgress::default();
        remote.set_incorrect(word("b"));
        remote.mastered.insert(word("c"));

        let merged = ReviewProgress::reconciled(&local, &remote);
        assert!(merged.incorrect.contains(&word("a")));
        assert!(merged.incorrect.contains(&word("b")));
        assert!(merged.mastered.contains(&word("c")));
    }

    #[test]
    fn test_reconcile_local_timestamp_wins_even_when_older() {
        let mut local = ReviewProgress::default();
        local.set_timestamp(word("1"), 100);

        let mut remote = ReviewProgress::default();
        remote.set_timestamp(word("1"), 999);
        remote.set_timestamp(word("2"), 7);

        let merged = ReviewProgress::reconciled(&local, &remote);
        assert_eq!(merged.timestamps.get(&word("1")), Some(&100));
        assert_eq!(merged.timestamps.get(&word("2")), Some(&7));
    }

    #[test]
    fn test_reconcile_keeps_conflicting_cross_flags() {
        // 同一条目一侧 incorrect、一侧 mastered：不做交叉裁决，两者都留
        let mut local = ReviewProgress::default();
        local.set_incorrect(word("5"));

        let mut remote = ReviewProgress::default();
        remote.mastered.insert(word("5"));

        let merged = ReviewProgress::reconciled(&local, &remote);
        assert!(merged.incorrect.contains(&word("5")));
        assert!(merged.mastered.contains(&word("5")));
    }

    #[test]
    fn test_set_mastered_clears_incorrect() {
        let mut progress = ReviewProgress::default();
        progress.set_incorrect(word("7"));
        progress.set_mastered(word("7"));

        assert!(!progress.incorrect.contains(&word("7")));
        assert!(progress.mastered.contains(&word("7")));

        // 反向不成立
        progress.set_incorrect(word("7"));
        assert!(progress.mastered.contains(&word("7")));
    }

    #[test]
    fn test_is_due_rules() {
        let mut progress = ReviewProgress::default();
        let now = 10 * REVIEW_INTERVAL_MS;

        // 从未复习过：到期
        assert!(progress.is_due(&word("fresh"), now, REVIEW_INTERVAL_MS));

        // 刚复习过：未到期
        progress.set_timestamp(word("recent"), now - 1);
        assert!(!progress.is_due(&word("recent"), now, REVIEW_INTERVAL_MS));

        // 超过间隔：到期
        progress.set_timestamp(word("old"), now - REVIEW_INTERVAL_MS);
        assert!(progress.is_due(&word("old"), now, REVIEW_INTERVAL_MS));

        // 永久标记的条目永远不进普通复习区
        progress.set_incorrect(word("flagged"));
        assert!(!progress.is_due(&word("flagged"), now, REVIEW_INTERVAL_MS));
        progress.set_mastered(word("done"));
        assert!(!progress.is_due(&word("done"), now, REVIEW_INTERVAL_MS));
    }

    #[test]
    fn test_is_due_idempotent_without_mutation() {
        let mut progress = ReviewProgress::default();
        progress.set_timestamp(word("x"), 0);
        let now = REVIEW_INTERVAL_MS + 5;

        let first = progress.is_due(&word("x"), now, REVIEW_INTERVAL_MS);
        for _ in 0..10 {
            assert_eq!(progress.is_due(&word("x"), now, REVIEW_INTERVAL_MS), first);
        }
    }

    #[test]
    fn test_review_sets_rebuild() {
        let mut progress = ReviewProgress::default();
        progress.set_incorrect(word("1"));
        progress.set_incorrect(ItemRef::new(ItemKind::Qa, "2"));
        progress.set_mastered(word("3"));

        let mut sets = ReviewSets::default();
        sets.rebuild(&progress);

        assert!(sets.incorrect_contains(ItemKind::Word, "1"));
        assert!(sets.incorrect_contains(ItemKind::Qa, "2"));
        assert!(sets.mastered_contains(ItemKind::Word, "3"));
        assert!(!sets.incorrect_contains(ItemKind::Sentence, "1"));
        assert_eq!(sets.total_incorrect(), 2);
        assert_eq!(sets.total_mastered(), 1);
    }
}
