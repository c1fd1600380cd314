//! 数据模型定义
//!
//! 定义学习条目（单词 / 句子 / 问答）、语言信息，以及
//! 远端时间戳到 ISO-8601 字符串的归一化工具。

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::gateway::Document;
use crate::{StoreError, StoreResult};

// ============================================================
// ItemKind - 条目类型
// ============================================================

/// 学习条目类型
///
/// 三种条目构成一个封闭集合，远端集合名与复习进度键前缀
/// 均由该类型派生。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Word,
    Sentence,
    Qa,
}

impl ItemKind {
    /// 所有条目类型，按固定顺序排列
    pub const ALL: [ItemKind; 3] = [ItemKind::Word, ItemKind::Sentence, ItemKind::Qa];

    /// 复习进度键中使用的类型名
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Word => "word",
            ItemKind::Sentence => "sentence",
            ItemKind::Qa => "qa",
        }
    }

    /// 远端集合名
    pub fn collection_name(&self) -> &'static str {
        match self {
            ItemKind::Word => "words",
            ItemKind::Sentence => "sentences",
            ItemKind::Qa => "qa",
        }
    }

    /// 从类型名解析
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "word" => Some(ItemKind::Word),
            "sentence" => Some(ItemKind::Sentence),
            "qa" => Some(ItemKind::Qa),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================
// 条目内容字段
// ============================================================

/// 单词内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordFields {
    /// 外语原文
    pub japanese: String,
    /// 中文释义
    pub chinese: String,
    /// 使用情境
    #[serde(default)]
    pub context: String,
    /// 分类路径（按名称逐级引用分类树节点）
    #[serde(default, rename = "categoryPath", skip_serializing_if = "Vec::is_empty")]
    pub category_path: Vec<String>,
}

/// 句子内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentenceFields {
    /// 外语原文
    pub japanese: String,
    /// 中文释义
    pub chinese: String,
    /// 使用情境
    #[serde(default)]
    pub context: String,
}

/// 问答内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaFields {
    pub question: String,
    pub answer: String,
}

/// 条目内容的封闭和类型
///
/// 条目类型由其所在集合决定，因此序列化时内容字段平铺在
/// 文档对象中，不携带类型标签。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemPayload {
    Word(WordFields),
    Sentence(SentenceFields),
    Qa(QaFields),
}

impl ItemPayload {
    /// 所属条目类型
    pub fn kind(&self) -> ItemKind {
        match self {
            ItemPayload::Word(_) => ItemKind::Word,
            ItemPayload::Sentence(_) => ItemKind::Sentence,
            ItemPayload::Qa(_) => ItemKind::Qa,
        }
    }

    /// 结构化内容键
    ///
    /// 重复检测以内容对为准：单词与句子为 `(japanese, chinese)`，
    /// 问答为 `(question, answer)`。id 不参与相等判断。
    pub fn content_key(&self) -> (String, String) {
        match self {
            ItemPayload::Word(w) => (w.japanese.clone(), w.chinese.clone()),
            ItemPayload::Sentence(s) => (s.japanese.clone(), s.chinese.clone()),
            ItemPayload::Qa(q) => (q.question.clone(), q.answer.clone()),
        }
    }
}

// ============================================================
// LearningItem - 学习条目
// ============================================================

/// 学习条目
///
/// id 由远端文档库分配（或由本地合成生成器临时分配）；
/// 时间戳统一为 ISO-8601 字符串。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearningItem {
    pub id: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub payload: ItemPayload,
}

impl LearningItem {
    /// 从远端文档解析
    ///
    /// 文档数据必须是对象；时间戳字段在网关读取时已归一化为
    /// ISO-8601 字符串，这里只做提取。
    pub fn from_document(kind: ItemKind, doc: &Document) -> StoreResult<Self> {
        let data = doc.data.as_object().ok_or_else(|| {
            StoreError::Serialization(serde::de::Error::custom(format!(
                "文档 {} 不是对象",
                doc.id
            )))
        })?;

        let payload = match kind {
            ItemKind::Word => ItemPayload::Word(serde_json::from_value(doc.data.clone())?),
            ItemKind::Sentence => ItemPayload::Sentence(serde_json::from_value(doc.data.clone())?),
            ItemKind::Qa => ItemPayload::Qa(serde_json::from_value(doc.data.clone())?),
        };

        let as_string = |key: &str| -> Option<String> {
            data.get(key).and_then(Value::as_str).map(str::to_string)
        };

        Ok(Self {
            id: doc.id.clone(),
            created_at: as_string("createdAt"),
            updated_at: as_string("updatedAt"),
            payload,
        })
    }

    /// 序列化为文档对象（内容字段平铺，附带 id 与时间戳）
    pub fn to_value(&self) -> Value {
        let mut map = match &self.payload {
            ItemPayload::Word(w) => to_object(w),
            ItemPayload::Sentence(s) => to_object(s),
            ItemPayload::Qa(q) => to_object(q),
        };
        map.insert("id".to_string(), Value::String(self.id.clone()));
        if let Some(created) = &self.created_at {
            map.insert("createdAt".to_string(), Value::String(created.clone()));
        }
        if let Some(updated) = &self.updated_at {
            map.insert("updatedAt".to_string(), Value::String(updated.clone()));
        }
        Value::Object(map)
    }

    /// 结构化内容键（见 [`ItemPayload::content_key`]）
    pub fn content_key(&self) -> (String, String) {
        self.payload.content_key()
    }

    /// 单词的分类路径；非单词条目返回空
    pub fn category_path(&self) -> &[String] {
        match &self.payload {
            ItemPayload::Word(w) => &w.category_path,
            _ => &[],
        }
    }
}

fn to_object<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

// ============================================================
// Language - 语言信息
// ============================================================

/// 学习语言
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    /// 语言代码（如 ja / en / hi / ko）
    pub code: String,
    /// 显示名称
    pub name: String,
    /// 旗帜符号
    pub flag: String,
}

impl Language {
    pub fn new(code: &str, name: &str, flag: &str) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            flag: flag.to_string(),
        }
    }
}

/// 默认支持的语言列表
pub fn default_languages() -> Vec<Language> {
    vec![
        Language::new("ja", "日语", "🇯🇵"),
        Language::new("en", "英语", "🇺🇸"),
        Language::new("hi", "印地语", "🇮🇳"),
        Language::new("ko", "韩语", "🇰🇷"),
    ]
}

/// 语言代码到语音代码的映射（覆盖常用语言），默认回退 zh-CN
pub fn speech_code_for(language_code: &str) -> &'static str {
    match language_code {
        "zh" => "zh-CN",
        "en" => "en-US",
        "hi" => "hi-IN",
        "es" => "es-ES",
        "ar" => "ar-SA",
        "bn" => "bn-BD",
        "fr" => "fr-FR",
        "ru" => "ru-RU",
        "pt" => "pt-BR",
        "ja" => "ja-JP",
        "de" => "de-DE",
        "ko" => "ko-KR",
        "it" => "it-IT",
        "tr" => "tr-TR",
        "vi" => "vi-VN",
        "pl" => "pl-PL",
        "nl" => "nl-NL",
        "th" => "th-TH",
        "id" => "id-ID",
        "uk" => "uk-UA",
        "cs" => "cs-CZ",
        "ro" => "ro-RO",
        "el" => "el-GR",
        "hu" => "hu-HU",
        "sv" => "sv-SE",
        "da" => "da-DK",
        "fi" => "fi-FI",
        "no" => "nb-NO",
        "he" => "he-IL",
        "sk" => "sk-SK",
        "hr" => "hr-HR",
        "bg" => "bg-BG",
        "sr" => "sr-RS",
        "sl" => "sl-SI",
        "et" => "et-EE",
        "lv" => "lv-LV",
        "lt" => "lt-LT",
        _ => "zh-CN",
    }
}

// ============================================================
// QuizRecord - 测验历史
// ============================================================

/// 一次测验的结果记录
///
/// 具体成绩字段由测验界面决定，这里原样透传；只补充 id 与
/// 完成时间。测验历史随导出文档走，不做远端同步。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizRecord {
    pub id: String,
    #[serde(rename = "completedAt")]
    pub completed_at: String,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

// ============================================================
// 时间戳归一化
// ============================================================

/// 当前时间的 ISO-8601 字符串（毫秒精度，UTC）
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 当前时间的 epoch 毫秒
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 将远端原生时间戳归一化为 ISO-8601 字符串
///
/// 支持三种输入形态：
/// - 已是字符串：原样返回；
/// - Firestore 风格对象 `{seconds, nanoseconds}`（含导出格式
///   `{type: "firestore/timestamp/1.0", seconds}`）；
/// - epoch 毫秒数字。
///
/// 其余形态返回 `None`，调用方应保持原值不动。
pub fn normalize_timestamp(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => {
            let millis = n.as_i64()?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        Value::Object(map) => {
            let seconds = map.get("seconds").and_then(Value::as_i64)?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("nanos"))
                .and_then(Value::as_i64)
                .unwrap_or(0) as u32;
            Utc.timestamp_opt(seconds, nanos)
                .single()
                .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        _ => None,
    }
}

/// 就地归一化文档对象中的 createdAt / updatedAt 字段
pub fn normalize_document_timestamps(data: &mut Value) {
    if let Value::Object(map) = data {
        for key in ["createdAt", "updatedAt"] {
            if let Some(value) = map.get(key) {
                if !value.is_string() {
                    if let Some(normalized) = normalize_timestamp(value) {
                        map.insert(key.to_string(), Value::String(normalized));
                    }
                }
            }
        }
    }
}

/// 本地合成 id 生成器
///
/// 仅在远端尚未分配 id 的场合使用（测验历史、内存网关等）。
pub fn synthetic_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================
// 测试
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_item_kind_roundtrip() {
        for kind in ItemKind::ALL {
            assert_eq!(ItemKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ItemKind::parse("verb"), None);
    }

    #[test]
    fn test_content_key_ignores_id() {
        let a = LearningItem {
            id: "a".to_string(),
            created_at: None,
            updated_at: None,
            payload: ItemPayload::Word(WordFields {
                japanese: "猫".to_string(),
                chinese: "猫（动物）".to_string(),
                context: String::new(),
                category_path: vec![],
            }),
        };
        let mut b = a.clone();
        b.id = "b".to_string();
        assert_eq!(a.content_key(), b.content_key());
    }

    #[test]
    fn test_from_document_word() {
        let doc = Document {
            id: "doc-1".to_string(),
            data: json!({
                "japanese": "水",
                "chinese": "水",
                "context": "日常",
                "categoryPath": ["名词", "自然"],
                "createdAt": "2025-01-01T00:00:00.000Z",
                "updatedAt": "2025-01-02T00:00:00.000Z",
            }),
        };

        let item =
            LearningItem::from_document(ItemKind::Word, &doc).expect("Failed to parse document");
        assert_eq!(item.id, "doc-1");
        assert_eq!(item.created_at.as_deref(), Some("2025-01-01T00:00:00.000Z"));
        assert_eq!(item.category_path(), ["名词", "自然"]);
    }

    #[test]
    fn test_from_document_missing_optional_fields() {
        let doc = Document {
            id: "doc-2".to_string(),
            data: json!({ "japanese": "走る", "chinese": "跑" }),
        };

        let item =
            LearningItem::from_document(ItemKind::Sentence, &doc).expect("Failed to parse");
        assert_eq!(item.created_at, None);
        match item.payload {
            ItemPayload::Sentence(s) => assert_eq!(s.context, ""),
            _ => panic!("wrong payload kind"),
        }
    }

    #[test]
    fn test_normalize_timestamp_firestore_object() {
        let value = json!({ "seconds": 1700000000, "nanoseconds": 0 });
        let normalized = normalize_timestamp(&value).expect("Failed to normalize");
        assert!(normalized.starts_with("2023-11-14T22:13:20"));
    }

    #[test]
    fn test_normalize_timestamp_export_format() {
        let value = json!({ "type": "firestore/timestamp/1.0", "seconds": 1700000000 });
        assert!(normalize_timestamp(&value).is_some());
    }

    #[test]
    fn test_normalize_document_timestamps_in_place() {
        let mut data = json!({
            "japanese": "空",
            "chinese": "天空",
            "createdAt": { "seconds": 1700000000, "nanoseconds": 500000000 },
        });
        normalize_document_timestamps(&mut data);
        assert!(data["createdAt"].is_string());
    }

    #[test]
    fn test_to_value_flattens_payload() {
        let item = LearningItem {
            id: "x".to_string(),
            created_at: Some("2025-01-01T00:00:00.000Z".to_string()),
            updated_at: None,
            payload: ItemPayload::Qa(QaFields {
                question: "「すみません」是什么意思？".to_string(),
                answer: "不好意思 / 劳驾".to_string(),
            }),
        };
        let value = item.to_value();
        assert_eq!(value["id"], "x");
        assert_eq!(value["question"], "「すみません」是什么意思？");
        assert!(value.get("updatedAt").is_none());
    }
}
