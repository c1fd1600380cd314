//! 跨组件集成场景
//!
//! 全部通过进程内网关运行：身份绑定、实时订阅、语言切换、
//! 对账合并、导入导出的端到端行为。

use serde_json::json;
use shanka_store::cache::KEY_REVIEW_PROGRESS;
use shanka_store::{
    CollectionPath, ItemKind, Language, LearnStore, MemoryCache, MemoryGateway, QaFields,
    RemoteGateway, SentenceFields, StoreError, WordFields,
};

const OWNER: &str = "owner-1";

fn word(japanese: &str, chinese: &str) -> WordFields {
    WordFields {
        japanese: japanese.to_string(),
        chinese: chinese.to_string(),
        context: String::new(),
        category_path: Vec::new(),
    }
}

fn categorized_word(japanese: &str, chinese: &str, path: &[&str]) -> WordFields {
    WordFields {
        japanese: japanese.to_string(),
        chinese: chinese.to_string(),
        context: String::new(),
        category_path: path.iter().map(|s| s.to_string()).collect(),
    }
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 让已唤醒的订阅泵任务把排队的快照消化掉
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

async fn online_store() -> LearnStore<MemoryGateway, MemoryCache> {
    init_logs();
    let store = LearnStore::new(MemoryGateway::new(), MemoryCache::new());
    store.initialize();
    store.sign_in(OWNER).await.expect("Failed to sign in");
    store
}

#[tokio::test]
async fn test_added_item_arrives_via_subscription() {
    let store = online_store().await;

    store
        .add_word(word("勉強", "学习"))
        .await
        .expect("Failed to add word");
    settle().await;

    let words = store.items(ItemKind::Word).expect("Failed to read words");
    assert_eq!(words.len(), 1);
    assert!(words[0].created_at.is_some());
}

#[tokio::test]
async fn test_duplicate_add_rejected_and_collection_unchanged() {
    let store = online_store().await;

    store
        .add_word(word("勉強", "学习"))
        .await
        .expect("Failed to add word");
    settle().await;

    // 内容相同、id 无关：结构化查重拒绝
    let result = store.add_word(word("勉強", "学习")).await;
    assert!(matches!(result, Err(StoreError::Duplicate(_))));
    settle().await;
    assert_eq!(store.total_items(ItemKind::Word).expect("Failed to count"), 1);

    // 问答按 (question, answer) 查重
    store
        .add_qa(QaFields {
            question: "「はい」是什么意思？".to_string(),
            answer: "是".to_string(),
        })
        .await
        .expect("Failed to add qa");
    settle().await;
    let result = store
        .add_qa(QaFields {
            question: "「はい」是什么意思？".to_string(),
            answer: "是".to_string(),
        })
        .await;
    assert!(matches!(result, Err(StoreError::Duplicate(_))));
}

#[tokio::test]
async fn test_mutations_require_connectivity() {
    let store = LearnStore::new(MemoryGateway::new(), MemoryCache::new());
    store.initialize();

    assert!(matches!(
        store.add_word(word("水", "水")).await,
        Err(StoreError::Offline(_))
    ));
    assert!(matches!(
        store.update_item(ItemKind::Word, "x", json!({})).await,
        Err(StoreError::Offline(_))
    ));
    assert!(matches!(
        store.delete_item(ItemKind::Word, "x").await,
        Err(StoreError::Offline(_))
    ));
    assert!(matches!(
        store.manual_sync().await,
        Err(StoreError::Offline(_))
    ));
    assert!(matches!(
        store.export_data().await,
        Err(StoreError::Offline(_))
    ));
}

#[tokio::test]
async fn test_language_switch_never_leaks_old_items() {
    let gateway = MemoryGateway::new();

    // 两个语言的集合里各有一条数据
    gateway
        .add(
            &CollectionPath::for_kind(OWNER, "ja", ItemKind::Word),
            json!({ "japanese": "犬", "chinese": "狗" }),
        )
        .await
        .expect("Failed to seed ja word");
    gateway
        .add(
            &CollectionPath::for_kind(OWNER, "en", ItemKind::Word),
            json!({ "japanese": "dog", "chinese": "狗" }),
        )
        .await
        .expect("Failed to seed en word");

    let store = LearnStore::new(gateway, MemoryCache::new());
    store.initialize();
    store.sign_in(OWNER).await.expect("Failed to sign in");
    settle().await;
    assert_eq!(store.total_items(ItemKind::Word).expect("Failed to count"), 1);

    store
        .switch_language("en")
        .await
        .expect("Failed to switch language");

    // 切换返回后立即检查：不允许出现任何 ja 条目
    let words = store.items(ItemKind::Word).expect("Failed to read words");
    assert!(words.iter().all(|item| match &item.payload {
        shanka_store::ItemPayload::Word(w) => w.japanese != "犬",
        _ => false,
    }));
    assert_eq!(store.current_language().expect("Failed to read"), "en");
    assert_eq!(words.len(), 1);

    settle().await;
    let words = store.items(ItemKind::Word).expect("Failed to read words");
    assert_eq!(words.len(), 1);
}

#[tokio::test]
async fn test_switch_to_unsupported_language_fails() {
    let store = online_store().await;
    let result = store.switch_language("xx").await;
    assert!(matches!(result, Err(StoreError::UnsupportedLanguage(_))));
    assert_eq!(store.current_language().expect("Failed to read"), "ja");
}

#[tokio::test]
async fn test_cross_device_flags_survive_reconcile() {
    let gateway = MemoryGateway::new();

    // 另一台设备已在云端留下标记（同一条目是 mastered，另一条是
    // incorrect），本地会话随后产生自己的标记
    gateway
        .set_owner_doc_merge(
            OWNER,
            KEY_REVIEW_PROGRESS,
            json!({ "mastered_word_5": true, "incorrect_qa_9": true }),
        )
        .await
        .expect("Failed to seed remote progress");

    let store = LearnStore::new(gateway.clone(), MemoryCache::new());
    store.initialize();
    store.sign_in(OWNER).await.expect("Failed to sign in");

    store
        .mark_incorrect(ItemKind::Word, "5")
        .await
        .expect("Failed to mark incorrect");
    store.manual_sync().await.expect("Failed to sync");

    // 交叉冲突不做裁决：word_5 的两个标记都在；qa_9 的标记保留
    let remote = gateway
        .get_owner_doc(OWNER, KEY_REVIEW_PROGRESS)
        .await
        .expect("Failed to read owner doc")
        .expect("Expected remote progress");
    assert_eq!(remote["mastered_word_5"], json!(true));
    assert_eq!(remote["incorrect_word_5"], json!(true));
    assert_eq!(remote["incorrect_qa_9"], json!(true));
}

#[tokio::test]
async fn test_review_queues_are_disjoint() {
    let store = online_store().await;

    store
        .add_word(word("新しい", "新的"))
        .await
        .expect("Failed to add word");
    settle().await;
    let id = store.items(ItemKind::Word).expect("Failed to read")[0]
        .id
        .clone();

    // 新条目进入普通复习区
    assert_eq!(store.words_to_review().expect("Failed to filter").len(), 1);

    // "没记住"后只出现在集中复习区
    store
        .mark_incorrect(ItemKind::Word, &id)
        .await
        .expect("Failed to mark incorrect");
    assert!(store.words_to_review().expect("Failed to filter").is_empty());
    assert_eq!(
        store
            .incorrect_items(ItemKind::Word)
            .expect("Failed to filter")
            .len(),
        1
    );
    assert_eq!(store.total_incorrect_items().expect("Failed to count"), 1);

    // "已掌握"后离开集中复习区，也不回普通复习区
    store
        .mark_mastered(ItemKind::Word, &id)
        .await
        .expect("Failed to mark mastered");
    assert!(store
        .incorrect_items(ItemKind::Word)
        .expect("Failed to filter")
        .is_empty());
    assert_eq!(
        store
            .mastered_items(ItemKind::Word)
            .expect("Failed to filter")
            .len(),
        1
    );
    assert!(store.words_to_review().expect("Failed to filter").is_empty());
}

#[tokio::test]
async fn test_import_is_idempotent() {
    // 源仓库造数据并导出
    let source = online_store().await;
    source
        .add_word(word("花", "花"))
        .await
        .expect("Failed to add word");
    source
        .add_word(word("鳥", "鸟"))
        .await
        .expect("Failed to add word");
    source
        .add_sentence(SentenceFields {
            japanese: "花がきれいです。".to_string(),
            chinese: "花很漂亮。".to_string(),
            context: String::new(),
        })
        .await
        .expect("Failed to add sentence");
    source
        .mark_incorrect(ItemKind::Word, "w-1")
        .await
        .expect("Failed to mark incorrect");
    settle().await;

    let exported = source.export_data().await.expect("Failed to export");
    assert!(!exported.review_progress.is_empty());

    // 目标仓库导入两次
    let gateway = MemoryGateway::new();
    let target = LearnStore::new(gateway.clone(), MemoryCache::new());
    target.initialize();
    target.sign_in(OWNER).await.expect("Failed to sign in");

    let first = target
        .import_data(&exported)
        .await
        .expect("Failed to import");
    assert_eq!(first.imported, 3);
    assert_eq!(first.failed, 0);
    settle().await;

    let second = target
        .import_data(&exported)
        .await
        .expect("Failed to import again");
    assert_eq!(second.imported, 0);
    assert_eq!(second.skipped, 3);

    // 云端集合数量与单次导入一致
    let words_path = CollectionPath::for_kind(OWNER, "ja", ItemKind::Word);
    assert_eq!(gateway.collection_len(&words_path), 2);

    // 复习进度随导入落地：带"没记住"标记的条目不进普通复习区
    settle().await;
    let due = target
        .is_due_for_review(ItemKind::Word, "w-1")
        .expect("Failed to check due");
    assert!(!due);
}

#[tokio::test]
async fn test_import_normalizes_native_timestamps() {
    let store = online_store().await;

    let mut exported = store.export_data().await.expect("Failed to export");
    exported.collections.entry("ja".to_string()).or_default().words.push(json!({
        "japanese": "古い",
        "chinese": "旧的",
        "createdAt": { "type": "firestore/timestamp/1.0", "seconds": 1700000000 },
        "updatedAt": { "seconds": 1700000000, "nanoseconds": 0 },
    }));

    let summary = store.import_data(&exported).await.expect("Failed to import");
    assert_eq!(summary.imported, 1);
    settle().await;

    let words = store.items(ItemKind::Word).expect("Failed to read words");
    assert_eq!(words.len(), 1);
}

#[tokio::test]
async fn test_category_rename_cascades_to_words() {
    let store = online_store().await;

    store
        .add_category("ja", &[], "名词")
        .await
        .expect("Failed to add category");
    store
        .add_category("ja", &["名词".to_string()], "动物")
        .await
        .expect("Failed to add child category");

    store
        .add_word(categorized_word("猫", "猫", &["名词", "动物"]))
        .await
        .expect("Failed to add word");
    store
        .add_word(categorized_word("本", "书", &["名词"]))
        .await
        .expect("Failed to add word");
    settle().await;

    store
        .rename_category("ja", &["名词".to_string()], "體言")
        .await
        .expect("Failed to rename category");
    settle().await;

    let words = store.items(ItemKind::Word).expect("Failed to read words");
    for item in &words {
        assert_eq!(item.category_path()[0], "體言");
    }

    let trees = store.category_trees("ja").expect("Failed to read trees");
    assert_eq!(trees[0].name, "體言");
    assert_eq!(trees[0].children[0].name, "动物");
}

#[tokio::test]
async fn test_category_delete_unlinks_but_keeps_items() {
    let store = online_store().await;

    store
        .add_category("ja", &[], "名词")
        .await
        .expect("Failed to add category");
    store
        .add_word(categorized_word("猫", "猫", &["名词"]))
        .await
        .expect("Failed to add word");
    settle().await;

    store
        .delete_category("ja", &["名词".to_string()])
        .await
        .expect("Failed to delete category");
    settle().await;

    // 数据只解除关联，不删除
    let words = store.items(ItemKind::Word).expect("Failed to read words");
    assert_eq!(words.len(), 1);
    assert!(words[0].category_path().is_empty());
    assert!(store.category_trees("ja").expect("Failed to read").is_empty());
}

#[tokio::test]
async fn test_sign_out_stops_subscriptions() {
    let gateway = MemoryGateway::new();
    let store = LearnStore::new(gateway.clone(), MemoryCache::new());
    store.initialize();
    store.sign_in(OWNER).await.expect("Failed to sign in");

    store.sign_out().expect("Failed to sign out");

    // 登出后云端的新数据不再流入本地状态
    gateway
        .add(
            &CollectionPath::for_kind(OWNER, "ja", ItemKind::Word),
            json!({ "japanese": "遅い", "chinese": "晚的" }),
        )
        .await
        .expect("Failed to add");
    settle().await;

    assert_eq!(store.total_items(ItemKind::Word).expect("Failed to count"), 0);
    assert!(!store.is_online().expect("Failed to read"));
}

#[tokio::test]
async fn test_language_management() {
    let store = online_store().await;

    store
        .add_language(Language::new("fr", "法语", "🇫🇷"))
        .expect("Failed to add language");
    assert!(matches!(
        store.add_language(Language::new("fr", "法语", "🇫🇷")),
        Err(StoreError::Duplicate(_))
    ));

    // 删除当前语言会切换到剩余列表的第一个
    store
        .remove_language("ja")
        .await
        .expect("Failed to remove language");
    assert_ne!(store.current_language().expect("Failed to read"), "ja");

    assert_eq!(store.speech_code("fr"), "fr-FR");
    assert_eq!(store.speech_code("unknown"), "zh-CN");
}

#[tokio::test]
async fn test_quiz_history_included_in_export() {
    let store = online_store().await;

    let mut details = serde_json::Map::new();
    details.insert("score".to_string(), json!(8));
    details.insert("total".to_string(), json!(10));
    store
        .add_quiz_result(details)
        .expect("Failed to record quiz result");

    let exported = store.export_data().await.expect("Failed to export");
    assert_eq!(exported.quiz_history.len(), 1);
    assert_eq!(exported.quiz_history[0].details["score"], json!(8));
    assert_eq!(exported.schema_version, shanka_store::EXPORT_SCHEMA_VERSION);
}

#[tokio::test]
async fn test_default_data_seeding_respects_duplicates() {
    let store = online_store().await;

    let mut defaults = shanka_store::DefaultDataSet::new();
    defaults.insert(
        "ja".to_string(),
        shanka_store::DefaultLanguageData {
            words: vec![word("水", "水"), word("火", "火")],
            sentences: vec![],
            qa: vec![],
        },
    );

    let imported = store
        .initialize_default_data(&defaults)
        .await
        .expect("Failed to seed defaults");
    assert_eq!(imported, 2);
    settle().await;

    // 已有数据时不再初始化
    let imported = store
        .initialize_default_data(&defaults)
        .await
        .expect("Failed to seed defaults");
    assert_eq!(imported, 0);
}
