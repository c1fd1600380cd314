//! 身份绑定
//!
//! 将同步核心与具体认证机制解耦：认证层（匿名 / 邮箱 / Google
//! 登录等）只需在身份变化时调用 [`IdentityBinding::set_owner`]，
//! 核心通过稳定的不透明 owner id 为所有远端文档定界。

use std::sync::Mutex;

use crate::cache::{DurableCache, KEY_DATA_OWNER_ID};

/// 身份变化回调
pub type OwnerListener = Box<dyn Fn(Option<&str>) + Send + Sync>;

/// 身份绑定：当前 owner id + 变化通知
#[derive(Default)]
pub struct IdentityBinding {
    owner: Mutex<Option<String>>,
    listeners: Mutex<Vec<OwnerListener>>,
}

impl IdentityBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前 owner id；未绑定时为 None
    pub fn current_owner_id(&self) -> Option<String> {
        self.owner.lock().map(|guard| guard.clone()).unwrap_or(None)
    }

    /// 是否已绑定身份
    pub fn is_bound(&self) -> bool {
        self.current_owner_id().is_some()
    }

    /// 设置（或清除）owner id 并通知所有监听者
    ///
    /// 传入 None 或空字符串视为登出。
    pub fn set_owner(&self, owner: Option<String>) {
        let owner = owner.filter(|id| !id.trim().is_empty());

        if let Ok(mut guard) = self.owner.lock() {
            if *guard == owner {
                return;
            }
            *guard = owner.clone();
        }

        log::info!(
            "身份状态变化: {}",
            if owner.is_some() { "已登录" } else { "未登录" }
        );

        if let Ok(listeners) = self.listeners.lock() {
            for listener in listeners.iter() {
                listener(owner.as_deref());
            }
        }
    }

    /// 注册身份变化监听
    ///
    /// 若注册时已有绑定身份，立即回调一次。
    pub fn on_change(&self, listener: impl Fn(Option<&str>) + Send + Sync + 'static) {
        let current = self.current_owner_id();
        if let Some(owner) = &current {
            listener(Some(owner));
        }
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Box::new(listener));
        }
    }

    /// 从缓存恢复 owner id
    ///
    /// 缓存不可用时保持未绑定状态，仅记录警告。
    pub fn restore_from_cache(&self, cache: &dyn DurableCache) {
        match cache.get(KEY_DATA_OWNER_ID) {
            Ok(Some(id)) if !id.trim().is_empty() => {
                self.set_owner(Some(id));
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("读取缓存的 owner id 失败: {}", e);
            }
        }
    }

    /// 将当前 owner id 写入缓存（未绑定时删除缓存键）
    pub fn persist_to_cache(&self, cache: &dyn DurableCache) {
        let result = match self.current_owner_id() {
            Some(id) => cache.set(KEY_DATA_OWNER_ID, &id),
            None => cache.remove(KEY_DATA_OWNER_ID).map(|_| ()),
        };
        if let Err(e) = result {
            log::warn!("写入缓存的 owner id 失败: {}", e);
        }
    }
}

// ============================================================
// 测试
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_set_owner_notifies_listeners() {
        let binding = IdentityBinding::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        binding.on_change(move |owner| {
            if owner.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        binding.set_owner(Some("owner-1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(binding.current_owner_id(), Some("owner-1".to_string()));

        // 相同身份不重复通知
        binding.set_owner(Some("owner-1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_change_replays_current_owner() {
        let binding = IdentityBinding::new();
        binding.set_owner(Some("owner-2".to_string()));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        binding.on_change(move |owner| {
            assert_eq!(owner, Some("owner-2"));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blank_owner_means_signed_out() {
        let binding = IdentityBinding::new();
        binding.set_owner(Some("  ".to_string()));
        assert!(!binding.is_bound());
    }

    #[test]
    fn test_cache_roundtrip() {
        let cache = MemoryCache::new();
        let binding = IdentityBinding::new();
        binding.set_owner(Some("owner-3".to_string()));
        binding.persist_to_cache(&cache);

        let restored = IdentityBinding::new();
        restored.restore_from_cache(&cache);
        assert_eq!(restored.current_owner_id(), Some("owner-3".to_string()));

        // 登出后缓存键被清除
        binding.set_owner(None);
        binding.persist_to_cache(&cache);
        assert_eq!(
            cache.get(KEY_DATA_OWNER_ID).expect("Failed to get"),
            None
        );
    }
}
