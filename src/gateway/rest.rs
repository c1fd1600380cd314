//! HTTP 兜底持久化通道
//!
//! 面向一个无状态的文件写入服务：把完整的 JSON 快照 POST 过去
//! 落盘即可。该通道独立于正常同步路径，仅作为可选的备份出口；
//! 服务端实现不在本 crate 范围内。

use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{StoreError, StoreResult};

/// 默认请求超时（秒）
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// HTTP 兜底写入器
pub struct RestSink {
    base_url: String,
    client: Client,
}

impl RestSink {
    /// 创建写入器
    ///
    /// # Arguments
    /// * `base_url` - 备份服务基础 URL，如 `http://localhost:3000`
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    /// 上传完整数据快照
    pub async fn save_backup<T: Serialize>(&self, snapshot: &T) -> StoreResult<()> {
        self.post("/api/save-backup", snapshot).await
    }

    /// 上传复习进度（扁平键值表）
    pub async fn save_progress(&self, progress: &Map<String, Value>) -> StoreResult<()> {
        self.post("/api/save-progress", progress).await
    }

    async fn post<T: Serialize>(&self, endpoint: &str, payload: &T) -> StoreResult<()> {
        let url = format!("{}{}", self.base_url, endpoint);

        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| StoreError::RemoteTransient(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::RemoteTransient(format!(
                "备份上传失败: HTTP {}",
                response.status()
            )))
        }
    }
}
