//! 凭证持久化
//!
//! 当前凭证的落盘记录：启动时读取一次，每次续期后整体覆写。
//! 覆写采用临时文件加重命名，避免写到一半崩溃留下半截文件。

use std::path::PathBuf;
use storkwatch_core::{AgentError, Credential};

/// 凭证持久化接口
pub trait CredentialStore: Send + Sync {
    /// 启动时读取已保存的凭证，文件不存在或无法解析时返回 None
    fn load(&self) -> Result<Option<Credential>, AgentError>;

    /// 覆写当前凭证
    fn save(&self, credential: &Credential) -> Result<(), AgentError>;
}

/// 基于 JSON 文件的凭证存储（tokens.json）
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credential>, AgentError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| AgentError::Storage(format!("读取凭证文件失败: {e}")))?;

        match serde_json::from_str::<Credential>(&content) {
            Ok(credential) => Ok(Some(credential)),
            Err(e) => {
                // 文件损坏等同于没有凭证，走完整认证流程重建
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "凭证文件无法解析，忽略并重新认证"
                );
                Ok(None)
            }
        }
    }

    fn save(&self, credential: &Credential) -> Result<(), AgentError> {
        let content = serde_json::to_string_pretty(credential)
            .map_err(|e| AgentError::Storage(format!("序列化凭证失败: {e}")))?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .map_err(|e| AgentError::Storage(format!("写入临时凭证文件失败: {e}")))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| AgentError::Storage(format!("替换凭证文件失败: {e}")))?;

        tracing::debug!(path = %self.path.display(), "[CredentialStore] 凭证已持久化");
        Ok(())
    }
}

/// 内存凭证存储（测试用）
#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: parking_lot::Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Credential> {
        self.inner.lock().clone()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<Credential>, AgentError> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, credential: &Credential) -> Result<(), AgentError> {
        *self.inner.lock() = Some(credential.clone());
        Ok(())
    }
}
