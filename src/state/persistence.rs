//! 检查点文件持久化
//!
//! 把单个检查点写入/读出 JSON 文件，用于跨进程恢复（可选使用）。

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::context::Checkpoint;

/// 单文件 JSON：{ context, location, ... }
#[derive(Debug)]
pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取检查点；文件不存在时返回 None
    pub fn load(&self) -> anyhow::Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut checkpoint: Checkpoint = serde_json::from_str(&data)
            .with_context(|| format!("invalid checkpoint file {}", self.path.display()))?;
        checkpoint.context.ensure_global_scope();
        Ok(Some(checkpoint))
    }

    /// 写入检查点；父目录不存在时自动创建
    pub fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(checkpoint)?)?;
        Ok(())
    }
}
