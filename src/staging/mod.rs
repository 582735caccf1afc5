//! 文件暂存模块
//!
//! - 临时目录布局：`<target_dir>/<task_id>/<name>.data` + `<name>.data.info`
//! - 断点元数据读写
//! - 下载完成后转正到磁盘 `data/` 目录
//! - 落盘加密

pub mod crypto;
pub mod promote;
pub mod sidecar;

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::Result;

pub use crypto::{KeyProvider, StaticKeyProvider};
pub use promote::{PromotedBlob, Promoter, StagedBlob};
pub use sidecar::{ChunkRecord, Sidecar};

/// 单个任务的临时目录
#[derive(Debug, Clone)]
pub struct ScratchLayout {
    root: PathBuf,
}

impl ScratchLayout {
    pub fn new(target_dir: &Path, task_id: &str) -> Self {
        Self {
            root: target_dir.join(task_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.root
    }

    /// 数据文件 `<name>.data`
    pub fn data_path(&self, file_name: &str) -> PathBuf {
        self.root.join(format!("{}.data", file_name))
    }

    /// 断点文件 `<name>.data.info`
    pub fn info_path(&self, file_name: &str) -> PathBuf {
        self.root.join(format!("{}.data.info", file_name))
    }

    pub async fn create(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// 删除整个临时目录（不存在时视为成功）
    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                debug!("已删除临时目录: {:?}", self.root);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("删除临时目录失败 {:?}: {}", self.root, e);
                Err(e.into())
            }
        }
    }

    pub fn exists(&self) -> bool {
        self.root.exists()
    }
}

/// 清理文件名中的路径分隔符和控制字符
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

const HASH_BUF_SIZE: usize = 256 * 1024;

/// 计算文件 SHA-256（十六进制）
///
/// 每读一块调用一次 `check`，用于响应暂停/取消
pub async fn sha256_file<F>(path: &Path, check: F) -> Result<String>
where
    F: Fn() -> Result<()>,
{
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];

    loop {
        check()?;
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
