//! 入库：把下载完成的文件登记到用户网盘
//!
//! 1. 转正：数据文件移动到磁盘 `data/` 目录（可选加密）
//! 2. 单个事务内：复查配额 → 写 `file_info` → 写 `user_files` → 非不限空间用户扣减 `free_space`
//! 3. 事务提交后删除断点文件；事务失败则把数据文件移回临时目录

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DownloadError, Result};
use crate::persistence::{Database, Repos, UserFile};
use crate::staging::promote::remove_if_exists;
use crate::staging::{Promoter, StagedBlob};

/// 入库结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestedFile {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub sha256: String,
    /// 实际保存字节的文件（加密时为 `.enc`）
    pub blob_path: PathBuf,
}

/// 入库请求
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub user_id: i64,
    pub virtual_path: String,
    pub staged: StagedBlob,
    pub encrypt: bool,
    /// 提交后需要删除的断点文件
    pub sidecar: Option<PathBuf>,
}

#[derive(Clone)]
pub struct Ingestor {
    db: Database,
    promoter: Arc<Promoter>,
}

impl Ingestor {
    pub fn new(db: Database, promoter: Arc<Promoter>) -> Self {
        Self { db, promoter }
    }

    /// 下载前的配额预检（大小已知时）
    pub fn precheck_quota(&self, user_id: i64, size: u64) -> Result<()> {
        self.db.with_repos(|r| check_quota(r, user_id, size))
    }

    pub async fn ingest(&self, req: IngestRequest) -> Result<IngestedFile> {
        let promoter = self.promoter.clone();
        let staged = req.staged.clone();
        let encrypt = req.encrypt;
        let promoted = tokio::task::spawn_blocking(move || promoter.promote(&staged, encrypt))
            .await
            .map_err(|e| DownloadError::storage(format!("转正任务异常: {}", e)))??;

        let file_info = promoted.to_file_info(self.promoter.disk_id());
        let link = UserFile {
            id: Uuid::new_v4().to_string(),
            user_id: req.user_id,
            file_id: file_info.id.clone(),
            virtual_path: req.virtual_path.clone(),
            file_name: req.staged.file_name.clone(),
            create_time: chrono::Utc::now().timestamp(),
        };

        let size = file_info.size;
        let committed = self.db.with_tx(|r| {
            check_quota(r, req.user_id, size as u64)?;
            r.files().insert(&file_info)?;
            r.user_files().insert(&link)?;
            r.users().adjust_free_space(req.user_id, -size)?;
            Ok(())
        });

        if let Err(e) = committed {
            warn!(
                "入库事务失败，数据文件保留在临时目录 {:?}: {}",
                req.staged.path, e
            );
            let promoter = self.promoter.clone();
            let promoted = promoted.clone();
            if let Err(join_err) =
                tokio::task::spawn_blocking(move || promoter.revert(&promoted)).await
            {
                warn!("回退转正失败: {}", join_err);
            }
            return Err(e);
        }

        self.promoter.finalize(&promoted);
        if let Some(ref sidecar) = req.sidecar {
            remove_if_exists(sidecar);
        }

        info!(
            "✓ 入库完成: user={}, file_id={}, name={}, size={}",
            req.user_id, promoted.file_id, req.staged.file_name, size
        );

        Ok(IngestedFile {
            file_id: promoted.file_id.clone(),
            file_name: req.staged.file_name,
            file_size: promoted.size,
            sha256: promoted.sha256.clone(),
            blob_path: promoted
                .enc_path
                .clone()
                .unwrap_or_else(|| promoted.data_path.clone()),
        })
    }
}

/// 剩余空间检查（不限空间用户直接通过）
fn check_quota(repos: &Repos<'_>, user_id: i64, size: u64) -> Result<()> {
    let user = repos.users().require(user_id)?;
    if user.is_unlimited() {
        return Ok(());
    }
    if size as i64 > user.free_space {
        return Err(DownloadError::Quota {
            required: size as i64,
            available: user.free_space,
        });
    }
    Ok(())
}
