//! 回收站清理
//!
//! 每条过期的回收站记录在一个事务内处理：
//! - 还有其他用户引用同一个物理文件：只删除回收站记录和该用户的关联
//! - 这是最后一个引用：额外删除物理文件、分片记录和 `file_info` 行
//!
//! 两种情况都会把文件大小归还给回收站所属用户（不限空间的用户除外）。
//! 物理删除失败只记录日志，不回滚事务，遗留的字节由临时目录清理兜底

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::spawn_periodic;
use crate::error::{DownloadError, Result};
use crate::persistence::{Database, FileInfo, Recycled, Repos};
use crate::staging::promote::remove_dir_if_empty;

/// 每批读取的过期记录数
const BATCH_SIZE: i64 = 200;

const SECS_PER_DAY: i64 = 24 * 60 * 60;

/// 一轮清理的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecycleStats {
    /// 只解除关联（文件仍被其他用户持有）
    pub unlinked: usize,
    /// 物理删除的文件数
    pub purged: usize,
    /// 处理失败、留待下一轮的记录数
    pub failed: usize,
    /// 归还给用户的空间
    pub freed_bytes: i64,
}

/// 单条记录的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposal {
    /// 记录已被其他清理删除
    Gone,
    Unlinked { credited: i64 },
    /// `file` 的数据库记录已删除，磁盘文件待事务提交后删除
    Purged { credited: i64, file: FileInfo },
}

#[derive(Clone)]
pub struct RecycleCleaner {
    db: Database,
}

impl RecycleCleaner {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 清理超过 `days` 天的回收站记录
    pub async fn cleanup_expired_files(&self, days: u64) -> Result<RecycleStats> {
        self.cleanup_expired_files_at(chrono::Utc::now().timestamp(), days)
            .await
    }

    /// 以 `now`（秒）为当前时间清理，重复执行结果相同
    pub async fn cleanup_expired_files_at(&self, now: i64, days: u64) -> Result<RecycleStats> {
        let cutoff = now - days as i64 * SECS_PER_DAY;
        let mut stats = RecycleStats::default();
        let mut failed_ids: Vec<String> = Vec::new();

        loop {
            let limit = BATCH_SIZE + failed_ids.len() as i64;
            let batch = self
                .run_blocking(move |db| db.with_repos(|r| r.recycled().list_expired(cutoff, limit)))
                .await?;
            let rows: Vec<Recycled> = batch
                .into_iter()
                .filter(|row| !failed_ids.contains(&row.id))
                .collect();
            if rows.is_empty() {
                break;
            }

            for row in rows {
                if !self.process(row.clone(), &mut stats).await {
                    failed_ids.push(row.id);
                }
                tokio::task::yield_now().await;
            }
        }

        if stats.unlinked + stats.purged + stats.failed > 0 {
            info!(
                "回收站清理完成: 解除关联 {} 条, 物理删除 {} 个文件, 失败 {} 条, 归还 {} 字节",
                stats.unlinked, stats.purged, stats.failed, stats.freed_bytes
            );
        } else {
            debug!("回收站清理完成: 无过期记录");
        }
        Ok(stats)
    }

    /// 清空某个用户的回收站（不看过期时间）
    pub async fn empty_for_user(&self, user_id: i64) -> Result<RecycleStats> {
        let rows = self
            .run_blocking(move |db| db.with_repos(|r| r.recycled().list_by_user(user_id)))
            .await?;

        let mut stats = RecycleStats::default();
        for row in rows {
            self.process(row, &mut stats).await;
            tokio::task::yield_now().await;
        }
        info!(
            "用户 {} 回收站已清空: 解除关联 {} 条, 物理删除 {} 个文件, 失败 {} 条",
            user_id, stats.unlinked, stats.purged, stats.failed
        );
        Ok(stats)
    }

    /// 定时清理：首次在一个间隔之后执行
    pub fn start_scheduled_cleanup(
        &self,
        days: u64,
        interval: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let cleaner = self.clone();
        info!("回收站定时清理已启动: 保留 {} 天, 间隔 {:?}", days, interval);
        spawn_periodic("回收站清理", interval, interval, shutdown_rx, move || {
            let cleaner = cleaner.clone();
            async move {
                if let Err(e) = cleaner.cleanup_expired_files(days).await {
                    error!("回收站清理失败: {}", e);
                }
            }
        })
    }

    /// 处理一条记录，返回是否成功
    async fn process(&self, row: Recycled, stats: &mut RecycleStats) -> bool {
        let id = row.id.clone();
        match self.run_blocking(move |db| dispose(db, &row)).await {
            Ok(Disposal::Gone) => true,
            Ok(Disposal::Unlinked { credited }) => {
                stats.unlinked += 1;
                stats.freed_bytes += credited;
                true
            }
            Ok(Disposal::Purged { credited, .. }) => {
                stats.purged += 1;
                stats.freed_bytes += credited;
                true
            }
            Err(e) => {
                warn!("处理回收站记录失败: id={}, 错误: {}", id, e);
                stats.failed += 1;
                false
            }
        }
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| DownloadError::Storage(format!("清理线程异常: {}", e)))?
    }
}

/// 处理一条回收站记录：数据库修改在一个事务内完成，提交成功后才删除磁盘文件
fn dispose(db: &Database, row: &Recycled) -> Result<Disposal> {
    let disposal = db.with_tx(|r| dispose_rows(r, row))?;
    if let Disposal::Purged { file, .. } = &disposal {
        delete_blobs(file);
        info!(
            "回收站记录已清理并物理删除: id={}, file_id={}, size={}",
            row.id, file.id, file.size
        );
    }
    Ok(disposal)
}

/// 事务内的部分：删除回收记录与关联、归还空间，最后一个引用时删除文件记录
fn dispose_rows(r: &Repos<'_>, row: &Recycled) -> Result<Disposal> {
    if r.recycled().get(&row.id)?.is_none() {
        return Ok(Disposal::Gone);
    }

    // 本条记录对应的关联还在时，它也计入引用数
    let link = r
        .user_files()
        .get(&row.user_file_id)?
        .filter(|link| link.file_id == row.file_id);
    let refs = r.user_files().count_by_file(&row.file_id)?;
    let others = refs - i64::from(link.is_some());

    let file = r.files().get(&row.file_id)?;

    if link.is_some() {
        r.user_files().delete(&row.user_file_id)?;
    }
    r.recycled().delete(&row.id)?;

    let mut credited = 0;
    if let (Some(f), Some(_)) = (&file, &link) {
        if r.users().adjust_free_space(row.user_id, f.size)? {
            credited = f.size;
        }
    }

    match file {
        Some(file) if others <= 0 => {
            if file.is_chunk {
                r.chunks().delete_by_file(&file.id)?;
            }
            r.files().delete(&file.id)?;
            Ok(Disposal::Purged { credited, file })
        }
        _ => {
            debug!(
                "回收站记录已清理（文件仍有 {} 个引用）: id={}, file_id={}",
                others, row.id, row.file_id
            );
            Ok(Disposal::Unlinked { credited })
        }
    }
}

/// 删除文件在磁盘上的全部产物，失败只记录日志
fn delete_blobs(file: &FileInfo) {
    let data = Path::new(&file.path);
    remove_logged(data);
    remove_logged(&file.info_path());

    if file.is_enc {
        if let Some(enc) = &file.enc_path {
            remove_logged(Path::new(enc));
        }
        if let Some(enc_info) = file.enc_info_path() {
            remove_logged(&enc_info);
        }
    }

    if file.is_chunk {
        match file.chunk_dir() {
            Some(dir) => {
                if let Err(e) = fs::remove_dir_all(&dir) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!("删除分片目录失败 {:?}: {}", dir, e);
                    }
                }
            }
            None => warn!("文件路径不以 .data 结尾，跳过分片目录: {}", file.path),
        }
    }

    if let Some(thumb) = file.thumbnail_img.as_deref().filter(|t| !t.is_empty()) {
        remove_logged(Path::new(thumb));
    }

    if let Some(bucket) = data.parent() {
        if remove_dir_if_empty(bucket) {
            debug!("已删除空目录: {:?}", bucket);
        }
    }
}

fn remove_logged(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("已删除: {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除文件失败 {:?}: {}", path, e),
    }
}
