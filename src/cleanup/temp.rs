//! 孤儿临时目录清理
//!
//! 扫描每个磁盘的 `temp/` 目录，修改时间早于 `max_age` 的子目录整体删除。
//! 首次执行延迟到启动若干分钟之后，避免与进行中的上传竞争

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::spawn_periodic;
use crate::error::{DownloadError, Result};
use crate::persistence::Database;

#[derive(Clone)]
pub struct TempCleaner {
    db: Database,
}

impl TempCleaner {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 删除所有磁盘 `temp/` 下过期的子目录，返回删除数量
    pub async fn cleanup_orphaned_temp_files(&self, max_age: Duration) -> Result<usize> {
        let db = self.db.clone();
        let disks = tokio::task::spawn_blocking(move || db.with_repos(|r| r.disks().list()))
            .await
            .map_err(|e| DownloadError::Storage(format!("清理线程异常: {}", e)))??;

        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        for disk in disks {
            let temp_dir = disk.temp_dir();
            if !temp_dir.is_dir() {
                debug!("磁盘 {} 没有临时目录: {:?}", disk.id, temp_dir);
                continue;
            }

            let candidates = tokio::task::spawn_blocking(move || expired_dirs(&temp_dir, cutoff))
                .await
                .map_err(|e| DownloadError::Storage(format!("清理线程异常: {}", e)))?;

            for dir in candidates {
                let result = tokio::fs::remove_dir_all(&dir).await;
                match result {
                    Ok(()) => {
                        removed += 1;
                        debug!("已删除孤儿临时目录: {:?}", dir);
                    }
                    Err(e) => warn!("删除临时目录失败 {:?}: {}", dir, e),
                }
            }
        }

        if removed > 0 {
            info!("临时目录清理完成: 删除了 {} 个孤儿目录", removed);
        }
        Ok(removed)
    }

    /// 延迟 `initial_delay` 后首次执行，之后按间隔执行
    pub fn start_scheduled_cleanup(
        &self,
        max_age: Duration,
        interval: Duration,
        initial_delay: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let cleaner = self.clone();
        info!(
            "临时目录定时清理已启动: 最大保留 {:?}, 间隔 {:?}, 首次延迟 {:?}",
            max_age, interval, initial_delay
        );
        spawn_periodic("临时目录清理", initial_delay, interval, shutdown_rx, move || {
            let cleaner = cleaner.clone();
            async move {
                if let Err(e) = cleaner.cleanup_orphaned_temp_files(max_age).await {
                    error!("临时目录清理失败: {}", e);
                }
            }
        })
    }
}

/// `temp_dir` 的直接子目录中修改时间早于 `cutoff` 的
fn expired_dirs(temp_dir: &Path, cutoff: SystemTime) -> Vec<PathBuf> {
    WalkDir::new(temp_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("读取临时目录失败 {:?}: {}", temp_dir, e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_dir())
        .filter(|entry| {
            fs::metadata(entry.path())
                .and_then(|m| m.modified())
                .map(|modified| modified < cutoff)
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::db::test_support::temp_db;
    use crate::persistence::Disk;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_only_old_directories_removed() {
        let (_dir, db) = temp_db();
        let disk_root = TempDir::new().unwrap();
        let temp = disk_root.path().join("temp");
        fs::create_dir_all(temp.join("old-session")).unwrap();
        fs::write(temp.join("old-session").join("part"), b"x").unwrap();
        fs::write(temp.join("loose-file"), b"x").unwrap();

        db.with_repos(|r| {
            r.disks().insert(&Disk {
                id: "d0".to_string(),
                data_path: disk_root.path().to_string_lossy().into_owned(),
                create_time: 0,
            })
        })
        .unwrap();

        let cleaner = TempCleaner::new(db);

        // 刚创建的目录不会被删除
        assert_eq!(
            cleaner
                .cleanup_orphaned_temp_files(Duration::from_secs(3600))
                .await
                .unwrap(),
            0
        );
        assert!(temp.join("old-session").exists());

        // 保留时间为 0 时所有子目录都已过期
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            cleaner
                .cleanup_orphaned_temp_files(Duration::ZERO)
                .await
                .unwrap(),
            1
        );
        assert!(!temp.join("old-session").exists());
        assert!(temp.join("loose-file").exists());
    }

    #[tokio::test]
    async fn test_disk_without_temp_dir() {
        let (_dir, db) = temp_db();
        db.with_repos(|r| {
            r.disks().insert(&Disk {
                id: "d0".to_string(),
                data_path: "/definitely/not/here".to_string(),
                create_time: 0,
            })
        })
        .unwrap();
        let cleaner = TempCleaner::new(db);
        assert_eq!(
            cleaner
                .cleanup_orphaned_temp_files(Duration::ZERO)
                .await
                .unwrap(),
            0
        );
    }
}
