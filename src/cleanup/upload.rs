//! 上传会话清理
//!
//! 最后活动时间超过 TTL 的 `upload_task` 记录被删除，会话临时目录一并删除

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::spawn_periodic;
use crate::error::{DownloadError, Result};
use crate::persistence::Database;

#[derive(Clone)]
pub struct UploadCleaner {
    db: Database,
    ttl_hours: u64,
}

impl UploadCleaner {
    pub fn new(db: Database, ttl_hours: u64) -> Self {
        Self { db, ttl_hours }
    }

    /// 删除过期的上传会话，返回删除数量
    pub async fn cleanup_expired_tasks(&self) -> Result<usize> {
        self.cleanup_expired_tasks_at(chrono::Utc::now().timestamp())
            .await
    }

    pub async fn cleanup_expired_tasks_at(&self, now: i64) -> Result<usize> {
        let cutoff = now - self.ttl_hours as i64 * 3600;
        let db = self.db.clone();
        let expired = tokio::task::spawn_blocking(move || {
            db.with_repos(|r| r.uploads().list_expired(cutoff))
        })
        .await
        .map_err(|e| DownloadError::Storage(format!("清理线程异常: {}", e)))??;

        let mut removed = 0;
        for task in expired {
            let db = self.db.clone();
            let id = task.id.clone();
            let deleted = tokio::task::spawn_blocking(move || {
                db.with_repos(|r| r.uploads().delete(&id))
            })
            .await
            .map_err(|e| DownloadError::Storage(format!("清理线程异常: {}", e)))?;

            match deleted {
                Ok(true) => {
                    removed += 1;
                    if let Some(dir) = task.temp_dir.as_deref().filter(|d| !d.is_empty()) {
                        remove_session_dir(Path::new(dir)).await;
                    }
                    debug!("已删除过期上传会话: id={}, file={}", task.id, task.file_name);
                }
                Ok(false) => {}
                Err(e) => warn!("删除上传会话失败: id={}, 错误: {}", task.id, e),
            }
        }

        if removed > 0 {
            info!("上传会话清理完成: 删除了 {} 个过期会话", removed);
        }
        Ok(removed)
    }

    /// 启动时立即执行一次，之后按间隔执行
    pub fn start_scheduled_cleanup(
        &self,
        interval: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let cleaner = self.clone();
        info!(
            "上传会话定时清理已启动: TTL {} 小时, 间隔 {:?}",
            self.ttl_hours, interval
        );
        spawn_periodic("上传会话清理", Duration::ZERO, interval, shutdown_rx, move || {
            let cleaner = cleaner.clone();
            async move {
                if let Err(e) = cleaner.cleanup_expired_tasks().await {
                    error!("上传会话清理失败: {}", e);
                }
            }
        })
    }
}

async fn remove_session_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("已删除上传临时目录: {:?}", dir),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除上传临时目录失败 {:?}: {}", dir, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::db::test_support::temp_db;
    use crate::persistence::UploadTask;
    use tempfile::TempDir;

    fn session(id: &str, update_time: i64, temp_dir: Option<String>) -> UploadTask {
        UploadTask {
            id: id.to_string(),
            user_id: 1,
            file_name: format!("{}.bin", id),
            total_size: 100,
            uploaded_size: 10,
            temp_dir,
            create_time: update_time,
            update_time,
        }
    }

    #[tokio::test]
    async fn test_expired_sessions_removed() {
        let (_dir, db) = temp_db();
        let tmp = TempDir::new().unwrap();
        let stale_dir = tmp.path().join("u1");
        std::fs::create_dir_all(&stale_dir).unwrap();
        std::fs::write(stale_dir.join("part"), b"x").unwrap();

        let now = 1_000_000;
        db.with_tx(|r| {
            r.uploads().insert(&session(
                "u1",
                now - 25 * 3600,
                Some(stale_dir.to_string_lossy().into_owned()),
            ))?;
            r.uploads().insert(&session("u2", now - 3600, None))
        })
        .unwrap();

        let cleaner = UploadCleaner::new(db.clone(), 24);
        assert_eq!(cleaner.cleanup_expired_tasks_at(now).await.unwrap(), 1);
        assert!(!stale_dir.exists());
        assert!(db.with_repos(|r| r.uploads().get("u1")).unwrap().is_none());
        assert!(db.with_repos(|r| r.uploads().get("u2")).unwrap().is_some());

        assert_eq!(cleaner.cleanup_expired_tasks_at(now).await.unwrap(), 0);
    }
}
