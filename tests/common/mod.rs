#![allow(dead_code)]

pub mod range_server;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use offline_dl::config::AppConfig;
use offline_dl::downloader::torrent::UnsupportedTorrentClient;
use offline_dl::downloader::{DownloadTask, HttpOptions, Ingestor, TaskState};
use offline_dl::persistence::{Disk, User};
use offline_dl::staging::{Promoter, StaticKeyProvider};
use offline_dl::{Database, DownloadManager};
use tempfile::TempDir;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

/// 有限空间的用户
pub const LIMITED_USER: i64 = 1;
/// 不限空间的用户
pub const UNLIMITED_USER: i64 = 2;
pub const LIMITED_SPACE: i64 = 100 * MIB as i64;

pub struct Harness {
    pub dir: TempDir,
    pub db: Database,
    pub manager: DownloadManager,
    pub config: AppConfig,
    pub keys: Arc<StaticKeyProvider>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = Database::open_path(&dir.path().join("test.db"), 4, Duration::from_secs(5)).unwrap();

        let disk = Disk {
            id: "disk0".to_string(),
            data_path: dir.path().join("disk0").to_string_lossy().into_owned(),
            create_time: 0,
        };
        db.with_tx(|r| {
            r.disks().insert(&disk)?;
            r.users().insert(&User {
                id: LIMITED_USER,
                name: "limited".to_string(),
                space: LIMITED_SPACE,
                free_space: LIMITED_SPACE,
            })?;
            r.users().insert(&User {
                id: UNLIMITED_USER,
                name: "unlimited".to_string(),
                space: 0,
                free_space: 0,
            })
        })
        .unwrap();

        let mut config = AppConfig::default();
        config.storage.scratch_dir = dir.path().join("scratch");
        config.download.retry_base_ms = 10;
        config.download.retry_cap_ms = 50;
        config.download.progress_interval_ms = 20;

        let keys = Arc::new(StaticKeyProvider::random());
        let promoter = Promoter::new(
            PathBuf::from(&disk.data_path),
            Some(disk.id.clone()),
            keys.clone(),
        );
        let ingestor = Ingestor::new(db.clone(), Arc::new(promoter));
        let manager = DownloadManager::new(
            db.clone(),
            ingestor,
            Arc::new(UnsupportedTorrentClient),
            &config,
        )
        .unwrap();

        Self {
            dir,
            db,
            manager,
            config,
            keys,
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.config.storage.scratch_dir.clone()
    }

    pub fn free_space(&self, user_id: i64) -> i64 {
        self.db
            .with_repos(|r| r.users().require(user_id))
            .unwrap()
            .free_space
    }

    /// 轮询任务直到满足条件
    pub async fn wait_for<F>(&self, task_id: &str, what: &str, pred: F) -> DownloadTask
    where
        F: Fn(&DownloadTask) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let task = self.manager.get_task(task_id).unwrap();
            if pred(&task) {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "等待超时（{}）: {:?}",
                what,
                task
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_state(&self, task_id: &str, state: TaskState) -> DownloadTask {
        self.wait_for(task_id, &format!("{:?}", state), |t| t.state == state)
            .await
    }
}

pub fn http_options(chunk_size: u64, max_concurrent: usize) -> HttpOptions {
    HttpOptions {
        chunk_size,
        max_concurrent,
        max_retries: 3,
        timeout_secs: 30,
        ..HttpOptions::default()
    }
}

/// 可重复生成的测试内容
pub fn payload(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn read_blob(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}
