//! 下载管理器
//!
//! 负责任务提交、按类型分派到 HTTP / BT 下载器、持有每个运行中任务的令牌，
//! 以及暂停 / 恢复 / 取消 / 删除 / 重启恢复 / 优雅退出
//!
//! 任务行的状态只由工作线程在退出时写入（暂停、取消请求只翻转令牌），
//! 所以外部看到的状态总是工作线程已经确认过的状态

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, DownloadConfig, TorrentConfig};
use crate::downloader::control::TaskToken;
use crate::downloader::engine::{validate_url, HttpFetcher, HttpOutcome};
use crate::downloader::ingest::Ingestor;
use crate::downloader::task::{DownloadTask, HttpOptions, TaskKind, TaskOptions, TaskState};
use crate::downloader::torrent::{
    BatchResult, TorrentClient, TorrentFetcher, TorrentOptions, TorrentSource,
};
use crate::error::{DownloadError, Result};
use crate::persistence::Database;
use crate::staging::ScratchLayout;

/// 任务提交请求
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub user_id: i64,
    pub kind: TaskKind,
    /// URL / 磁力链接 / 种子文件路径
    pub url: String,
    /// 用户网盘中的目标目录
    pub virtual_path: String,
    /// 临时下载目录，缺省使用配置中的 `storage.scratch_dir`
    pub target_dir: Option<PathBuf>,
    /// 选项，缺省使用配置中的默认值
    pub options: Option<TaskOptions>,
}

/// 工作线程的执行结果
#[derive(Debug, Clone)]
pub enum TaskOutput {
    File(HttpOutcome),
    Batch(BatchResult),
}

/// 重启恢复统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// DOWNLOADING → PAUSED 的任务数
    pub paused: usize,
    /// 重新分派的 INIT 任务数
    pub redispatched: usize,
}

#[derive(Clone)]
struct ActiveTask {
    token: TaskToken,
    /// 工作线程退出并写完最终状态后变为 true
    done: watch::Receiver<bool>,
}

/// 下载管理器
#[derive(Clone)]
pub struct DownloadManager {
    db: Database,
    http: HttpFetcher,
    torrent: TorrentFetcher,
    download_defaults: Arc<DownloadConfig>,
    torrent_defaults: Arc<TorrentConfig>,
    scratch_dir: PathBuf,
    /// 运行中的任务（task_id -> 令牌）
    active: Arc<DashMap<String, ActiveTask>>,
    accepting: Arc<AtomicBool>,
}

impl DownloadManager {
    pub fn new(
        db: Database,
        ingestor: Ingestor,
        torrent_client: Arc<dyn TorrentClient>,
        config: &AppConfig,
    ) -> Result<Self> {
        let http = HttpFetcher::new(db.clone(), ingestor.clone(), &config.download)?;
        let torrent = TorrentFetcher::new(
            torrent_client,
            ingestor,
            db.clone(),
            Duration::from_millis(config.download.progress_interval_ms),
        );

        info!(
            "创建下载管理器: 临时目录={:?}, 分片大小={}, 并发={}",
            config.storage.scratch_dir, config.download.chunk_size, config.download.max_concurrent
        );

        Ok(Self {
            db,
            http,
            torrent,
            download_defaults: Arc::new(config.download.clone()),
            torrent_defaults: Arc::new(config.torrent.clone()),
            scratch_dir: config.storage.scratch_dir.clone(),
            active: Arc::new(DashMap::new()),
            accepting: Arc::new(AtomicBool::new(true)),
        })
    }

    /// 提交任务：校验参数、写入 INIT 行、启动工作线程后立即返回任务ID
    pub fn submit(&self, req: SubmitRequest) -> Result<String> {
        self.ensure_accepting()?;
        let task = self.build_task(req)?;
        self.db.with_repos(|r| r.tasks().insert(&task))?;
        info!(
            "提交任务: id={}, user={}, kind={}, url={}",
            task.id,
            task.user_id,
            task.kind.as_str(),
            task.url
        );
        let id = task.id.clone();
        self.dispatch(task)?;
        Ok(id)
    }

    /// 同步执行 HTTP 下载（任务行不存在时按给定ID创建）
    pub async fn download_http(
        &self,
        task_id: &str,
        url: &str,
        user_id: i64,
        target_dir: &Path,
        mut opts: HttpOptions,
    ) -> Result<HttpOutcome> {
        self.ensure_accepting()?;
        opts.validate()?;
        validate_url(url)?;

        let task = match self.db.with_repos(|r| r.tasks().get(task_id))? {
            Some(task) => task,
            None => {
                opts.virtual_path = normalize_virtual_path(&opts.virtual_path)?;
                let mut task = DownloadTask::new(
                    user_id,
                    TaskKind::Http,
                    url.to_string(),
                    opts.virtual_path.clone(),
                    target_dir.to_path_buf(),
                    TaskOptions::Http(opts),
                );
                task.id = task_id.to_string();
                self.db.with_repos(|r| r.tasks().insert(&task))?;
                task
            }
        };

        match self.run_inline(task).await? {
            TaskOutput::File(outcome) => Ok(outcome),
            TaskOutput::Batch(_) => Err(DownloadError::invalid(format!(
                "任务 {} 不是 HTTP 任务",
                task_id
            ))),
        }
    }

    /// 同步执行 BT 下载，返回每个文件的入库结果
    pub async fn download_torrent(
        &self,
        source: &str,
        user_id: i64,
        target_dir: &Path,
        virtual_path: &str,
        opts: TorrentOptions,
    ) -> Result<BatchResult> {
        self.ensure_accepting()?;
        let task = self.build_task(SubmitRequest {
            user_id,
            kind: torrent_kind(source),
            url: source.to_string(),
            virtual_path: virtual_path.to_string(),
            target_dir: Some(target_dir.to_path_buf()),
            options: Some(TaskOptions::Torrent(opts)),
        })?;
        self.db.with_repos(|r| r.tasks().insert(&task))?;

        match self.run_inline(task).await? {
            TaskOutput::Batch(batch) => Ok(batch),
            TaskOutput::File(outcome) => Ok(BatchResult {
                total_files: 1,
                success_files: vec![outcome.file],
                failed_files: Vec::new(),
            }),
        }
    }

    /// 暂停任务，等待工作线程保存断点并退出
    pub async fn pause_download(&self, task_id: &str) -> Result<()> {
        let task = self.get_task(task_id)?;

        if let Some(active) = self.active_entry(task_id) {
            if !active.token.pause() {
                debug!("任务 {} 已在停止中", task_id);
            }
            wait_done(active.done).await;
            let task = self.get_task(task_id)?;
            return match task.state {
                TaskState::Paused => {
                    info!("任务已暂停: {}", task_id);
                    Ok(())
                }
                state => Err(DownloadError::conflict(format!(
                    "任务 {} 在暂停前已结束，当前状态 {:?}",
                    task_id, state
                ))),
            };
        }

        match task.state {
            TaskState::Paused => Ok(()),
            // 没有工作线程的 DOWNLOADING 行（进程异常退出后尚未恢复）
            TaskState::Downloading => {
                self.db.with_repos(|r| r.tasks().mark_paused(task_id))?;
                info!("任务已暂停（无运行中的工作线程）: {}", task_id);
                Ok(())
            }
            state => Err(DownloadError::conflict(format!(
                "任务 {} 当前状态 {:?} 不可暂停",
                task_id, state
            ))),
        }
    }

    /// 恢复暂停的任务；`target_dir` 与原目录不同时迁移临时目录
    pub async fn resume_download(
        &self,
        task_id: &str,
        user_id: i64,
        target_dir: Option<&Path>,
    ) -> Result<()> {
        self.ensure_accepting()?;
        let mut task = self.get_task(task_id)?;
        if task.user_id != user_id {
            return Err(DownloadError::NotFound(task_id.to_string()));
        }
        if task.state != TaskState::Paused {
            return Err(DownloadError::conflict(format!(
                "任务 {} 当前状态 {:?} 不可恢复",
                task_id, task.state
            )));
        }

        if let Some(dir) = target_dir {
            if dir != task.target_dir.as_path() {
                relocate_scratch(&task, dir).await;
                self.db
                    .with_repos(|r| r.tasks().update_target_dir(task_id, dir))?;
                task.target_dir = dir.to_path_buf();
            }
        }

        info!("恢复任务: {}", task_id);
        self.dispatch(task)
    }

    /// 取消任务：删除临时目录，任务转为 FAILED("cancelled")
    pub async fn cancel_download(&self, task_id: &str) -> Result<()> {
        self.get_task(task_id)?;

        if let Some(active) = self.active_entry(task_id) {
            if !active.token.cancel() {
                debug!("任务 {} 已在停止中，等待其退出后再取消", task_id);
            }
            wait_done(active.done).await;
        }

        let task = self.get_task(task_id)?;
        match task.state {
            TaskState::Failed if task.error_msg.as_deref() == Some("cancelled") => {
                info!("任务已取消: {}", task_id);
                Ok(())
            }
            TaskState::Init | TaskState::Paused | TaskState::Downloading => {
                ScratchLayout::new(&task.target_dir, &task.id).remove().await?;
                self.db.with_repos(|r| {
                    r.tasks()
                        .mark_failed(task_id, &DownloadError::Cancelled.to_string())
                })?;
                info!("任务已取消: {}", task_id);
                Ok(())
            }
            state => Err(DownloadError::conflict(format!(
                "任务 {} 已结束（{:?}），无法取消",
                task_id, state
            ))),
        }
    }

    /// 删除任务行（下载中的任务需先暂停或取消）
    pub async fn delete_task(&self, task_id: &str, user_id: i64) -> Result<()> {
        let task = self.get_task(task_id)?;
        if task.user_id != user_id {
            return Err(DownloadError::NotFound(task_id.to_string()));
        }
        if self.active.contains_key(task_id) || task.state == TaskState::Downloading {
            return Err(DownloadError::conflict(format!(
                "任务 {} 正在下载，请先暂停或取消",
                task_id
            )));
        }

        ScratchLayout::new(&task.target_dir, &task.id).remove().await?;
        self.db.with_repos(|r| r.tasks().delete(task_id))?;
        info!("任务已删除: {}", task_id);
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Result<DownloadTask> {
        self.db.with_repos(|r| r.tasks().require(task_id))
    }

    /// 用户的任务列表（按创建时间倒序）
    pub fn list_tasks(&self, user_id: i64, offset: i64, limit: i64) -> Result<Vec<DownloadTask>> {
        self.db
            .with_repos(|r| r.tasks().list_by_user(user_id, offset, limit))
    }

    pub fn list_tasks_by_state(
        &self,
        user_id: i64,
        state: TaskState,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<DownloadTask>> {
        self.db
            .with_repos(|r| r.tasks().list_by_user_state(user_id, state, offset, limit))
    }

    pub fn count_tasks(&self, user_id: i64, state: Option<TaskState>) -> Result<i64> {
        self.db.with_repos(|r| r.tasks().count(user_id, state))
    }

    /// 运行中的任务数
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// 启动时恢复：遗留的 DOWNLOADING 转为 PAUSED（由用户从断点恢复），INIT 重新分派
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let interrupted = self
            .db
            .with_repos(|r| r.tasks().list_by_state(TaskState::Downloading))?;
        for task in interrupted {
            if self.active.contains_key(&task.id) {
                continue;
            }
            match self.db.with_repos(|r| r.tasks().mark_paused(&task.id)) {
                Ok(()) => report.paused += 1,
                Err(e) => warn!("恢复任务 {} 失败: {}", task.id, e),
            }
        }

        let pending = self
            .db
            .with_repos(|r| r.tasks().list_by_state(TaskState::Init))?;
        for task in pending {
            let id = task.id.clone();
            match self.dispatch(task) {
                Ok(()) => report.redispatched += 1,
                Err(e) => warn!("重新分派任务 {} 失败: {}", id, e),
            }
        }

        info!(
            "任务恢复完成: {} 个转为暂停, {} 个重新分派",
            report.paused, report.redispatched
        );
        Ok(report)
    }

    /// 优雅退出：停止接收新任务，暂停所有运行中的任务并等待其退出
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::Release);

        let running: Vec<ActiveTask> = self.active.iter().map(|e| e.value().clone()).collect();
        if running.is_empty() {
            info!("下载管理器已关闭，无运行中的任务");
            return;
        }

        info!("正在暂停 {} 个运行中的任务", running.len());
        for task in &running {
            task.token.pause();
        }

        let waits = futures::future::join_all(running.into_iter().map(|t| wait_done(t.done)));
        match tokio::time::timeout(grace, waits).await {
            Ok(_) => info!("✓ 所有任务已保存断点并退出"),
            Err(_) => warn!(
                "等待任务退出超时（{:?}），仍有 {} 个任务未退出",
                grace,
                self.active.len()
            ),
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.accepting.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DownloadError::conflict("下载管理器正在关闭，不再接收任务"))
        }
    }

    fn build_task(&self, req: SubmitRequest) -> Result<DownloadTask> {
        let virtual_path = normalize_virtual_path(&req.virtual_path)?;
        let target_dir = req.target_dir.unwrap_or_else(|| self.scratch_dir.clone());

        let options = match req.kind {
            TaskKind::Http => {
                validate_url(&req.url)?;
                let mut opts = match req.options {
                    Some(TaskOptions::Http(o)) => o,
                    None => HttpOptions::from_config(&self.download_defaults),
                    Some(_) => return Err(DownloadError::invalid("HTTP 任务需要 HTTP 选项")),
                };
                opts.virtual_path = virtual_path.clone();
                opts.validate()?;
                TaskOptions::Http(opts)
            }
            kind if kind.is_torrent() => {
                TorrentSource::parse(&req.url)?;
                let opts = match req.options {
                    Some(TaskOptions::Torrent(o)) => o,
                    None => TorrentOptions::from_config(&self.torrent_defaults),
                    Some(_) => return Err(DownloadError::invalid("BT 任务需要 BT 选项")),
                };
                opts.validate()?;
                TaskOptions::Torrent(opts)
            }
            kind => {
                return Err(DownloadError::invalid(format!(
                    "不支持的任务类型: {}",
                    kind.as_str()
                )))
            }
        };

        Ok(DownloadTask::new(
            req.user_id,
            req.kind,
            req.url.trim().to_string(),
            virtual_path,
            target_dir,
            options,
        ))
    }

    fn active_entry(&self, task_id: &str) -> Option<ActiveTask> {
        self.active.get(task_id).map(|e| e.value().clone())
    }

    fn register(&self, task_id: &str) -> Result<(TaskToken, watch::Sender<bool>)> {
        match self.active.entry(task_id.to_string()) {
            Entry::Occupied(_) => Err(DownloadError::conflict(format!(
                "任务 {} 已在运行",
                task_id
            ))),
            Entry::Vacant(slot) => {
                let token = TaskToken::new();
                let (tx, rx) = watch::channel(false);
                slot.insert(ActiveTask {
                    token: token.clone(),
                    done: rx,
                });
                Ok((token, tx))
            }
        }
    }

    /// 转为 DOWNLOADING 并在后台运行
    fn dispatch(&self, task: DownloadTask) -> Result<()> {
        let (token, done) = self.register(&task.id)?;
        let guard = self.worker_guard(&task.id, done);
        self.db.with_repos(|r| r.tasks().mark_downloading(&task.id))?;

        let manager = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let _ = manager.run_registered(&task, &token).await;
        });
        Ok(())
    }

    /// 转为 DOWNLOADING 并在当前任务中运行到结束
    async fn run_inline(&self, task: DownloadTask) -> Result<TaskOutput> {
        let (token, done) = self.register(&task.id)?;
        let _guard = self.worker_guard(&task.id, done);
        self.db.with_repos(|r| r.tasks().mark_downloading(&task.id))?;
        self.run_registered(&task, &token).await
    }

    fn worker_guard(&self, task_id: &str, done: watch::Sender<bool>) -> WorkerGuard {
        WorkerGuard {
            db: self.db.clone(),
            active: self.active.clone(),
            task_id: task_id.to_string(),
            done,
        }
    }

    async fn run_registered(&self, task: &DownloadTask, token: &TaskToken) -> Result<TaskOutput> {
        info!("任务开始下载: {}", task.id);
        let result = self.execute(task, token).await;
        self.settle(&task.id, &result);
        result
    }

    async fn execute(&self, task: &DownloadTask, token: &TaskToken) -> Result<TaskOutput> {
        match (&task.options, task.kind) {
            (TaskOptions::Http(opts), TaskKind::Http) => self
                .http
                .download_http(&task.id, &task.url, task.user_id, &task.target_dir, opts, token)
                .await
                .map(TaskOutput::File),
            (TaskOptions::Torrent(opts), kind) if kind.is_torrent() => {
                let source = TorrentSource::parse(&task.url)?;
                self.torrent
                    .download(
                        &task.id,
                        &source,
                        task.user_id,
                        &task.target_dir,
                        &task.virtual_path,
                        opts,
                        token,
                    )
                    .await
                    .map(TaskOutput::Batch)
            }
            (_, kind) => Err(DownloadError::invalid(format!(
                "任务类型 {} 与选项不匹配",
                kind.as_str()
            ))),
        }
    }

    /// 写入工作线程退出时的最终状态
    fn settle(&self, task_id: &str, result: &Result<TaskOutput>) {
        let written = self.db.with_repos(|r| {
            let tasks = r.tasks();
            match result {
                Ok(TaskOutput::File(outcome)) => tasks.mark_finished(
                    task_id,
                    &outcome.file.file_id,
                    outcome.file.file_size as i64,
                ),
                Ok(TaskOutput::Batch(batch)) => match batch.success_files.first() {
                    Some(first) => {
                        tasks.mark_finished(task_id, &first.file_id, batch.total_size() as i64)
                    }
                    None => {
                        let reason = batch
                            .failed_files
                            .first()
                            .map(|f| f.error.as_str())
                            .unwrap_or("种子中没有文件");
                        tasks.mark_failed(
                            task_id,
                            &format!("全部 {} 个文件下载失败: {}", batch.total_files, reason),
                        )
                    }
                },
                Err(DownloadError::Paused) => tasks.mark_paused(task_id),
                Err(e) => tasks.mark_failed(task_id, &e.to_string()),
            }
        });

        match (result, written) {
            (_, Err(e)) => error!("写入任务 {} 最终状态失败: {}", task_id, e),
            (Ok(_), Ok(())) => info!("✓ 任务完成: {}", task_id),
            (Err(DownloadError::Paused), Ok(())) => info!("任务已暂停: {}", task_id),
            (Err(e), Ok(())) => warn!("任务失败: {}, {}", task_id, e),
        }
    }
}

/// 工作线程退出时注销运行记录并通知等待者
///
/// 线程 panic 时 `settle` 不会执行，由这里把任务转为 FAILED
struct WorkerGuard {
    db: Database,
    active: Arc<DashMap<String, ActiveTask>>,
    task_id: String,
    done: watch::Sender<bool>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("工作线程异常退出: task={}", self.task_id);
            let id = &self.task_id;
            if let Err(e) = self
                .db
                .with_repos(|r| r.tasks().mark_failed(id, "工作线程异常退出"))
            {
                error!("写入任务 {} 最终状态失败: {}", id, e);
            }
        }
        self.active.remove(&self.task_id);
        let _ = self.done.send(true);
    }
}

/// 等待工作线程退出
async fn wait_done(mut done: watch::Receiver<bool>) {
    while !*done.borrow_and_update() {
        if done.changed().await.is_err() {
            break;
        }
    }
}

/// 迁移临时目录，失败时新目录从头下载
async fn relocate_scratch(task: &DownloadTask, new_dir: &Path) {
    let old = task.scratch_dir();
    if !old.exists() {
        return;
    }
    let new = new_dir.join(&task.id);
    let moved = async {
        tokio::fs::create_dir_all(new_dir).await?;
        tokio::fs::rename(&old, &new).await
    };
    match moved.await {
        Ok(()) => info!("临时目录已迁移: {:?} -> {:?}", old, new),
        Err(e) => warn!("迁移临时目录失败 {:?} -> {:?}: {}，将重新下载", old, new, e),
    }
}

fn torrent_kind(source: &str) -> TaskKind {
    if source.trim().starts_with("magnet:") {
        TaskKind::Magnet
    } else {
        TaskKind::TorrentFile
    }
}

/// 网盘路径必须以 `/` 开头，去掉末尾的 `/`
fn normalize_virtual_path(path: &str) -> Result<String> {
    let path = path.trim();
    if !path.starts_with('/') {
        return Err(DownloadError::invalid(format!(
            "virtual_path 必须是绝对路径: {}",
            path
        )));
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err(DownloadError::invalid(format!(
            "virtual_path 不能包含 '..': {}",
            path
        )));
    }
    let trimmed = path.trim_end_matches('/');
    Ok(if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    })
}
