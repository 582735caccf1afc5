//! 进度采样
//!
//! - [`SpeedCalculator`]: 10 秒滑动窗口测速
//! - [`ProgressReporter`]: 下载线程只往 watch 通道里写最新值（不阻塞），
//!   后台写库任务按固定间隔取最新值写入数据库，中间值被合并

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::downloader::task::compute_progress;
use crate::persistence::Database;

/// 默认测速窗口
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(10);

/// 滑动窗口测速器
///
/// 保存 `(时间, 累计字节)` 样本，速度 = 窗口内字节增量 / 时间跨度
#[derive(Debug)]
pub struct SpeedCalculator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl SpeedCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    pub fn with_default_window() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW)
    }

    /// 记录样本
    pub fn record(&mut self, now: Instant, cumulative_bytes: u64) {
        // 断点恢复后累计值可能回退，重新开始测速
        if let Some(&(_, last)) = self.samples.back() {
            if cumulative_bytes < last {
                self.samples.clear();
            }
        }
        self.samples.push_back((now, cumulative_bytes));

        // 保留一个窗口外的最老样本作为基准
        while self.samples.len() > 2 {
            match self.samples.get(1) {
                Some(&(t, _)) if now.duration_since(t) >= self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    /// 当前速度 (bytes/s)
    pub fn speed(&self) -> u64 {
        let (Some(&(t0, b0)), Some(&(t1, b1))) = (self.samples.front(), self.samples.back()) else {
            return 0;
        };
        let elapsed = t1.duration_since(t0).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (b1.saturating_sub(b0) as f64 / elapsed) as u64
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::with_default_window()
    }
}

/// 进度快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub downloaded: u64,
    /// 文件大小，未知时为 -1
    pub total: i64,
}

/// 进度上报句柄（下载线程持有）
pub struct ProgressReporter {
    tx: Arc<watch::Sender<ProgressSnapshot>>,
    stop: CancellationToken,
    writer: Option<JoinHandle<()>>,
}

/// 可克隆的上报端，分发给各个分片线程
#[derive(Clone)]
pub struct ProgressHandle {
    tx: Arc<watch::Sender<ProgressSnapshot>>,
}

impl ProgressHandle {
    pub fn report(&self, downloaded: u64) {
        self.tx.send_modify(|s| s.downloaded = downloaded);
    }
}

impl ProgressReporter {
    /// 启动写库任务
    pub fn spawn(db: Database, task_id: String, initial: ProgressSnapshot, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(initial);
        let stop = CancellationToken::new();
        let writer = tokio::spawn(run_writer(db, task_id, rx, stop.clone(), interval));
        Self {
            tx: Arc::new(tx),
            stop,
            writer: Some(writer),
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        ProgressHandle {
            tx: self.tx.clone(),
        }
    }

    /// 上报累计下载字节（不阻塞，只覆盖最新值）
    pub fn report(&self, downloaded: u64) {
        self.tx.send_modify(|s| s.downloaded = downloaded);
    }

    /// 更新文件大小
    pub fn set_total(&self, total: i64) {
        self.tx.send_modify(|s| s.total = total);
    }

    /// 停止写库任务，并写入最后一次进度
    pub async fn finish(mut self) {
        self.stop.cancel();
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                warn!("进度写库任务异常退出: {}", e);
            }
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run_writer(
    db: Database,
    task_id: String,
    mut rx: watch::Receiver<ProgressSnapshot>,
    stop: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut speed = SpeedCalculator::with_default_window();
    let mut last_written: Option<ProgressSnapshot> = None;

    loop {
        let stopping = tokio::select! {
            _ = ticker.tick() => false,
            _ = stop.cancelled() => true,
        };

        let snapshot = *rx.borrow_and_update();
        speed.record(Instant::now(), snapshot.downloaded);

        if last_written != Some(snapshot) || stopping {
            let current_speed = if stopping { 0 } else { speed.speed() };
            let progress = compute_progress(snapshot.downloaded as i64, snapshot.total, false);
            let db = db.clone();
            let id = task_id.clone();

            let res = tokio::task::spawn_blocking(move || {
                db.with_repos(|r| {
                    r.tasks().update_progress(
                        &id,
                        snapshot.downloaded as i64,
                        current_speed as i64,
                        progress,
                    )
                })
            })
            .await;

            match res {
                Ok(Ok(true)) => last_written = Some(snapshot),
                // 任务已不在下载中（暂停/取消），迟到的进度丢弃
                Ok(Ok(false)) => debug!("任务 {} 已不在下载状态，跳过进度写入", task_id),
                Ok(Err(e)) => warn!("写入任务 {} 进度失败: {}", task_id, e),
                Err(e) => warn!("进度写库任务 panic: {}", e),
            }
        }

        if stopping {
            break;
        }
    }
}
