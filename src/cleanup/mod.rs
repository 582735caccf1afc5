//! 定期清理任务
//!
//! - [`RecycleCleaner`]: 回收站过期记录，按引用计数决定解除关联还是物理删除
//! - [`UploadCleaner`]: 过期的上传会话
//! - [`TempCleaner`]: 各磁盘 `temp/` 下的孤儿目录
//!
//! 每个清理器都提供单次执行（测试直接调用）和定时执行两种入口，
//! 定时循环统一通过 broadcast 关闭信号退出

pub mod recycle;
pub mod temp;
pub mod upload;

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::CleanupConfig;
use crate::persistence::Database;

pub use recycle::{RecycleCleaner, RecycleStats};
pub use temp::TempCleaner;
pub use upload::UploadCleaner;

/// 定时循环的最小间隔
const MIN_PERIOD: Duration = Duration::from_secs(1);

/// 启动一个定时循环：等待 `first_delay` 后执行第一次，之后每 `period` 执行一次
///
/// 收到关闭信号后退出；正在执行的一轮会跑完
pub(crate) fn spawn_periodic<F, Fut>(
    name: &'static str,
    first_delay: Duration,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if !first_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(first_delay) => {}
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，{} 退出", name);
                    return;
                }
            }
        }

        let mut interval = tokio::time::interval(period.max(MIN_PERIOD));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    debug!("{} 开始执行", name);
                    job().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，{} 退出", name);
                    break;
                }
            }
        }
    })
}

/// 三个清理任务的句柄
pub struct Janitors {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl Janitors {
    /// 按配置启动全部清理任务
    pub fn start(db: Database, config: &CleanupConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        let recycle = RecycleCleaner::new(db.clone());
        let upload = UploadCleaner::new(db.clone(), config.upload_ttl_hours);
        let temp = TempCleaner::new(db);

        let handles = vec![
            recycle.start_scheduled_cleanup(
                config.recycle_retention_days,
                Duration::from_secs(config.recycle_interval_secs),
                shutdown_tx.subscribe(),
            ),
            upload.start_scheduled_cleanup(
                Duration::from_secs(config.upload_interval_secs),
                shutdown_tx.subscribe(),
            ),
            temp.start_scheduled_cleanup(
                Duration::from_secs(config.temp_max_age_secs),
                Duration::from_secs(config.temp_interval_secs),
                Duration::from_secs(config.temp_initial_delay_secs),
                shutdown_tx.subscribe(),
            ),
        ];

        info!(
            "清理任务已启动: 回收站保留 {} 天, 上传会话保留 {} 小时, 临时目录保留 {} 秒",
            config.recycle_retention_days, config.upload_ttl_hours, config.temp_max_age_secs
        );
        Self {
            shutdown_tx,
            handles,
        }
    }

    /// 发送关闭信号并等待所有循环退出
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("清理任务已全部停止");
    }
}
