//! 带原因的取消令牌
//!
//! 暂停与取消共用一个 [`CancellationToken`]，原因用原子变量区分；
//! 第一个到达的原因生效，后续信号被忽略

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{DownloadError, Result};

const REASON_NONE: u8 = 0;
const REASON_PAUSE: u8 = 1;
const REASON_CANCEL: u8 = 2;

/// 中断原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Pause,
    Cancel,
}

#[derive(Debug, Clone, Default)]
pub struct TaskToken {
    token: CancellationToken,
    reason: Arc<AtomicU8>,
}

impl TaskToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求暂停；已有中断原因时返回 false
    pub fn pause(&self) -> bool {
        self.signal(REASON_PAUSE)
    }

    /// 请求取消；已有中断原因时返回 false
    pub fn cancel(&self) -> bool {
        self.signal(REASON_CANCEL)
    }

    fn signal(&self, reason: u8) -> bool {
        let won = self
            .reason
            .compare_exchange(REASON_NONE, reason, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.token.cancel();
        }
        won
    }

    pub fn reason(&self) -> Option<StopReason> {
        match self.reason.load(Ordering::Acquire) {
            REASON_PAUSE => Some(StopReason::Pause),
            REASON_CANCEL => Some(StopReason::Cancel),
            _ => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 挂起点检查：已中断时返回对应的错误
    pub fn check(&self) -> Result<()> {
        match self.reason() {
            None => Ok(()),
            Some(StopReason::Pause) => Err(DownloadError::Paused),
            Some(StopReason::Cancel) => Err(DownloadError::Cancelled),
        }
    }

    /// 当前中断原因对应的错误（未中断时按取消处理）
    pub fn stop_error(&self) -> DownloadError {
        match self.reason() {
            Some(StopReason::Pause) => DownloadError::Paused,
            _ => DownloadError::Cancelled,
        }
    }

    /// 等待中断
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    /// 可中断的睡眠（重试退避用）
    pub async fn sleep(&self, duration: std::time::Duration) -> Result<()> {
        tokio::select! {
            _ = self.token.cancelled() => Err(self.stop_error()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
