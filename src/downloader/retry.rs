//! 分片重试策略
//!
//! 指数退避 + 全抖动：第 n 次重试等待 `rand(0, min(cap, base * 2^(n-1)))`

use std::time::Duration;

use rand::Rng;

use crate::error::DownloadError;

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 不再重试
    NoRetry,
    /// 等待后重试
    RetryAfter(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次请求）
    pub max_retries: u32,
    /// 退避基数
    pub base_delay: Duration,
    /// 退避上限
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// 第 `retry` 次重试（从 1 开始）的退避上界
    pub fn backoff_ceiling(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// 根据错误决定是否进行第 `retry` 次重试
    pub fn decide(&self, retry: u32, error: &DownloadError) -> RetryDecision {
        if retry > self.max_retries || !error.is_retryable() {
            return RetryDecision::NoRetry;
        }
        let ceiling = self.backoff_ceiling(retry);
        let jittered = if ceiling.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=ceiling)
        };
        RetryDecision::RetryAfter(jittered)
    }
}
