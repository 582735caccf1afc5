//! 离线下载错误类型
//!
//! 错误按处理方式分类（见 [`ErrorKind`]）：
//! - 暂时性网络错误在下载器内部指数退避重试
//! - 其余错误向上传播，任务转为 FAILED 并写入 `error_msg`

use serde::Serialize;
use thiserror::Error;

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// 参数无效（错误的 URL / magnet、非法选项）
    InvalidInput,
    /// 任务不存在
    NotFound,
    /// 状态机冲突（例如对已完成任务执行暂停）
    Conflict,
    /// 可重试的网络错误：连接重置、5xx、408、429、读超时
    NetworkTransient,
    /// 不可重试的网络错误：其他 4xx、错误的 Range 响应、重定向循环
    NetworkFatal,
    /// 磁盘满、权限不足、完成时哈希不一致
    Storage,
    /// 事务失败
    Db,
    /// 用户取消（暂停同样归为此类，但不会写入失败状态）
    Cancelled,
    /// 超出用户剩余空间
    Quota,
}

/// 离线下载错误
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("参数无效: {0}")]
    InvalidInput(String),

    #[error("任务不存在: {0}")]
    NotFound(String),

    #[error("任务状态冲突: {0}")]
    Conflict(String),

    #[error("网络暂时不可用: {0}")]
    NetworkTransient(String),

    #[error("网络请求失败: {0}")]
    NetworkFatal(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("数据库错误: {0}")]
    Db(String),

    /// 用户取消，`error_msg` 固定写入 "cancelled"
    #[error("cancelled")]
    Cancelled,

    /// 用户暂停，工作线程已保存断点并退出（不是失败）
    #[error("paused")]
    Paused,

    #[error("空间不足: 需要 {required} 字节，剩余 {available} 字节")]
    Quota { required: i64, available: i64 },
}

pub type Result<T> = std::result::Result<T, DownloadError>;

impl DownloadError {
    /// 错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NetworkTransient(_) => ErrorKind::NetworkTransient,
            Self::NetworkFatal(_) => ErrorKind::NetworkFatal,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Db(_) => ErrorKind::Db,
            Self::Cancelled | Self::Paused => ErrorKind::Cancelled,
            Self::Quota { .. } => ErrorKind::Quota,
        }
    }

    /// 是否可在下载器内部重试
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::NetworkTransient
    }

    /// 是否由暂停/取消令牌触发
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Paused)
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// 根据 HTTP 状态码构造错误
    pub fn from_status(status: u16, context: &str) -> Self {
        let msg = format!("{}: HTTP {}", context, status);
        match classify_status(status) {
            ErrorKind::NetworkTransient => Self::NetworkTransient(msg),
            _ => Self::NetworkFatal(msg),
        }
    }
}

/// HTTP 状态码分类
///
/// 408 / 429 / 5xx 可重试，其余 4xx 直接失败
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        408 | 429 => ErrorKind::NetworkTransient,
        500..=599 => ErrorKind::NetworkTransient,
        _ => ErrorKind::NetworkFatal,
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<rusqlite::Error> for DownloadError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Db(e.to_string())
    }
}

impl From<r2d2::Error> for DownloadError {
    fn from(e: r2d2::Error) -> Self {
        Self::Db(format!("获取数据库连接失败: {}", e))
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("元数据解析失败: {}", e))
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_redirect() {
            return Self::NetworkFatal(format!("重定向次数过多: {}", e));
        }
        if let Some(status) = e.status() {
            return Self::from_status(status.as_u16(), "请求失败");
        }
        if e.is_builder() {
            return Self::InvalidInput(format!("无效的请求: {}", e));
        }
        // 超时、连接失败、读取数据流失败均可重试
        Self::NetworkTransient(e.to_string())
    }
}
