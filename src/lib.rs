// Offline Download Engine
// 离线下载引擎核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 错误类型
pub mod error;

// 持久化模块（SQLite）
pub mod persistence;

// 临时文件与转正模块
pub mod staging;

// 下载引擎模块
pub mod downloader;

// 🔥 定期清理模块（回收站、上传会话、临时目录）
pub mod cleanup;

// 导出常用类型
pub use cleanup::{Janitors, RecycleCleaner, TempCleaner, UploadCleaner};
pub use config::AppConfig;
pub use downloader::{
    DownloadManager, DownloadTask, SubmitRequest, TaskKind, TaskOptions, TaskState,
};
pub use error::{DownloadError, ErrorKind, Result};
pub use persistence::Database;
