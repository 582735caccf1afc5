//! 持久化模块
//!
//! SQLite（r2d2 连接池）上的仓储与事务边界：
//! - `download_task`: 离线下载任务
//! - `file_info` / `user_files` / `file_chunk`: 物理文件与用户关联
//! - `users`: 配额
//! - `recycled` / `upload_task` / `disk`: 清理任务使用的辅助表
//!
//! ## 使用示例
//!
//! ```ignore
//! let db = Database::open(&config.database)?;
//!
//! // 多表修改放在同一个事务中
//! db.with_tx(|repos| {
//!     repos.files().insert(&file)?;
//!     repos.user_files().insert(&link)?;
//!     repos.users().adjust_free_space(user_id, -file.size)?;
//!     Ok(())
//! })?;
//! ```

pub mod account_repo;
pub mod db;
pub mod file_repo;
pub mod task_repo;
pub mod types;

pub use account_repo::{DiskRepo, UploadRepo, UserRepo};
pub use db::{Database, DbPool, Repos};
pub use file_repo::{FileChunkRepo, FileRepo, RecycleRepo, UserFileRepo};
pub use task_repo::TaskRepo;
pub use types::{Disk, FileChunk, FileInfo, Recycled, UploadTask, User, UserFile};
