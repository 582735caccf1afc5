//! 离线下载引擎
//!
//! - `task`: 任务状态机与下载选项
//! - `control`: 暂停 / 取消令牌
//! - `chunk` / `retry` / `engine`: HTTP 分片规划、退避重试与下载
//! - `torrent`: 磁力链接与种子下载
//! - `progress`: 速度采样与进度写库
//! - `ingest`: 下载完成后入库
//! - `manager`: 任务提交、暂停、恢复、取消与重启恢复

pub mod chunk;
pub mod control;
pub mod engine;
pub mod ingest;
pub mod manager;
pub mod progress;
pub mod retry;
pub mod task;
pub mod torrent;

pub use chunk::{plan_chunks, Chunk, ChunkManager, PlanMode};
pub use control::{StopReason, TaskToken};
pub use engine::{HttpFetcher, HttpOutcome, RemoteMeta};
pub use ingest::{IngestedFile, Ingestor};
pub use manager::{DownloadManager, RecoveryReport, SubmitRequest, TaskOutput};
pub use progress::{ProgressReporter, SpeedCalculator};
pub use retry::{RetryDecision, RetryPolicy};
pub use task::{DownloadTask, HttpOptions, TaskKind, TaskOptions, TaskState};
pub use torrent::{
    BatchResult, FailedFile, TorrentClient, TorrentFetcher, TorrentOptions, TorrentSession,
    TorrentSource, UnsupportedTorrentClient,
};
