//! 离线下载任务
//!
//! 任务行、下载选项与状态机（见 [`TaskState::can_transition_to`]）。
//! 进度在 FINISHED 之前最多为 99

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::DownloadConfig;
use crate::downloader::torrent::TorrentOptions;
use crate::error::{DownloadError, Result};

/// 下载任务状态
///
/// 数值与数据库 `state` 列一致
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// 已提交，尚未派发
    Init = 0,
    /// 下载中
    Downloading = 1,
    /// 已暂停
    Paused = 2,
    /// 已完成
    Finished = 3,
    /// 失败（包括用户取消）
    Failed = 4,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Init,
        TaskState::Downloading,
        TaskState::Paused,
        TaskState::Finished,
        TaskState::Failed,
    ];

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Init),
            1 => Some(Self::Downloading),
            2 => Some(Self::Paused),
            3 => Some(Self::Finished),
            4 => Some(Self::Failed),
            _ => None,
        }
    }

    /// 终态：FINISHED / FAILED 之后任务不会再变化
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// 状态机允许的迁移
    ///
    /// ```text
    /// INIT ─► DOWNLOADING ◄─► PAUSED
    ///              │            │
    ///              ▼            ▼
    ///      FINISHED / FAILED  FAILED (取消)
    /// ```
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Init, Downloading)
                | (Init, Failed)
                | (Downloading, Paused)
                | (Downloading, Finished)
                | (Downloading, Failed)
                | (Paused, Downloading)
                | (Paused, Failed)
        )
    }

    /// 能迁移到 `to` 的所有来源状态（用于条件更新）
    pub fn sources_of(to: TaskState) -> Vec<TaskState> {
        Self::ALL
            .iter()
            .copied()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }
}

/// 任务类型
///
/// 只有 HTTP 与 BT（种子文件 / 磁力链接）由本引擎处理，其余类型由其他下载器负责
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Http,
    Ftp,
    Sftp,
    S3,
    TorrentFile,
    Magnet,
    Local,
    LocalFile,
    Package,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Ftp => "FTP",
            Self::Sftp => "SFTP",
            Self::S3 => "S3",
            Self::TorrentFile => "TORRENT_FILE",
            Self::Magnet => "MAGNET",
            Self::Local => "LOCAL",
            Self::LocalFile => "LOCAL_FILE",
            Self::Package => "PACKAGE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "HTTP" => Self::Http,
            "FTP" => Self::Ftp,
            "SFTP" => Self::Sftp,
            "S3" => Self::S3,
            "TORRENT_FILE" => Self::TorrentFile,
            "MAGNET" => Self::Magnet,
            "LOCAL" => Self::Local,
            "LOCAL_FILE" => Self::LocalFile,
            "PACKAGE" => Self::Package,
            _ => return None,
        })
    }

    pub fn is_torrent(self) -> bool {
        matches!(self, Self::TorrentFile | Self::Magnet)
    }
}

/// HTTP 下载选项
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpOptions {
    /// 落盘加密
    #[serde(default)]
    pub enable_encryption: bool,
    /// 用户网盘中的目标目录
    #[serde(default = "default_virtual_path")]
    pub virtual_path: String,
    /// 单个分片最大重试次数
    pub max_retries: u32,
    /// 分片大小（字节）
    pub chunk_size: u64,
    /// 最大并发分片数
    pub max_concurrent: usize,
    /// 单次请求超时（秒）
    pub timeout_secs: u64,
}

fn default_virtual_path() -> String {
    "/".to_string()
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default())
    }
}

impl HttpOptions {
    /// 以配置文件中的下载参数作为默认值
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            enable_encryption: false,
            virtual_path: default_virtual_path(),
            max_retries: config.max_retries,
            chunk_size: config.chunk_size,
            max_concurrent: config.max_concurrent,
            timeout_secs: config.timeout_secs,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(DownloadError::invalid("chunk_size 必须大于 0"));
        }
        if self.max_concurrent == 0 {
            return Err(DownloadError::invalid("max_concurrent 必须大于 0"));
        }
        if self.timeout_secs == 0 {
            return Err(DownloadError::invalid("timeout_secs 必须大于 0"));
        }
        if !self.virtual_path.starts_with('/') {
            return Err(DownloadError::invalid(format!(
                "virtual_path 必须是绝对路径: {}",
                self.virtual_path
            )));
        }
        Ok(())
    }
}

/// 任务选项快照（按任务类型区分），以 JSON 保存在任务行中
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskOptions {
    Http(HttpOptions),
    Torrent(TorrentOptions),
}

/// 离线下载任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadTask {
    /// 任务ID（UUID v7，插入顺序 = 创建顺序）
    pub id: String,
    /// 所属用户
    pub user_id: i64,
    /// 任务类型
    pub kind: TaskKind,
    /// 下载地址（URL / magnet / 种子文件路径）
    pub url: String,
    /// 用户网盘中的目标目录
    pub virtual_path: String,
    /// 临时下载目录
    pub target_dir: PathBuf,
    /// 文件名（探测前为空）
    pub file_name: String,
    /// 文件大小，未知时为 -1
    pub file_size: i64,
    /// 已下载大小
    pub downloaded_size: i64,
    /// 进度百分比 0-100
    pub progress: i32,
    /// 下载速度 (bytes/s)
    pub speed: i64,
    /// 任务状态
    pub state: TaskState,
    /// 完成后对应的文件ID
    pub file_id: Option<String>,
    /// 错误信息
    pub error_msg: Option<String>,
    /// 选项快照
    pub options: TaskOptions,
    /// 创建时间 (Unix timestamp)
    pub create_time: i64,
    /// 更新时间 (Unix timestamp)
    pub update_time: i64,
}

impl DownloadTask {
    pub fn new(
        user_id: i64,
        kind: TaskKind,
        url: String,
        virtual_path: String,
        target_dir: PathBuf,
        options: TaskOptions,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: new_task_id(),
            user_id,
            kind,
            url,
            virtual_path,
            target_dir,
            file_name: String::new(),
            file_size: -1,
            downloaded_size: 0,
            progress: 0,
            speed: 0,
            state: TaskState::Init,
            file_id: None,
            error_msg: None,
            options,
            create_time: now,
            update_time: now,
        }
    }

    /// HTTP 任务的选项
    /// 本任务的临时目录 `<target_dir>/<task_id>`
    pub fn scratch_dir(&self) -> PathBuf {
        self.target_dir.join(&self.id)
    }
}

/// 生成任务ID
pub fn new_task_id() -> String {
    Uuid::now_v7().to_string()
}

/// 计算进度百分比
///
/// 大小未知时为 0；未完成的任务最多显示 99，只有 FINISHED 才是 100
pub fn compute_progress(downloaded: i64, file_size: i64, finished: bool) -> i32 {
    if finished {
        return 100;
    }
    if file_size <= 0 {
        return 0;
    }
    let pct = (downloaded.max(0) as i128 * 100 / file_size as i128).clamp(0, 100) as i32;
    pct.min(99)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_task_creation() {
        let task = DownloadTask::new(
            7,
            TaskKind::Http,
            "http://example.com/a.bin".to_string(),
            "/".to_string(),
            PathBuf::from("./scratch"),
            TaskOptions::Http(HttpOptions::default()),
        );

        assert_eq!(task.state, TaskState::Init);
        assert_eq!(task.file_size, -1);
        assert_eq!(task.progress, 0);
        assert!(task.file_id.is_none());
        assert_eq!(task.scratch_dir(), PathBuf::from("./scratch").join(&task.id));
    }

    #[test]
    fn test_task_ids_are_monotonic() {
        let a = new_task_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_task_id();
        assert!(a < b);
    }

    #[test]
    fn test_state_machine() {
        use TaskState::*;
        assert!(Init.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Finished));
        assert!(!Paused.can_transition_to(Finished));
        assert!(!Init.can_transition_to(Paused));

        for to in TaskState::ALL {
            assert!(!Finished.can_transition_to(to));
            assert!(!Failed.can_transition_to(to));
        }

        assert_eq!(TaskState::sources_of(Paused), vec![Downloading]);
        assert_eq!(TaskState::sources_of(Downloading), vec![Init, Paused]);
    }

    #[test]
    fn test_state_roundtrip_i64() {
        for s in TaskState::ALL {
            assert_eq!(TaskState::from_i64(s.as_i64()), Some(s));
        }
        assert_eq!(TaskState::from_i64(9), None);
        assert_eq!(TaskKind::parse("MAGNET"), Some(TaskKind::Magnet));
        assert_eq!(TaskKind::parse("magnet"), None);
    }

    #[test]
    fn test_progress_calculation() {
        assert_eq!(compute_progress(0, -1, false), 0);
        assert_eq!(compute_progress(250, 1000, false), 25);
        assert_eq!(compute_progress(500, 1000, false), 50);
        assert_eq!(compute_progress(1000, 1000, false), 99);
        assert_eq!(compute_progress(1000, 1000, true), 100);
    }

    #[test]
    fn test_options_validate() {
        let mut opts = HttpOptions::default();
        assert!(opts.validate().is_ok());
        assert_eq!(opts.chunk_size, 10 * 1024 * 1024);

        opts.chunk_size = 0;
        assert!(opts.validate().is_err());

        let mut opts = HttpOptions::default();
        opts.virtual_path = "relative".to_string();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_options_json_tagged() {
        let opts = TaskOptions::Http(HttpOptions::default());
        let json = serde_json::to_string(&opts).unwrap();
        assert!(json.contains("\"type\":\"http\""));
        let back: TaskOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, opts);
    }

    proptest! {
        #[test]
        fn prop_progress_bounded(downloaded in -10i64..i64::MAX / 2, size in -5i64..i64::MAX / 2) {
            let p = compute_progress(downloaded, size, false);
            prop_assert!((0..100).contains(&p));
            if size <= 0 {
                prop_assert_eq!(p, 0);
            }
        }

        #[test]
        fn prop_progress_matches_ratio_below_completion(size in 1i64..1_000_000_000, frac in 0u32..100) {
            let downloaded = size * frac as i64 / 100;
            let expected = (downloaded as i128 * 100 / size as i128) as i32;
            prop_assert_eq!(compute_progress(downloaded, size, false), expected.min(99));
        }
    }
}
