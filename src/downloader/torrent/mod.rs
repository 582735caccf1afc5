//! BT 下载
//!
//! BT 协议本身（tracker / DHT / peer wire）由外部库实现，这里只定义它需要满足的接口：
//! - [`TorrentClient::start`]: 以磁力链接或种子文件创建会话，支持限速与连接数上限
//! - [`TorrentSession`]: 逐个吐出会话事件（元数据、分片完成、完成、错误），
//!   支持保留数据的优雅停止
//!
//! [`TorrentFetcher`] 观察分片完成事件，某个文件的全部分片完成后立即单独入库

mod fetcher;
pub mod magnet;

use std::ops::Range;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TorrentConfig;
use crate::downloader::ingest::IngestedFile;
use crate::error::{DownloadError, Result};

pub use fetcher::TorrentFetcher;
pub use magnet::MagnetLink;

/// 1 Mbps = 125000 B/s
const BYTES_PER_MBPS: u64 = 125_000;

/// BT 下载选项（速率 0 表示不限）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TorrentOptions {
    pub max_concurrent_peers: usize,
    pub download_rate_mbps: u32,
    pub upload_rate_mbps: u32,
    #[serde(default)]
    pub enable_encryption: bool,
}

impl Default for TorrentOptions {
    fn default() -> Self {
        Self::from_config(&TorrentConfig::default())
    }
}

impl TorrentOptions {
    pub fn from_config(config: &TorrentConfig) -> Self {
        Self {
            max_concurrent_peers: config.max_concurrent_peers,
            download_rate_mbps: config.download_rate_mbps,
            upload_rate_mbps: config.upload_rate_mbps,
            enable_encryption: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_peers == 0 {
            return Err(DownloadError::invalid("max_concurrent_peers 必须大于 0"));
        }
        Ok(())
    }

    /// 转换为会话参数
    pub fn session_config(&self, save_dir: &Path) -> SessionConfig {
        SessionConfig {
            save_dir: save_dir.to_path_buf(),
            max_peers: self.max_concurrent_peers,
            download_limit_bps: mbps_to_bps(self.download_rate_mbps),
            upload_limit_bps: mbps_to_bps(self.upload_rate_mbps),
        }
    }
}

fn mbps_to_bps(mbps: u32) -> Option<u64> {
    if mbps == 0 {
        None
    } else {
        Some(mbps as u64 * BYTES_PER_MBPS)
    }
}

/// 种子来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentSource {
    Magnet(MagnetLink),
    MetainfoFile(PathBuf),
}

impl TorrentSource {
    /// 解析来源：`magnet:` 开头为磁力链接，否则视为本地种子文件路径
    pub fn parse(source: &str) -> Result<Self> {
        let source = source.trim();
        if source.starts_with("magnet:") {
            return Ok(Self::Magnet(MagnetLink::parse(source)?));
        }
        let path = PathBuf::from(source);
        if !path.is_file() {
            return Err(DownloadError::invalid(format!("种子文件不存在: {}", source)));
        }
        Ok(Self::MetainfoFile(path))
    }

    /// 用于日志与任务显示的名称
    pub fn display_name(&self) -> String {
        match self {
            Self::Magnet(m) => m.name(),
            Self::MetainfoFile(p) => p
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "torrent".to_string()),
        }
    }
}

/// 会话参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// 数据保存目录（任务临时目录）
    pub save_dir: PathBuf,
    pub max_peers: usize,
    /// 下载限速（字节/秒），None 为不限
    pub download_limit_bps: Option<u64>,
    pub upload_limit_bps: Option<u64>,
}

/// 种子中的单个文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFileEntry {
    /// 相对保存目录的路径
    pub path: PathBuf,
    pub length: u64,
    /// 在整个种子数据流中的偏移
    pub offset: u64,
}

/// 种子元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    pub name: String,
    pub piece_length: u64,
    pub total_length: u64,
    pub files: Vec<TorrentFileEntry>,
}

impl TorrentMetadata {
    pub fn piece_count(&self) -> usize {
        if self.piece_length == 0 {
            return 0;
        }
        self.total_length.div_ceil(self.piece_length) as usize
    }

    /// 分片覆盖的字节区间
    pub fn piece_range(&self, index: usize) -> Option<Range<u64>> {
        if index >= self.piece_count() {
            return None;
        }
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.total_length);
        Some(start..end)
    }

    /// 与分片有重叠的文件下标
    pub fn files_for_piece(&self, index: usize) -> Vec<usize> {
        let Some(piece) = self.piece_range(index) else {
            return Vec::new();
        };
        self.files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.length > 0 && f.offset < piece.end && f.offset + f.length > piece.start)
            .map(|(i, _)| i)
            .collect()
    }

    /// 文件覆盖的分片下标区间（空文件为空区间）
    pub fn pieces_for_file(&self, file_index: usize) -> Range<usize> {
        match self.files.get(file_index) {
            Some(f) if f.length > 0 && self.piece_length > 0 => {
                let first = (f.offset / self.piece_length) as usize;
                let last = ((f.offset + f.length - 1) / self.piece_length) as usize;
                first..last + 1
            }
            _ => 0..0,
        }
    }
}

/// 会话事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// 元数据就绪（磁力链接需要先从 peer 获取）
    Metadata(TorrentMetadata),
    /// 分片下载并校验完成
    PieceCompleted { index: usize, downloaded_bytes: u64 },
    /// 全部完成
    Finished,
    /// 会话出错，不可恢复
    Error(String),
}

/// BT 会话
#[async_trait]
pub trait TorrentSession: Send {
    /// 下一个事件；会话结束时返回 None
    async fn next_event(&mut self) -> Option<SessionEvent>;

    /// 停止会话；`preserve_data` 为 true 时保留已下载的数据以便恢复
    async fn stop(&mut self, preserve_data: bool) -> Result<()>;
}

/// BT 客户端（外部库）
#[async_trait]
pub trait TorrentClient: Send + Sync {
    async fn start(
        &self,
        source: &TorrentSource,
        config: &SessionConfig,
    ) -> Result<Box<dyn TorrentSession>>;
}

/// 未配置 BT 引擎时使用，所有种子任务直接失败
pub struct UnsupportedTorrentClient;

#[async_trait]
impl TorrentClient for UnsupportedTorrentClient {
    async fn start(
        &self,
        source: &TorrentSource,
        _config: &SessionConfig,
    ) -> Result<Box<dyn TorrentSession>> {
        Err(DownloadError::invalid(format!(
            "未配置 BT 下载引擎，无法下载: {}",
            source.display_name()
        )))
    }
}

/// 失败的文件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedFile {
    pub name: String,
    pub path: String,
    pub error: String,
}

/// 多文件下载结果
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BatchResult {
    pub total_files: usize,
    pub success_files: Vec<IngestedFile>,
    pub failed_files: Vec<FailedFile>,
}

impl BatchResult {
    pub fn total_size(&self) -> u64 {
        self.success_files.iter().map(|f| f.file_size).sum()
    }
}
