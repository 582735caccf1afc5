//! 断点元数据（`.info` 文件）
//!
//! 与数据文件放在同一个临时目录中：
//!
//! ```text
//! <target_dir>/<task_id>/
//! ├── <name>.data        # 预分配的数据文件，各分片写入各自的偏移
//! └── <name>.data.info   # 本文件，JSON 格式
//! ```
//!
//! 分片区间为左闭右开 `[from, to)`。`written` 记录未完成分片已落盘的前缀长度，
//! 保存前数据文件已经 fsync，恢复时从 `from + written` 继续

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// 单个分片的状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRecord {
    pub from: u64,
    pub to: u64,
    pub done: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub written: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl ChunkRecord {
    pub fn new(from: u64, to: u64) -> Self {
        Self {
            from,
            to,
            done: false,
            written: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.to.saturating_sub(self.from)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 已落盘的字节数
    pub fn completed_bytes(&self) -> u64 {
        if self.done {
            self.len()
        } else {
            self.written.min(self.len())
        }
    }
}

/// 断点元数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sidecar {
    pub url: String,
    /// 文件大小，未知时为 -1
    pub size: i64,
    #[serde(default)]
    pub chunk_size: u64,
    #[serde(default)]
    pub accept_ranges: bool,
    #[serde(default)]
    pub file_name: String,
    pub chunks: Vec<ChunkRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub started_at: i64,
}

impl Sidecar {
    pub fn new(
        url: String,
        size: i64,
        chunk_size: u64,
        accept_ranges: bool,
        file_name: String,
        chunks: Vec<ChunkRecord>,
    ) -> Self {
        Self {
            url,
            size,
            chunk_size,
            accept_ranges,
            file_name,
            chunks,
            sha256: None,
            started_at: chrono::Utc::now().timestamp(),
        }
    }

    /// 已落盘字节总数
    pub fn downloaded_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.completed_bytes()).sum()
    }

    pub fn completed_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.done).count()
    }

    pub fn is_complete(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(|c| c.done)
    }

    /// 判断断点是否可用于继续下载同一个资源
    pub fn matches(&self, url: &str, size: i64) -> bool {
        self.url == url && self.size == size && size > 0
    }

    /// 原子保存：先写临时文件并 fsync，再重命名
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = temp_path_for(path);
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, self).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Failed to serialize sidecar: {}", e),
                )
            })?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&temp_path, path)?;
        debug!(
            "已保存断点: {:?} ({}/{} 分片完成)",
            path,
            self.completed_count(),
            self.chunks.len()
        );
        Ok(())
    }

    /// 加载断点；文件不存在或损坏时返回 None
    pub fn load(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        let parsed = File::open(path).and_then(|file| {
            serde_json::from_reader::<_, Sidecar>(BufReader::new(file)).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Failed to parse sidecar: {}", e),
                )
            })
        });

        match parsed {
            Ok(sidecar) => Some(sidecar),
            Err(e) => {
                warn!("加载断点失败 {:?}: {}", path, e);
                None
            }
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
