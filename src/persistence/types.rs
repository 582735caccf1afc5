//! 存储层行模型
//!
//! 离线下载之外的表（文件、用户、回收站、上传会话、磁盘）只保留本引擎和清理任务用到的列

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 物理文件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub id: String,
    /// 文件大小（字节）
    pub size: i64,
    /// 明文数据路径（`.data`）
    pub path: String,
    /// 加密数据路径（`.enc`），仅 `is_enc` 时有值
    pub enc_path: Option<String>,
    /// SHA-256（十六进制）
    pub hash: String,
    /// 缩略图路径
    pub thumbnail_img: Option<String>,
    /// 是否分片存储（`<uuid>/<nnnn>.chunk`）
    pub is_chunk: bool,
    /// 是否加密存储
    pub is_enc: bool,
    /// 所在磁盘
    pub disk_id: Option<String>,
    pub create_time: i64,
}

impl FileInfo {
    /// 分片目录：去掉 `.data` 后缀
    ///
    /// 路径不以 `.data` 结尾时返回 None
    pub fn chunk_dir(&self) -> Option<PathBuf> {
        self.path.strip_suffix(".data").map(PathBuf::from)
    }

    /// 明文数据的 `.info` 元数据文件
    pub fn info_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.info", self.path))
    }

    /// 加密数据的 `.info` 元数据文件
    pub fn enc_info_path(&self) -> Option<PathBuf> {
        self.enc_path
            .as_ref()
            .map(|p| PathBuf::from(format!("{}.info", p)))
    }

    /// 实际保存字节的文件
    pub fn blob_path(&self) -> &Path {
        match (&self.enc_path, self.is_enc) {
            (Some(enc), true) => Path::new(enc),
            _ => Path::new(&self.path),
        }
    }
}

/// 用户与文件的关联（引用计数来源）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserFile {
    pub id: String,
    pub user_id: i64,
    pub file_id: String,
    /// 所在目录
    pub virtual_path: String,
    pub file_name: String,
    pub create_time: i64,
}

/// 用户配额
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub name: String,
    /// 总空间，`<= 0` 表示不限
    pub space: i64,
    /// 剩余空间
    pub free_space: i64,
}

impl User {
    pub fn is_unlimited(&self) -> bool {
        self.space <= 0
    }
}

/// 回收站记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recycled {
    pub id: String,
    pub user_id: i64,
    pub file_id: String,
    /// 被删除的用户文件关联
    pub user_file_id: String,
    pub create_time: i64,
}

/// 上传会话
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadTask {
    pub id: String,
    pub user_id: i64,
    pub file_name: String,
    pub total_size: i64,
    pub uploaded_size: i64,
    /// 会话临时目录
    pub temp_dir: Option<String>,
    pub create_time: i64,
    pub update_time: i64,
}

/// 数据盘
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Disk {
    pub id: String,
    /// 根目录，下含 `data/` 与 `temp/`
    pub data_path: String,
    pub create_time: i64,
}

impl Disk {
    pub fn data_dir(&self) -> PathBuf {
        Path::new(&self.data_path).join("data")
    }

    pub fn temp_dir(&self) -> PathBuf {
        Path::new(&self.data_path).join("temp")
    }
}

/// 分片存储的文件块
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChunk {
    pub id: String,
    pub file_id: String,
    pub chunk_index: i64,
    pub path: String,
    pub size: i64,
}
