//! 临时文件转正
//!
//! 下载完成的数据文件从临时目录移动到磁盘的 `data/` 目录：
//!
//! ```text
//! <data_path>/data/<YYYYMMDD>/<uuid>.data        # 明文
//! <data_path>/data/<YYYYMMDD>/<uuid>.data.info   # 明文元数据
//! <data_path>/data/<YYYYMMDD>/<uuid>.enc         # 密文（开启加密时）
//! <data_path>/data/<YYYYMMDD>/<uuid>.enc.info
//! ```
//!
//! 开启加密时，入库事务提交后才删除明文 `.data`；事务失败则整体回退到临时目录

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::crypto::{self, KeyProvider};
use crate::error::Result;
use crate::persistence::FileInfo;

/// 临时目录中已校验完成的数据文件
#[derive(Debug, Clone)]
pub struct StagedBlob {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub file_name: String,
}

/// 已移动到正式目录的文件
#[derive(Debug, Clone)]
pub struct PromotedBlob {
    pub file_id: String,
    pub data_path: PathBuf,
    pub enc_path: Option<PathBuf>,
    pub size: u64,
    pub sha256: String,
    pub file_name: String,
    /// 原临时路径（回退用）
    staged_path: PathBuf,
}

impl PromotedBlob {
    pub fn is_enc(&self) -> bool {
        self.enc_path.is_some()
    }

    /// 转换为文件记录
    pub fn to_file_info(&self, disk_id: Option<String>) -> FileInfo {
        FileInfo {
            id: self.file_id.clone(),
            size: self.size as i64,
            path: self.data_path.to_string_lossy().into_owned(),
            enc_path: self
                .enc_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            hash: self.sha256.clone(),
            thumbnail_img: None,
            is_chunk: false,
            is_enc: self.is_enc(),
            disk_id,
            create_time: chrono::Utc::now().timestamp(),
        }
    }
}

/// 正式文件旁的 `.info` 元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobInfo {
    pub id: String,
    pub size: u64,
    pub sha256: String,
    pub file_name: String,
    pub encrypted: bool,
    pub create_time: i64,
}

/// 文件转正器（绑定到一块数据盘）
pub struct Promoter {
    data_root: PathBuf,
    disk_id: Option<String>,
    keys: Arc<dyn KeyProvider>,
}

impl Promoter {
    pub fn new(data_root: PathBuf, disk_id: Option<String>, keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            data_root,
            disk_id,
            keys,
        }
    }

    pub fn disk_id(&self) -> Option<String> {
        self.disk_id.clone()
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    fn bucket_dir(&self) -> PathBuf {
        self.data_root
            .join("data")
            .join(chrono::Local::now().format("%Y%m%d").to_string())
    }

    /// 移动到正式目录并写入元数据，必要时加密
    ///
    /// 阻塞调用（包含整文件加密），异步上下文中应放到 `spawn_blocking`
    pub fn promote(&self, staged: &StagedBlob, encrypt: bool) -> Result<PromotedBlob> {
        let file_id = Uuid::new_v4().to_string();
        let bucket = self.bucket_dir();
        fs::create_dir_all(&bucket)?;

        let data_path = bucket.join(format!("{}.data", file_id));
        move_file(&staged.path, &data_path)?;

        let mut promoted = PromotedBlob {
            file_id: file_id.clone(),
            data_path: data_path.clone(),
            enc_path: None,
            size: staged.size,
            sha256: staged.sha256.clone(),
            file_name: staged.file_name.clone(),
            staged_path: staged.path.clone(),
        };

        let result = self.write_artifacts(&mut promoted, encrypt);
        if let Err(e) = result {
            warn!("写入正式文件元数据失败，回退: {}", e);
            self.revert(&promoted);
            return Err(e);
        }

        info!(
            "✓ 文件已转正: {} -> {:?} (size={}, enc={})",
            staged.file_name,
            data_path,
            staged.size,
            promoted.is_enc()
        );
        Ok(promoted)
    }

    fn write_artifacts(&self, promoted: &mut PromotedBlob, encrypt: bool) -> Result<()> {
        let blob_info = BlobInfo {
            id: promoted.file_id.clone(),
            size: promoted.size,
            sha256: promoted.sha256.clone(),
            file_name: promoted.file_name.clone(),
            encrypted: encrypt,
            create_time: chrono::Utc::now().timestamp(),
        };

        if encrypt {
            let enc_path = promoted.data_path.with_extension("enc");
            promoted.enc_path = Some(enc_path.clone());
            let key = self.keys.file_key(&promoted.file_id)?;
            crypto::encrypt_file(&promoted.data_path, &enc_path, &key)?;
            write_json(&info_path_of(&enc_path), &blob_info)?;
        } else {
            write_json(&info_path_of(&promoted.data_path), &blob_info)?;
        }
        Ok(())
    }

    /// 入库事务提交后调用：加密文件删除明文副本
    pub fn finalize(&self, promoted: &PromotedBlob) {
        if promoted.is_enc() {
            if let Err(e) = fs::remove_file(&promoted.data_path) {
                warn!("删除明文副本失败 {:?}: {}", promoted.data_path, e);
            }
        }
    }

    /// 入库失败时回退：数据文件移回临时目录，删除正式目录中的产物
    pub fn revert(&self, promoted: &PromotedBlob) {
        if let Err(e) = move_file(&promoted.data_path, &promoted.staged_path) {
            warn!(
                "回退数据文件失败 {:?} -> {:?}: {}",
                promoted.data_path, promoted.staged_path, e
            );
        }

        let mut leftovers = vec![info_path_of(&promoted.data_path)];
        if let Some(ref enc) = promoted.enc_path {
            leftovers.push(enc.clone());
            leftovers.push(info_path_of(enc));
        }
        for path in leftovers {
            remove_if_exists(&path);
        }

        if let Some(bucket) = promoted.data_path.parent() {
            remove_dir_if_empty(bucket);
        }
        debug!("已回退转正: file_id={}", promoted.file_id);
    }
}

/// `<path>.info`
pub fn info_path_of(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".info");
    PathBuf::from(name)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    fs::write(path, content)?;
    Ok(())
}

/// 重命名，跨设备时退化为复制 + 删除
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("重命名失败，改为复制: {:?} -> {:?} ({})", from, to, e);
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

pub(crate) fn remove_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除文件失败 {:?}: {}", path, e),
    }
}

/// 目录为空时删除，返回是否删除
pub fn remove_dir_if_empty(dir: &Path) -> bool {
    let empty = fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    empty && fs::remove_dir(dir).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::crypto::StaticKeyProvider;
    use tempfile::TempDir;

    fn setup(content: &[u8]) -> (TempDir, Promoter, StagedBlob) {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("scratch").join("task1");
        fs::create_dir_all(&scratch).unwrap();
        let staged_path = scratch.join("a.bin.data");
        fs::write(&staged_path, content).unwrap();

        let promoter = Promoter::new(
            dir.path().join("disk0"),
            Some("disk0".to_string()),
            Arc::new(StaticKeyProvider::random()),
        );
        let staged = StagedBlob {
            path: staged_path,
            size: content.len() as u64,
            sha256: "00".repeat(32),
            file_name: "a.bin".to_string(),
        };
        (dir, promoter, staged)
    }

    #[test]
    fn test_promote_plain() {
        let (_dir, promoter, staged) = setup(b"hello");
        let promoted = promoter.promote(&staged, false).unwrap();

        assert!(!staged.path.exists());
        assert_eq!(fs::read(&promoted.data_path).unwrap(), b"hello");
        assert!(promoted.data_path.to_string_lossy().ends_with(".data"));
        assert!(info_path_of(&promoted.data_path).exists());
        assert!(promoted.enc_path.is_none());

        let info = promoted.to_file_info(promoter.disk_id());
        assert_eq!(info.size, 5);
        assert!(!info.is_enc);
        assert!(info.chunk_dir().is_some());
    }

    #[test]
    fn test_promote_encrypted_then_finalize() {
        let (_dir, promoter, staged) = setup(b"secret bytes");
        let promoted = promoter.promote(&staged, true).unwrap();

        let enc = promoted.enc_path.clone().unwrap();
        assert!(enc.exists());
        assert!(info_path_of(&enc).exists());
        assert!(promoted.data_path.exists());

        promoter.finalize(&promoted);
        assert!(!promoted.data_path.exists());
        assert!(enc.exists());
    }

    #[test]
    fn test_revert_restores_staged_file() {
        let (_dir, promoter, staged) = setup(b"hello");
        let promoted = promoter.promote(&staged, true).unwrap();
        promoter.revert(&promoted);

        assert_eq!(fs::read(&staged.path).unwrap(), b"hello");
        assert!(!promoted.data_path.exists());
        assert!(!promoted.enc_path.unwrap().exists());
        // 空的日期目录已删除
        assert!(!promoted.data_path.parent().unwrap().exists());
    }

    #[test]
    fn test_remove_dir_if_empty() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("a");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("f"), b"x").unwrap();
        assert!(!remove_dir_if_empty(&sub));
        fs::remove_file(sub.join("f")).unwrap();
        assert!(remove_dir_if_empty(&sub));
        assert!(!sub.exists());
    }
}
