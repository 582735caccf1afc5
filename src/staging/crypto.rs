//! 落盘加密
//!
//! 分块 AES-256-GCM，块大小 1MB，文件格式：
//!
//! ```text
//! magic(8) | nonce_prefix(8) | block_size(u32 LE)
//! [ len(u32 LE) | ciphertext+tag ] * N
//! ```
//!
//! 第 i 块的 nonce = nonce_prefix || i (u32 BE)，AAD 为 1 字节的"是否最后一块"，
//! 截断或重排块都会导致解密失败

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{DownloadError, Result};

const MAGIC: &[u8; 8] = b"ODLENC01";
/// 明文块大小
pub const BLOCK_SIZE: usize = 1024 * 1024;
const TAG_LEN: usize = 16;

/// 文件密钥提供者
///
/// 密钥管理由存储后端负责，这里只需要按文件取得 32 字节密钥
pub trait KeyProvider: Send + Sync {
    fn file_key(&self, file_id: &str) -> Result<[u8; 32]>;
}

/// 由主密钥派生文件密钥：`SHA256(master || file_id)`
pub struct StaticKeyProvider {
    master: [u8; 32],
}

impl StaticKeyProvider {
    pub fn new(master: [u8; 32]) -> Self {
        Self { master }
    }

    /// 从 64 位十六进制字符串创建
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| DownloadError::invalid(format!("加密密钥不是合法的十六进制: {}", e)))?;
        let master: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DownloadError::invalid("加密密钥必须是 32 字节"))?;
        Ok(Self::new(master))
    }

    /// 随机主密钥（仅在进程生命周期内有效）
    pub fn random() -> Self {
        let mut master = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut master);
        Self::new(master)
    }
}

impl KeyProvider for StaticKeyProvider {
    fn file_key(&self, file_id: &str) -> Result<[u8; 32]> {
        let mut hasher = Sha256::new();
        hasher.update(self.master);
        hasher.update(file_id.as_bytes());
        Ok(hasher.finalize().into())
    }
}

fn block_nonce(prefix: &[u8; 8], index: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(prefix);
    nonce[8..].copy_from_slice(&index.to_be_bytes());
    nonce
}

/// 读满缓冲区（EOF 时返回实际读取长度）
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// 加密文件，返回写入的密文文件大小
pub fn encrypt_file(src: &Path, dst: &Path, key: &[u8; 32]) -> Result<u64> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dst)?);

    let mut prefix = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut prefix);

    writer.write_all(MAGIC)?;
    writer.write_all(&prefix)?;
    writer.write_all(&(BLOCK_SIZE as u32).to_le_bytes())?;
    let mut written = (MAGIC.len() + prefix.len() + 4) as u64;

    let mut current = vec![0u8; BLOCK_SIZE];
    let mut next = vec![0u8; BLOCK_SIZE];
    let mut current_len = read_full(&mut reader, &mut current)?;
    let mut index: u32 = 0;

    loop {
        // 预读下一块，判断当前块是否为最后一块
        let next_len = if current_len == BLOCK_SIZE {
            read_full(&mut reader, &mut next)?
        } else {
            0
        };
        let is_last = next_len == 0;

        let nonce = block_nonce(&prefix, index);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &current[..current_len],
                    aad: &[is_last as u8],
                },
            )
            .map_err(|_| DownloadError::storage("加密失败"))?;

        writer.write_all(&(ciphertext.len() as u32).to_le_bytes())?;
        writer.write_all(&ciphertext)?;
        written += 4 + ciphertext.len() as u64;

        if is_last {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
        index = index
            .checked_add(1)
            .ok_or_else(|| DownloadError::storage("文件过大，超出加密块数上限"))?;
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(written)
}

/// 解密文件，返回明文大小
pub fn decrypt_file(src: &Path, dst: &Path, key: &[u8; 32]) -> Result<u64> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dst)?);

    let mut header = [0u8; 20];
    if read_full(&mut reader, &mut header)? != header.len() || &header[..8] != MAGIC {
        return Err(DownloadError::storage("不是有效的加密文件"));
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&header[8..16]);
    let block_size = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;

    let mut plain_total = 0u64;
    let mut index: u32 = 0;
    let mut len_buf = [0u8; 4];
    let mut pending: Option<Vec<u8>> = None;

    loop {
        let n = read_full(&mut reader, &mut len_buf)?;
        let next = if n == 0 {
            None
        } else if n == 4 {
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > block_size + TAG_LEN {
                return Err(DownloadError::storage("加密块长度异常"));
            }
            let mut block = vec![0u8; len];
            if read_full(&mut reader, &mut block)? != len {
                return Err(DownloadError::storage("加密文件被截断"));
            }
            Some(block)
        } else {
            return Err(DownloadError::storage("加密文件被截断"));
        };

        if let Some(block) = pending.take() {
            let is_last = next.is_none();
            let nonce = block_nonce(&prefix, index);
            let plain = cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &block,
                        aad: &[is_last as u8],
                    },
                )
                .map_err(|_| DownloadError::storage("解密失败：密钥错误或文件已损坏"))?;
            writer.write_all(&plain)?;
            plain_total += plain.len() as u64;
            index = index.wrapping_add(1);
        }

        match next {
            Some(block) => pending = Some(block),
            None => break,
        }
    }

    if index == 0 {
        return Err(DownloadError::storage("加密文件被截断"));
    }

    writer.flush()?;
    Ok(plain_total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn roundtrip(len: usize) {
        let dir = TempDir::new().unwrap();
        let plain: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        let src = dir.path().join("a.data");
        let enc = dir.path().join("a.enc");
        let out = dir.path().join("a.out");
        std::fs::write(&src, &plain).unwrap();

        let key = StaticKeyProvider::random().file_key("file-1").unwrap();
        encrypt_file(&src, &enc, &key).unwrap();
        let n = decrypt_file(&enc, &out, &key).unwrap();

        assert_eq!(n as usize, len);
        assert_eq!(std::fs::read(&out).unwrap(), plain);
    }

    #[test]
    fn test_roundtrip_sizes() {
        roundtrip(0);
        roundtrip(10);
        roundtrip(BLOCK_SIZE);
        roundtrip(BLOCK_SIZE * 2 + 7);
    }

    #[test]
    fn test_wrong_key_fails() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.data");
        let enc = dir.path().join("a.enc");
        std::fs::write(&src, b"hello world").unwrap();

        let provider = StaticKeyProvider::random();
        encrypt_file(&src, &enc, &provider.file_key("f1").unwrap()).unwrap();
        let err = decrypt_file(&enc, &dir.path().join("o"), &provider.file_key("f2").unwrap());
        assert!(err.is_err());
    }

    #[test]
    fn test_truncation_detected() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.data");
        let enc = dir.path().join("a.enc");
        std::fs::write(&src, vec![7u8; BLOCK_SIZE + 100]).unwrap();

        let key = [9u8; 32];
        encrypt_file(&src, &enc, &key).unwrap();

        // 去掉最后一块
        let bytes = std::fs::read(&enc).unwrap();
        let first_len = u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]) as usize;
        std::fs::write(&enc, &bytes[..20 + 4 + first_len]).unwrap();

        assert!(decrypt_file(&enc, &dir.path().join("o"), &key).is_err());
    }

    #[test]
    fn test_key_derivation_is_per_file() {
        let provider = StaticKeyProvider::from_hex(&"11".repeat(32)).unwrap();
        let a = provider.file_key("a").unwrap();
        let b = provider.file_key("b").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, provider.file_key("a").unwrap());
        assert!(StaticKeyProvider::from_hex("abcd").is_err());
    }
}
