//! 磁力链接解析
//!
//! 格式：`magnet:?xt=urn:btih:<hash>&dn=<name>&tr=<tracker>`，
//! hash 支持 40 位十六进制与 32 位 base32

use serde::{Deserialize, Serialize};

use crate::error::{DownloadError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MagnetLink {
    /// info hash（20 字节）
    pub info_hash: [u8; 20],
    /// 显示名称
    pub display_name: Option<String>,
    /// Tracker 列表
    pub trackers: Vec<String>,
    /// 原始链接
    pub uri: String,
}

impl MagnetLink {
    pub fn parse(uri: &str) -> Result<Self> {
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or_else(|| DownloadError::invalid("磁力链接必须以 'magnet:?' 开头"))?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for param in query.split('&') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = urlencoding::decode(&value.replace('+', " "))
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string());

            match key {
                "xt" => {
                    if let Some(hash) = parse_btih(&value) {
                        info_hash = Some(hash);
                    }
                }
                "dn" => display_name = Some(value),
                "tr" if !value.is_empty() => trackers.push(value),
                _ => {}
            }
        }

        let info_hash = info_hash
            .ok_or_else(|| DownloadError::invalid("磁力链接缺少有效的 xt=urn:btih 参数"))?;

        Ok(Self {
            info_hash,
            display_name,
            trackers,
            uri: uri.to_string(),
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// 显示名称，缺省为 info hash
    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.info_hash_hex())
    }
}

fn parse_btih(xt: &str) -> Option<[u8; 20]> {
    let hash_str = xt.strip_prefix("urn:btih:")?;
    match hash_str.len() {
        40 => {
            let bytes = hex::decode(hash_str).ok()?;
            bytes.try_into().ok()
        }
        32 => base32_decode(hash_str),
        _ => None,
    }
}

/// RFC 4648 base32 解码
fn base32_decode(input: &str) -> Option<[u8; 20]> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut bits = 0u64;
    let mut bit_count = 0u32;
    let mut output = Vec::with_capacity(20);

    for c in input.to_ascii_uppercase().bytes() {
        let val = ALPHABET.iter().position(|&x| x == c)? as u64;
        bits = (bits << 5) | val;
        bit_count += 5;
        while bit_count >= 8 {
            bit_count -= 8;
            output.push((bits >> bit_count) as u8);
            bits &= (1 << bit_count) - 1;
        }
    }

    output.try_into().ok()
}
