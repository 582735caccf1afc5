// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
    /// 数据库配置
    #[serde(default)]
    pub database: DatabaseConfig,
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// HTTP 下载默认参数
    #[serde(default)]
    pub download: DownloadConfig,
    /// BT 下载默认参数
    #[serde(default)]
    pub torrent: TorrentConfig,
    /// 定时清理配置
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite 文件路径
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// 连接池大小
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// 写锁等待时间（毫秒）
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/offline-dl.db")
}

fn default_pool_size() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 离线下载临时目录（提交任务未指定 target_dir 时使用）
    ///
    /// 注意不要放在磁盘的 `temp/` 下，否则长时间暂停的任务会被临时目录清理任务回收
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// 数据盘根目录（数据库中没有任何磁盘记录时使用）
    #[serde(default = "default_data_path")]
    pub default_data_path: PathBuf,
    /// 加密主密钥（64 位十六进制），未配置时每次启动随机生成
    #[serde(default)]
    pub encryption_key_hex: Option<String>,
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("data/offline")
}

fn default_data_path() -> PathBuf {
    PathBuf::from("data/disk0")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            default_data_path: default_data_path(),
            encryption_key_hex: None,
        }
    }
}

/// HTTP 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 单个分片最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 分片大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 单任务最大并发分片数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 单次 HTTP 请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 重试退避基数（毫秒）
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// 重试退避上限（毫秒）
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
    /// 进度写库最小间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 每完成多少个分片刷写一次断点文件
    #[serde(default = "default_sidecar_flush_chunks")]
    pub sidecar_flush_chunks: usize,
    /// 断点文件最长刷写间隔（秒）
    #[serde(default = "default_sidecar_flush_secs")]
    pub sidecar_flush_secs: u64,
    /// 关闭时等待工作线程保存断点的时间（秒）
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_chunk_size() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_max_concurrent() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_retry_cap_ms() -> u64 {
    30_000
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_sidecar_flush_chunks() -> usize {
    8
}

fn default_sidecar_flush_secs() -> u64 {
    5
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            chunk_size: default_chunk_size(),
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_timeout_secs(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            sidecar_flush_chunks: default_sidecar_flush_chunks(),
            sidecar_flush_secs: default_sidecar_flush_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// BT 下载配置（0 表示不限制）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentConfig {
    #[serde(default = "default_max_peers")]
    pub max_concurrent_peers: usize,
    #[serde(default)]
    pub download_rate_mbps: u32,
    #[serde(default)]
    pub upload_rate_mbps: u32,
}

fn default_max_peers() -> usize {
    50
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_peers: default_max_peers(),
            download_rate_mbps: 0,
            upload_rate_mbps: 0,
        }
    }
}

/// 定时清理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// 回收站保留天数
    #[serde(default = "default_recycle_retention_days")]
    pub recycle_retention_days: u64,
    /// 回收站清理间隔（秒）
    #[serde(default = "default_hourly")]
    pub recycle_interval_secs: u64,
    /// 上传会话有效期（小时）
    #[serde(default = "default_upload_ttl_hours")]
    pub upload_ttl_hours: u64,
    /// 上传会话清理间隔（秒）
    #[serde(default = "default_hourly")]
    pub upload_interval_secs: u64,
    /// 临时目录最大存活时间（秒）
    #[serde(default = "default_temp_max_age_secs")]
    pub temp_max_age_secs: u64,
    /// 临时目录清理间隔（秒）
    #[serde(default = "default_hourly")]
    pub temp_interval_secs: u64,
    /// 临时目录首次清理延迟（秒），避免与进行中的上传竞争
    #[serde(default = "default_temp_initial_delay_secs")]
    pub temp_initial_delay_secs: u64,
}

fn default_recycle_retention_days() -> u64 {
    30
}

fn default_hourly() -> u64 {
    3600
}

fn default_upload_ttl_hours() -> u64 {
    24
}

fn default_temp_max_age_secs() -> u64 {
    24 * 3600
}

fn default_temp_initial_delay_secs() -> u64 {
    300
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            recycle_retention_days: default_recycle_retention_days(),
            recycle_interval_secs: default_hourly(),
            upload_ttl_hours: default_upload_ttl_hours(),
            upload_interval_secs: default_hourly(),
            temp_max_age_secs: default_temp_max_age_secs(),
            temp_interval_secs: default_hourly(),
            temp_initial_delay_secs: default_temp_initial_delay_secs(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }
                default_config
            }
        }
    }

    /// 校验数值范围
    pub fn validate(&self) -> Result<()> {
        if self.download.chunk_size == 0 {
            anyhow::bail!("download.chunk_size 必须大于 0");
        }
        if self.download.max_concurrent == 0 {
            anyhow::bail!("download.max_concurrent 必须大于 0");
        }
        if self.database.pool_size == 0 {
            anyhow::bail!("database.pool_size 必须大于 0");
        }
        if let Some(ref key) = self.storage.encryption_key_hex {
            let bytes = hex::decode(key).context("storage.encryption_key_hex 不是合法的十六进制")?;
            if bytes.len() != 32 {
                anyhow::bail!("storage.encryption_key_hex 必须是 32 字节（64 个十六进制字符）");
            }
        }
        Ok(())
    }
}
