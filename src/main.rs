use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use offline_dl::{
    config::{AppConfig, StorageConfig},
    downloader::{torrent::UnsupportedTorrentClient, Ingestor},
    logging,
    persistence::Disk,
    staging::{KeyProvider, Promoter, StaticKeyProvider},
    Database, DownloadManager, Janitors,
};
use tracing::{info, warn};

const CONFIG_PATH: &str = "config/app.toml";

/// 选择数据盘：数据库中已有磁盘时使用第一个，否则按配置登记一个
fn ensure_disk(db: &Database, storage: &StorageConfig) -> anyhow::Result<Disk> {
    let disks = db.with_repos(|r| r.disks().list())?;
    if let Some(disk) = disks.into_iter().next() {
        return Ok(disk);
    }

    let disk = Disk {
        id: uuid::Uuid::new_v4().to_string(),
        data_path: storage.default_data_path.to_string_lossy().into_owned(),
        create_time: chrono::Utc::now().timestamp(),
    };
    std::fs::create_dir_all(disk.data_dir()).context("创建数据目录失败")?;
    std::fs::create_dir_all(disk.temp_dir()).context("创建临时目录失败")?;
    db.with_repos(|r| r.disks().insert(&disk))?;
    info!("已登记数据盘: id={}, path={}", disk.id, disk.data_path);
    Ok(disk)
}

fn key_provider(storage: &StorageConfig) -> anyhow::Result<Arc<dyn KeyProvider>> {
    match storage.encryption_key_hex.as_deref() {
        Some(hex_key) => Ok(Arc::new(
            StaticKeyProvider::from_hex(hex_key).context("加载加密密钥失败")?,
        )),
        None => {
            warn!("⚠️  未配置 storage.encryption_key_hex，使用随机密钥，重启后加密文件将无法解密");
            Ok(Arc::new(StaticKeyProvider::random()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(CONFIG_PATH).await;

    // 🔥 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    info!("Offline Download Engine v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let db = Database::open(&config.database).context("打开数据库失败")?;
    let disk = ensure_disk(&db, &config.storage)?;

    let promoter = Arc::new(Promoter::new(
        PathBuf::from(&disk.data_path),
        Some(disk.id.clone()),
        key_provider(&config.storage)?,
    ));
    let ingestor = Ingestor::new(db.clone(), promoter);

    tokio::fs::create_dir_all(&config.storage.scratch_dir)
        .await
        .with_context(|| format!("创建下载临时目录失败: {:?}", config.storage.scratch_dir))?;

    let manager = DownloadManager::new(
        db.clone(),
        ingestor,
        Arc::new(UnsupportedTorrentClient),
        &config,
    )?;

    manager.recover()?;

    let janitors = Janitors::start(db, &config.cleanup);

    info!("✓ 离线下载引擎已启动，按 Ctrl+C 退出");
    tokio::signal::ctrl_c()
        .await
        .context("监听 Ctrl+C 失败")?;
    info!("收到 Ctrl+C，开始优雅关闭...");

    manager
        .shutdown(Duration::from_secs(config.download.shutdown_grace_secs))
        .await;
    janitors.shutdown().await;

    info!("应用已安全退出");
    Ok(())
}
