//! 日志系统
//!
//! 控制台 + 文件两路输出。文件名为 `offline-dl.<启动时间>[_N].log`，
//! 单个文件超过上限后滚动到下一个序号，启动时删除超过保留天数的旧文件

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LogConfig;

const LOG_PREFIX: &str = "offline-dl.";
const LOG_SUFFIX: &str = ".log";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

struct RollingState {
    log_dir: PathBuf,
    /// 启动时间（YYYY-MM-DD-HHMMSS）
    started: String,
    index: u32,
    max_file_size: u64,
    written: u64,
    file: Option<File>,
}

impl RollingState {
    fn path_for(&self, index: u32) -> PathBuf {
        let name = if index == 0 {
            format!("{}{}{}", LOG_PREFIX, self.started, LOG_SUFFIX)
        } else {
            format!("{}{}_{}{}", LOG_PREFIX, self.started, index, LOG_SUFFIX)
        };
        self.log_dir.join(name)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let path = self.path_for(self.index);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.written = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.file = Some(file);
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            if let Some(mut old) = self.file.take() {
                old.flush()?;
            }
            self.index += 1;
            self.open_current()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件未打开"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 按大小滚动的日志文件
#[derive(Clone)]
pub struct RollingFile {
    state: Arc<Mutex<RollingState>>,
}

impl RollingFile {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let mut state = RollingState {
            log_dir,
            started: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            index: 0,
            max_file_size: max_file_size.max(1),
            written: 0,
            file: None,
        };
        state.open_current()?;
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// 当前写入的文件
    pub fn current_path(&self) -> PathBuf {
        let state = self.state.lock();
        state.path_for(state.index)
    }
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.state.lock().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 日志守卫，必须保持存活直到进程退出，否则文件写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统（`RUST_LOG` 优先于配置中的级别）
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let console = || {
        fmt::layer()
            .with_target(true)
            .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
            .with_ansi(true)
    };

    let file = if config.enabled {
        fs::create_dir_all(&config.log_dir)
            .and_then(|_| RollingFile::new(config.log_dir.clone(), config.max_file_size))
            .map_err(|e| eprintln!("创建日志文件失败 {:?}: {}，仅输出到控制台", config.log_dir, e))
            .ok()
    } else {
        None
    };

    let Some(file) = file else {
        if let Err(e) = tracing_subscriber::registry()
            .with(filter())
            .with(console())
            .try_init()
        {
            eprintln!("日志系统已初始化: {}", e);
        }
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    };

    let (writer, guard) = tracing_appender::non_blocking(file);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(writer);

    if let Err(e) = tracing_subscriber::registry()
        .with(filter())
        .with(console())
        .with(file_layer)
        .try_init()
    {
        eprintln!("日志系统已初始化: {}", e);
    }

    info!(
        "日志系统初始化完成: 目录={:?}, 保留 {} 天, 级别={}, 单文件最大 {:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );
    let removed = cleanup_old_logs(&config.log_dir, config.retention_days);
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(guard),
    }
}

/// 删除超过保留天数的日志文件，返回删除数量
///
/// 日期取自文件名中的启动时间，无法解析时使用修改时间
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败 {:?}: {}", log_dir, e);
            return 0;
        }
    };

    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !path.is_file() || !name.starts_with(LOG_PREFIX) || !name.ends_with(LOG_SUFFIX) {
            continue;
        }

        let expired = match date_of(name) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|t| {
                    let t: chrono::DateTime<chrono::Utc> = t.into();
                    chrono::Utc::now().signed_duration_since(t) > retention
                })
                .unwrap_or(false),
        };

        if expired {
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    debug!("已删除过期日志: {:?}", path);
                }
                Err(e) => warn!("删除过期日志失败 {:?}: {}", path, e),
            }
        }
    }
    removed
}

/// `offline-dl.2024-05-01-120000_3.log` -> 2024-05-01
fn date_of(file_name: &str) -> Option<chrono::NaiveDate> {
    let stem = file_name.strip_prefix(LOG_PREFIX)?.strip_suffix(LOG_SUFFIX)?;
    let date = stem.get(..10)?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}
