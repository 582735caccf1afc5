//! SQLite 连接池与事务边界
//!
//! 所有跨表修改都通过 [`Database::with_tx`] 在同一个事务中完成：
//! - 回收站清理：删除回收记录 + 删除文件 + 归还配额
//! - 入库：写入文件记录 + 关联用户 + 扣减配额

use std::path::Path;
use std::time::Duration;

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info};

use super::account_repo::{DiskRepo, UploadRepo, UserRepo};
use super::file_repo::{FileChunkRepo, FileRepo, RecycleRepo, UserFileRepo};
use super::task_repo::TaskRepo;
use crate::config::DatabaseConfig;
use crate::error::{DownloadError, Result};

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS download_task (
    id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    url TEXT NOT NULL,
    virtual_path TEXT NOT NULL,
    target_dir TEXT NOT NULL,
    file_name TEXT NOT NULL DEFAULT '',
    file_size INTEGER NOT NULL DEFAULT -1,
    downloaded_size INTEGER NOT NULL DEFAULT 0,
    progress INTEGER NOT NULL DEFAULT 0,
    speed INTEGER NOT NULL DEFAULT 0,
    state INTEGER NOT NULL,
    file_id TEXT,
    error_msg TEXT,
    options TEXT NOT NULL,
    create_time INTEGER NOT NULL,
    update_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_download_task_user_state ON download_task(user_id, state);

CREATE TABLE IF NOT EXISTS file_info (
    id TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    path TEXT NOT NULL,
    enc_path TEXT,
    hash TEXT NOT NULL DEFAULT '',
    thumbnail_img TEXT,
    is_chunk INTEGER NOT NULL DEFAULT 0,
    is_enc INTEGER NOT NULL DEFAULT 0,
    disk_id TEXT,
    create_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS user_files (
    id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    file_id TEXT NOT NULL,
    virtual_path TEXT NOT NULL,
    file_name TEXT NOT NULL,
    create_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_user_files_file ON user_files(file_id);
CREATE INDEX IF NOT EXISTS idx_user_files_user ON user_files(user_id);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    space INTEGER NOT NULL DEFAULT 0,
    free_space INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS recycled (
    id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    file_id TEXT NOT NULL,
    user_file_id TEXT NOT NULL,
    create_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_recycled_create_time ON recycled(create_time);

CREATE TABLE IF NOT EXISTS upload_task (
    id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    file_name TEXT NOT NULL,
    total_size INTEGER NOT NULL DEFAULT 0,
    uploaded_size INTEGER NOT NULL DEFAULT 0,
    temp_dir TEXT,
    create_time INTEGER NOT NULL,
    update_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_upload_task_update_time ON upload_task(update_time);

CREATE TABLE IF NOT EXISTS disk (
    id TEXT PRIMARY KEY,
    data_path TEXT NOT NULL,
    create_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS file_chunk (
    id TEXT PRIMARY KEY,
    file_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    path TEXT NOT NULL,
    size INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_file_chunk_file ON file_chunk(file_id);
"#;

/// 数据库句柄（可廉价克隆，内部是连接池）
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// 按配置打开数据库
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        Self::open_path(
            &config.path,
            config.pool_size,
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    /// 打开（必要时创建）数据库文件并初始化表结构
    pub fn open_path(path: &Path, pool_size: u32, busy_timeout: Duration) -> Result<Self> {
        // 确保父目录存在
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
        });

        let pool = r2d2::Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)?;

        let db = Self { pool };
        db.init_tables()?;

        info!("数据库已打开: {:?} (pool_size={})", path, pool_size);
        Ok(db)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        debug!("数据库表结构初始化完成");
        Ok(())
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// 在一个事务中执行 `f`：返回 Ok 时提交，返回 Err 时回滚
    ///
    /// 使用 IMMEDIATE 事务，开始时即取得写锁，避免读后写升级时的死锁
    pub fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Repos<'_>) -> Result<T>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let outcome = {
            let repos = Repos { conn: &*tx };
            f(&repos)
        };

        match outcome {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::error!("事务回滚失败: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    /// 自动提交模式下执行单条读写
    pub fn with_repos<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Repos<'_>) -> Result<T>,
    {
        let conn = self.conn()?;
        let repos = Repos { conn: &*conn };
        f(&repos)
    }
}

/// 绑定到同一个连接（或事务）上的仓储集合
///
/// 在 [`Database::with_tx`] 内拿到的 `Repos` 中的所有操作属于同一个事务；
/// 嵌套调用直接复用同一个 `Repos`
pub struct Repos<'c> {
    conn: &'c Connection,
}

impl<'c> Repos<'c> {
    /// 在当前事务内执行嵌套的工作单元
    pub fn nested<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Repos<'c>) -> Result<T>,
    {
        f(self)
    }

    pub fn tasks(&self) -> TaskRepo<'c> {
        TaskRepo::new(self.conn)
    }

    pub fn files(&self) -> FileRepo<'c> {
        FileRepo::new(self.conn)
    }

    pub fn user_files(&self) -> UserFileRepo<'c> {
        UserFileRepo::new(self.conn)
    }

    pub fn chunks(&self) -> FileChunkRepo<'c> {
        FileChunkRepo::new(self.conn)
    }

    pub fn recycled(&self) -> RecycleRepo<'c> {
        RecycleRepo::new(self.conn)
    }

    pub fn users(&self) -> UserRepo<'c> {
        UserRepo::new(self.conn)
    }

    pub fn uploads(&self) -> UploadRepo<'c> {
        UploadRepo::new(self.conn)
    }

    pub fn disks(&self) -> DiskRepo<'c> {
        DiskRepo::new(self.conn)
    }
}

/// 将 0 行受影响的更新转换为 NotFound
pub(crate) fn expect_one(affected: usize, what: &str) -> Result<()> {
    if affected == 0 {
        Err(DownloadError::NotFound(what.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// 临时目录中的测试数据库（TempDir 需要与 Database 同生命周期）
    pub fn temp_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_path(&dir.path().join("test.db"), 4, Duration::from_secs(5))
            .unwrap();
        (dir, db)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::temp_db;
    use super::*;
    use crate::persistence::types::User;

    fn user(id: i64, space: i64) -> User {
        User {
            id,
            name: format!("user{}", id),
            space,
            free_space: space,
        }
    }

    #[test]
    fn test_open_creates_schema() {
        let (_dir, db) = temp_db();
        let n: i64 = db
            .with_repos(|r| {
                Ok(r.conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert!(n >= 8);
    }

    #[test]
    fn test_with_tx_commits() {
        let (_dir, db) = temp_db();
        db.with_tx(|r| r.users().insert(&user(1, 100))).unwrap();
        let u = db.with_repos(|r| r.users().get(1)).unwrap();
        assert_eq!(u.map(|u| u.free_space), Some(100));
    }

    #[test]
    fn test_with_tx_rolls_back_on_error() {
        let (_dir, db) = temp_db();
        let res: Result<()> = db.with_tx(|r| {
            r.users().insert(&user(1, 100))?;
            Err(DownloadError::storage("boom"))
        });
        assert!(res.is_err());
        let u = db.with_repos(|r| r.users().get(1)).unwrap();
        assert!(u.is_none());
    }

    #[test]
    fn test_nested_shares_transaction() {
        let (_dir, db) = temp_db();
        let res: Result<()> = db.with_tx(|r| {
            r.users().insert(&user(1, 100))?;
            r.nested(|inner| inner.users().insert(&user(2, 100)))?;
            Err(DownloadError::storage("boom"))
        });
        assert!(res.is_err());
        // 嵌套部分随外层一起回滚
        assert!(db.with_repos(|r| r.users().get(2)).unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.db");
        {
            let db = Database::open_path(&path, 2, Duration::from_secs(1)).unwrap();
            db.with_tx(|r| r.users().insert(&user(3, 0))).unwrap();
        }
        let db = Database::open_path(&path, 2, Duration::from_secs(1)).unwrap();
        assert!(db.with_repos(|r| r.users().get(3)).unwrap().is_some());
    }
}
