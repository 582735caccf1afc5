//! 离线下载任务表
//!
//! 状态写入都是条件更新（`WHERE state IN (...)`），来源状态由状态机给出，
//! 不合法的迁移在数据库层面就不会生效

use std::path::PathBuf;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::downloader::task::{DownloadTask, TaskKind, TaskOptions, TaskState};
use crate::error::{DownloadError, Result};

const COLUMNS: &str = "id, user_id, kind, url, virtual_path, target_dir, file_name, file_size, \
     downloaded_size, progress, speed, state, file_id, error_msg, options, create_time, update_time";

pub struct TaskRepo<'c> {
    conn: &'c Connection,
}

impl<'c> TaskRepo<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, task: &DownloadTask) -> Result<()> {
        let options = serde_json::to_string(&task.options)?;
        self.conn.execute(
            &format!(
                "INSERT INTO download_task ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                COLUMNS
            ),
            params![
                task.id,
                task.user_id,
                task.kind.as_str(),
                task.url,
                task.virtual_path,
                task.target_dir.to_string_lossy(),
                task.file_name,
                task.file_size,
                task.downloaded_size,
                task.progress,
                task.speed,
                task.state.as_i64(),
                task.file_id,
                task.error_msg,
                options,
                task.create_time,
                task.update_time,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<DownloadTask>> {
        let task = self
            .conn
            .query_row(
                &format!("SELECT {} FROM download_task WHERE id = ?1", COLUMNS),
                params![id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    /// 读取任务，不存在时返回 NotFound
    pub fn require(&self, id: &str) -> Result<DownloadTask> {
        self.get(id)?
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))
    }

    /// 分页列出用户任务（新任务在前）
    pub fn list_by_user(&self, user_id: i64, offset: i64, limit: i64) -> Result<Vec<DownloadTask>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM download_task WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id, limit, offset], row_to_task)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// 分页列出用户某个状态的任务（新任务在前）
    pub fn list_by_user_state(
        &self,
        user_id: i64,
        state: TaskState,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<DownloadTask>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM download_task WHERE user_id = ?1 AND state = ?2 \
             ORDER BY id DESC LIMIT ?3 OFFSET ?4",
            COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![user_id, state.as_i64(), limit, offset],
            row_to_task,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// 所有用户处于某个状态的任务（启动恢复用，按创建顺序）
    pub fn list_by_state(&self, state: TaskState) -> Result<Vec<DownloadTask>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM download_task WHERE state = ?1 ORDER BY id ASC",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![state.as_i64()], row_to_task)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count(&self, user_id: i64, state: Option<TaskState>) -> Result<i64> {
        let n = match state {
            Some(s) => self.conn.query_row(
                "SELECT COUNT(*) FROM download_task WHERE user_id = ?1 AND state = ?2",
                params![user_id, s.as_i64()],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM download_task WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )?,
        };
        Ok(n)
    }

    /// 按状态机迁移任务状态
    ///
    /// 只有当前状态能迁移到 `to` 时才会更新；否则返回 Conflict（任务不存在返回 NotFound）
    pub fn transition(&self, id: &str, to: TaskState) -> Result<()> {
        self.transition_with(id, to, "", &[])
    }

    /// 迁移到 PAUSED，同时清零速度
    pub fn mark_paused(&self, id: &str) -> Result<()> {
        self.transition_with(id, TaskState::Paused, ", speed = 0", &[])
    }

    /// 迁移到 DOWNLOADING，清除上一次的错误
    pub fn mark_downloading(&self, id: &str) -> Result<()> {
        self.transition_with(id, TaskState::Downloading, ", error_msg = NULL", &[])
    }

    /// 迁移到 FINISHED，写入文件ID，进度置 100
    pub fn mark_finished(&self, id: &str, file_id: &str, file_size: i64) -> Result<()> {
        self.transition_with(
            id,
            TaskState::Finished,
            ", file_id = ?, file_size = ?, downloaded_size = ?, progress = 100, speed = 0, error_msg = NULL",
            &[
                rusqlite::types::Value::Text(file_id.to_string()),
                rusqlite::types::Value::Integer(file_size),
                rusqlite::types::Value::Integer(file_size),
            ],
        )
    }

    /// 迁移到 FAILED，写入错误信息
    pub fn mark_failed(&self, id: &str, error_msg: &str) -> Result<()> {
        self.transition_with(
            id,
            TaskState::Failed,
            ", error_msg = ?, speed = 0",
            &[rusqlite::types::Value::Text(error_msg.to_string())],
        )
    }

    fn transition_with(
        &self,
        id: &str,
        to: TaskState,
        extra_set: &str,
        extra_values: &[rusqlite::types::Value],
    ) -> Result<()> {
        let sources = TaskState::sources_of(to);
        let placeholders = vec!["?"; sources.len()].join(", ");
        let sql = format!(
            "UPDATE download_task SET state = ?, update_time = ?{} WHERE id = ? AND state IN ({})",
            extra_set, placeholders
        );

        let mut values: Vec<rusqlite::types::Value> = vec![
            rusqlite::types::Value::Integer(to.as_i64()),
            rusqlite::types::Value::Integer(now()),
        ];
        values.extend(extra_values.iter().cloned());
        values.push(rusqlite::types::Value::Text(id.to_string()));
        values.extend(
            sources
                .iter()
                .map(|s| rusqlite::types::Value::Integer(s.as_i64())),
        );

        let affected = self.conn.execute(&sql, params_from_iter(values))?;
        if affected == 1 {
            return Ok(());
        }

        match self.get(id)? {
            None => Err(DownloadError::NotFound(id.to_string())),
            Some(current) => Err(DownloadError::conflict(format!(
                "任务 {} 当前状态 {:?}，不能变为 {:?}",
                id, current.state, to
            ))),
        }
    }

    /// 写入探测结果（仅 DOWNLOADING 状态）
    pub fn update_remote_meta(&self, id: &str, file_name: &str, file_size: i64) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE download_task SET file_name = ?1, file_size = ?2, update_time = ?3 \
             WHERE id = ?4 AND state = ?5",
            params![
                file_name,
                file_size,
                now(),
                id,
                TaskState::Downloading.as_i64()
            ],
        )?;
        Ok(affected == 1)
    }

    /// 写入进度（仅 DOWNLOADING 状态，暂停/取消之后的迟到写入会被忽略）
    pub fn update_progress(
        &self,
        id: &str,
        downloaded_size: i64,
        speed: i64,
        progress: i32,
    ) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE download_task SET downloaded_size = ?1, speed = ?2, progress = ?3, update_time = ?4 \
             WHERE id = ?5 AND state = ?6",
            params![
                downloaded_size,
                speed,
                progress,
                now(),
                id,
                TaskState::Downloading.as_i64()
            ],
        )?;
        Ok(affected == 1)
    }

    /// 恢复任务时更换临时目录（仅 PAUSED 状态）
    pub fn update_target_dir(&self, id: &str, target_dir: &std::path::Path) -> Result<()> {
        let affected = self.conn.execute(
            "UPDATE download_task SET target_dir = ?1, update_time = ?2 WHERE id = ?3 AND state = ?4",
            params![
                target_dir.to_string_lossy(),
                now(),
                id,
                TaskState::Paused.as_i64()
            ],
        )?;
        super::db::expect_one(affected, id)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM download_task WHERE id = ?1", params![id])?;
        Ok(affected == 1)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<DownloadTask> {
    let kind: String = row.get(2)?;
    let target_dir: String = row.get(5)?;
    let state: i64 = row.get(11)?;
    let options: String = row.get(14)?;

    let kind = TaskKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("未知任务类型: {}", kind).into(),
        )
    })?;
    let state = TaskState::from_i64(state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            11,
            rusqlite::types::Type::Integer,
            format!("未知任务状态: {}", state).into(),
        )
    })?;
    let options: TaskOptions = serde_json::from_str(&options).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(14, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(DownloadTask {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind,
        url: row.get(3)?,
        virtual_path: row.get(4)?,
        target_dir: PathBuf::from(target_dir),
        file_name: row.get(6)?,
        file_size: row.get(7)?,
        downloaded_size: row.get(8)?,
        progress: row.get(9)?,
        speed: row.get(10)?,
        state,
        file_id: row.get(12)?,
        error_msg: row.get(13)?,
        options,
        create_time: row.get(15)?,
        update_time: row.get(16)?,
    })
}
