//! 用户配额、上传会话与磁盘表

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::types::{Disk, UploadTask, User};
use crate::error::{DownloadError, Result};

pub struct UserRepo<'c> {
    conn: &'c Connection,
}

impl<'c> UserRepo<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, user: &User) -> Result<()> {
        self.conn.execute(
            "INSERT INTO users (id, name, space, free_space) VALUES (?1, ?2, ?3, ?4)",
            params![user.id, user.name, user.space, user.free_space],
        )?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<User>> {
        let user = self
            .conn
            .query_row(
                "SELECT id, name, space, free_space FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        space: row.get(2)?,
                        free_space: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    pub fn require(&self, id: i64) -> Result<User> {
        self.get(id)?
            .ok_or_else(|| DownloadError::NotFound(format!("用户 {}", id)))
    }

    /// 调整剩余空间（正数归还，负数扣减）
    ///
    /// 不限空间的用户（`space <= 0`）不做任何修改，返回 false
    pub fn adjust_free_space(&self, id: i64, delta: i64) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE users SET free_space = free_space + ?1 WHERE id = ?2 AND space > 0",
            params![delta, id],
        )?;
        Ok(affected == 1)
    }
}

pub struct UploadRepo<'c> {
    conn: &'c Connection,
}

impl<'c> UploadRepo<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, task: &UploadTask) -> Result<()> {
        self.conn.execute(
            "INSERT INTO upload_task (id, user_id, file_name, total_size, uploaded_size, temp_dir, create_time, update_time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task.id,
                task.user_id,
                task.file_name,
                task.total_size,
                task.uploaded_size,
                task.temp_dir,
                task.create_time,
                task.update_time,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<UploadTask>> {
        let task = self
            .conn
            .query_row(
                "SELECT id, user_id, file_name, total_size, uploaded_size, temp_dir, create_time, update_time \
                 FROM upload_task WHERE id = ?1",
                params![id],
                row_to_upload,
            )
            .optional()?;
        Ok(task)
    }

    /// 最后活动时间早于 `cutoff` 的会话
    pub fn list_expired(&self, cutoff: i64) -> Result<Vec<UploadTask>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, file_name, total_size, uploaded_size, temp_dir, create_time, update_time \
             FROM upload_task WHERE update_time < ?1 ORDER BY update_time, id",
        )?;
        let rows = stmt.query_map(params![cutoff], row_to_upload)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM upload_task WHERE id = ?1", params![id])?;
        Ok(affected == 1)
    }
}

fn row_to_upload(row: &Row<'_>) -> rusqlite::Result<UploadTask> {
    Ok(UploadTask {
        id: row.get(0)?,
        user_id: row.get(1)?,
        file_name: row.get(2)?,
        total_size: row.get(3)?,
        uploaded_size: row.get(4)?,
        temp_dir: row.get(5)?,
        create_time: row.get(6)?,
        update_time: row.get(7)?,
    })
}

pub struct DiskRepo<'c> {
    conn: &'c Connection,
}

impl<'c> DiskRepo<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, disk: &Disk) -> Result<()> {
        self.conn.execute(
            "INSERT INTO disk (id, data_path, create_time) VALUES (?1, ?2, ?3)",
            params![disk.id, disk.data_path, disk.create_time],
        )?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Disk>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, data_path, create_time FROM disk ORDER BY create_time, id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Disk {
                id: row.get(0)?,
                data_path: row.get(1)?,
                create_time: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::db::test_support::temp_db;

    #[test]
    fn test_adjust_free_space_skips_unlimited() {
        let (_dir, db) = temp_db();
        db.with_tx(|r| {
            r.users().insert(&User {
                id: 1,
                name: "limited".to_string(),
                space: 1000,
                free_space: 1000,
            })?;
            r.users().insert(&User {
                id: 2,
                name: "unlimited".to_string(),
                space: 0,
                free_space: 0,
            })
        })
        .unwrap();

        assert!(db.with_repos(|r| r.users().adjust_free_space(1, -300)).unwrap());
        assert!(!db.with_repos(|r| r.users().adjust_free_space(2, -300)).unwrap());

        assert_eq!(db.with_repos(|r| r.users().require(1)).unwrap().free_space, 700);
        assert_eq!(db.with_repos(|r| r.users().require(2)).unwrap().free_space, 0);
        assert!(db.with_repos(|r| r.users().require(3)).is_err());
    }

    #[test]
    fn test_upload_expiry() {
        let (_dir, db) = temp_db();
        for (id, t) in [("u1", 10), ("u2", 50)] {
            let task = UploadTask {
                id: id.to_string(),
                user_id: 1,
                file_name: "a".to_string(),
                total_size: 10,
                uploaded_size: 0,
                temp_dir: None,
                create_time: t,
                update_time: t,
            };
            db.with_repos(|r| r.uploads().insert(&task)).unwrap();
        }
        let expired = db.with_repos(|r| r.uploads().list_expired(20)).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "u1");
    }

    #[test]
    fn test_disks() {
        let (_dir, db) = temp_db();
        let disk = Disk {
            id: "d0".to_string(),
            data_path: "/srv/disk0".to_string(),
            create_time: 1,
        };
        db.with_repos(|r| r.disks().insert(&disk)).unwrap();
        assert_eq!(db.with_repos(|r| r.disks().list()).unwrap(), vec![disk]);
    }
}
