//! 文件、用户文件关联、文件块与回收站表

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::types::{FileChunk, FileInfo, Recycled, UserFile};
use crate::error::Result;

pub struct FileRepo<'c> {
    conn: &'c Connection,
}

impl<'c> FileRepo<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, file: &FileInfo) -> Result<()> {
        self.conn.execute(
            "INSERT INTO file_info (id, size, path, enc_path, hash, thumbnail_img, is_chunk, is_enc, disk_id, create_time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                file.id,
                file.size,
                file.path,
                file.enc_path,
                file.hash,
                file.thumbnail_img,
                file.is_chunk,
                file.is_enc,
                file.disk_id,
                file.create_time,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<FileInfo>> {
        let file = self
            .conn
            .query_row(
                "SELECT id, size, path, enc_path, hash, thumbnail_img, is_chunk, is_enc, disk_id, create_time \
                 FROM file_info WHERE id = ?1",
                params![id],
                row_to_file,
            )
            .optional()?;
        Ok(file)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM file_info WHERE id = ?1", params![id])?;
        Ok(affected == 1)
    }
}

fn row_to_file(row: &Row<'_>) -> rusqlite::Result<FileInfo> {
    Ok(FileInfo {
        id: row.get(0)?,
        size: row.get(1)?,
        path: row.get(2)?,
        enc_path: row.get(3)?,
        hash: row.get(4)?,
        thumbnail_img: row.get(5)?,
        is_chunk: row.get(6)?,
        is_enc: row.get(7)?,
        disk_id: row.get(8)?,
        create_time: row.get(9)?,
    })
}

pub struct UserFileRepo<'c> {
    conn: &'c Connection,
}

impl<'c> UserFileRepo<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, link: &UserFile) -> Result<()> {
        self.conn.execute(
            "INSERT INTO user_files (id, user_id, file_id, virtual_path, file_name, create_time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                link.id,
                link.user_id,
                link.file_id,
                link.virtual_path,
                link.file_name,
                link.create_time,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<UserFile>> {
        let link = self
            .conn
            .query_row(
                "SELECT id, user_id, file_id, virtual_path, file_name, create_time \
                 FROM user_files WHERE id = ?1",
                params![id],
                row_to_user_file,
            )
            .optional()?;
        Ok(link)
    }

    pub fn list_by_user(&self, user_id: i64, offset: i64, limit: i64) -> Result<Vec<UserFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, file_id, virtual_path, file_name, create_time \
             FROM user_files WHERE user_id = ?1 ORDER BY create_time, id LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![user_id, limit, offset], row_to_user_file)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// 文件引用计数
    pub fn count_by_file(&self, file_id: &str) -> Result<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM user_files WHERE file_id = ?1",
            params![file_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM user_files WHERE id = ?1", params![id])?;
        Ok(affected == 1)
    }
}

fn row_to_user_file(row: &Row<'_>) -> rusqlite::Result<UserFile> {
    Ok(UserFile {
        id: row.get(0)?,
        user_id: row.get(1)?,
        file_id: row.get(2)?,
        virtual_path: row.get(3)?,
        file_name: row.get(4)?,
        create_time: row.get(5)?,
    })
}

pub struct FileChunkRepo<'c> {
    conn: &'c Connection,
}

impl<'c> FileChunkRepo<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, chunk: &FileChunk) -> Result<()> {
        self.conn.execute(
            "INSERT INTO file_chunk (id, file_id, chunk_index, path, size) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                chunk.id,
                chunk.file_id,
                chunk.chunk_index,
                chunk.path,
                chunk.size
            ],
        )?;
        Ok(())
    }

    pub fn list_by_file(&self, file_id: &str) -> Result<Vec<FileChunk>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, file_id, chunk_index, path, size FROM file_chunk \
             WHERE file_id = ?1 ORDER BY chunk_index",
        )?;
        let rows = stmt.query_map(params![file_id], |row| {
            Ok(FileChunk {
                id: row.get(0)?,
                file_id: row.get(1)?,
                chunk_index: row.get(2)?,
                path: row.get(3)?,
                size: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete_by_file(&self, file_id: &str) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM file_chunk WHERE file_id = ?1", params![file_id])?)
    }
}

pub struct RecycleRepo<'c> {
    conn: &'c Connection,
}

impl<'c> RecycleRepo<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, row: &Recycled) -> Result<()> {
        self.conn.execute(
            "INSERT INTO recycled (id, user_id, file_id, user_file_id, create_time) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![row.id, row.user_id, row.file_id, row.user_file_id, row.create_time],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Recycled>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, user_id, file_id, user_file_id, create_time FROM recycled WHERE id = ?1",
                params![id],
                row_to_recycled,
            )
            .optional()?;
        Ok(row)
    }

    /// 创建时间早于 `cutoff` 的记录
    pub fn list_expired(&self, cutoff: i64, limit: i64) -> Result<Vec<Recycled>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, file_id, user_file_id, create_time FROM recycled \
             WHERE create_time < ?1 ORDER BY create_time, id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cutoff, limit], row_to_recycled)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_by_user(&self, user_id: i64) -> Result<Vec<Recycled>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, file_id, user_file_id, create_time FROM recycled \
             WHERE user_id = ?1 ORDER BY create_time, id",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_recycled)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM recycled WHERE id = ?1", params![id])?;
        Ok(affected == 1)
    }
}

fn row_to_recycled(row: &Row<'_>) -> rusqlite::Result<Recycled> {
    Ok(Recycled {
        id: row.get(0)?,
        user_id: row.get(1)?,
        file_id: row.get(2)?,
        user_file_id: row.get(3)?,
        create_time: row.get(4)?,
    })
}
