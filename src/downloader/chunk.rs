use std::ops::Range;

use tracing::info;

use crate::staging::ChunkRecord;

/// 下载方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// 多分片并发 Range 请求
    Parallel,
    /// 单连接顺序读取（服务器不支持 Range、大小未知或文件较小）
    Stream,
}

/// 选择下载方式：支持 Range 且文件不小于两个分片时并发下载
pub fn choose_plan(file_size: i64, accept_ranges: bool, chunk_size: u64) -> PlanMode {
    if accept_ranges && file_size > 0 && (file_size as u64) >= chunk_size.saturating_mul(2) {
        PlanMode::Parallel
    } else {
        PlanMode::Stream
    }
}

/// 计算分片：`N = ceil(size / chunk_size)`，第 i 片为 `[i*chunk_size, min(size, (i+1)*chunk_size))`
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Vec<ChunkRecord> {
    let mut chunks = Vec::new();
    if chunk_size == 0 {
        return chunks;
    }
    let mut offset = 0u64;
    while offset < total_size {
        let end = std::cmp::min(offset.saturating_add(chunk_size), total_size);
        chunks.push(ChunkRecord::new(offset, end));
        offset = end;
    }
    chunks
}

/// 分片信息
#[derive(Debug, Clone)]
pub struct Chunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 是否已完成
    pub completed: bool,
    /// 是否正在下载（防止重复调度）
    pub downloading: bool,
    /// 已写入的前缀长度
    pub written: u64,
}

impl Chunk {
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 下一次请求的起始偏移
    pub fn resume_offset(&self) -> u64 {
        self.range.start + self.written.min(self.size())
    }
}

/// 分片管理器
#[derive(Debug)]
pub struct ChunkManager {
    chunks: Vec<Chunk>,
    total_size: u64,
}

impl ChunkManager {
    /// 从断点记录创建（新任务传入 [`plan_chunks`] 的结果）
    pub fn from_records(total_size: u64, records: &[ChunkRecord]) -> Self {
        let chunks: Vec<Chunk> = records
            .iter()
            .enumerate()
            .map(|(index, r)| Chunk {
                index,
                range: r.from..r.to,
                completed: r.done,
                downloading: false,
                written: if r.done { r.len() } else { r.written.min(r.len()) },
            })
            .collect();
        info!(
            "创建分片管理器: 文件大小={} bytes, 分片数量={}, 已完成={}",
            total_size,
            chunks.len(),
            chunks.iter().filter(|c| c.completed).count()
        );
        Self { chunks, total_size }
    }

    /// 取出下一个待下载的分片并标记为下载中
    pub fn take_next(&mut self) -> Option<Chunk> {
        let chunk = self
            .chunks
            .iter_mut()
            .find(|c| !c.completed && !c.downloading)?;
        chunk.downloading = true;
        Some(chunk.clone())
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn pending_count(&self) -> usize {
        self.chunks.iter().filter(|c| !c.completed).count()
    }

    pub fn completed_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.completed).count()
    }

    /// 已落盘字节数（含未完成分片的前缀）
    pub fn downloaded_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.written.min(c.size())).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn is_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.completed)
    }

    /// 记录分片新写入的字节
    pub fn add_written(&mut self, index: usize, bytes: u64) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.written = (chunk.written + bytes).min(chunk.size());
        }
    }

    /// 重新请求前丢弃未确认的写入（服务器不支持续传时）
    pub fn reset_written(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.written = 0;
        }
    }

    /// 标记分片为已完成
    pub fn mark_completed(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.completed = true;
            chunk.downloading = false;
            chunk.written = chunk.size();
        }
    }

    /// 取消分片下载标记（下载失败或中断时调用）
    pub fn unmark_downloading(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.downloading = false;
        }
    }

    /// 导出为断点记录
    pub fn to_records(&self) -> Vec<ChunkRecord> {
        self.chunks
            .iter()
            .map(|c| ChunkRecord {
                from: c.range.start,
                to: c.range.end,
                done: c.completed,
                written: if c.completed { 0 } else { c.written },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_choose_plan() {
        assert_eq!(choose_plan(4 * MB as i64, true, MB), PlanMode::Parallel);
        assert_eq!(choose_plan(2 * MB as i64, true, MB), PlanMode::Parallel);
        assert_eq!(choose_plan(2 * MB as i64 - 1, true, MB), PlanMode::Stream);
        assert_eq!(choose_plan(4 * MB as i64, false, MB), PlanMode::Stream);
        assert_eq!(choose_plan(-1, true, MB), PlanMode::Stream);
        // 1MB 文件、10MB 分片：单连接
        assert_eq!(choose_plan(MB as i64, true, 10 * MB), PlanMode::Stream);
    }

    #[test]
    fn test_chunk_calculation() {
        let chunks = plan_chunks(4 * MB, MB);
        assert_eq!(chunks.len(), 4);
        assert_eq!((chunks[0].from, chunks[0].to), (0, MB));
        assert_eq!((chunks[1].from, chunks[1].to), (MB, 2 * MB));
        assert_eq!((chunks[3].from, chunks[3].to), (3 * MB, 4 * MB));

        let chunks = plan_chunks(2500, 1000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 500);

        assert!(plan_chunks(0, 1000).is_empty());
    }

    #[test]
    fn test_take_next_skips_completed_and_in_flight() {
        let mut records = plan_chunks(3000, 1000);
        records[0].done = true;
        let mut manager = ChunkManager::from_records(3000, &records);

        let a = manager.take_next().unwrap();
        assert_eq!(a.index, 1);
        let b = manager.take_next().unwrap();
        assert_eq!(b.index, 2);
        assert!(manager.take_next().is_none());

        manager.unmark_downloading(2);
        assert_eq!(manager.take_next().unwrap().index, 2);
    }

    #[test]
    fn test_written_tracking_and_records() {
        let records = plan_chunks(3000, 1000);
        let mut manager = ChunkManager::from_records(3000, &records);

        manager.add_written(0, 400);
        manager.mark_completed(1);
        assert_eq!(manager.downloaded_bytes(), 1400);
        assert_eq!(manager.chunks()[0].resume_offset(), 400);

        let out = manager.to_records();
        assert_eq!(out[0].written, 400);
        assert!(!out[0].done);
        assert!(out[1].done);

        let restored = ChunkManager::from_records(3000, &out);
        assert_eq!(restored.downloaded_bytes(), 1400);
        assert_eq!(restored.pending_count(), 2);

        manager.reset_written(0);
        assert_eq!(manager.downloaded_bytes(), 1000);
    }

    proptest! {
        #[test]
        fn prop_chunks_tile_exactly(size in 0u64..50_000_000, chunk_size in 1u64..5_000_000) {
            let chunks = plan_chunks(size, chunk_size);
            let expected = if size == 0 { 0 } else { (size + chunk_size - 1) / chunk_size };
            prop_assert_eq!(chunks.len() as u64, expected);

            let mut cursor = 0u64;
            for c in &chunks {
                prop_assert_eq!(c.from, cursor);
                prop_assert!(c.to > c.from);
                prop_assert!(c.len() <= chunk_size);
                cursor = c.to;
            }
            prop_assert_eq!(cursor, size);
        }
    }
}
