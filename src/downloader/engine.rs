//! HTTP 下载引擎
//!
//! 流程：
//! 1. 探测：HEAD（失败时退回 `GET Range: bytes=0-0`），得到文件大小、是否支持 Range、文件名
//! 2. 规划：支持 Range 且文件不小于两个分片时并发下载，否则单连接顺序下载
//! 3. 执行：`min(max_concurrent, N)` 个分片线程从分片管理器领取分片，
//!    每个分片 `GET Range: bytes=a-b` 写入文件对应位置；失败按退避策略重试
//! 4. 完成：校验大小、计算 SHA-256、入库
//!
//! 每个分片边界、每次网络读取、重试等待、哈希计算时都会检查任务令牌：
//! 暂停时保存断点后退出，取消时删除临时目录后退出

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{
    HeaderMap, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, RANGE,
};
use reqwest::{Client, StatusCode, Url};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::DownloadConfig;
use crate::downloader::chunk::{choose_plan, plan_chunks, ChunkManager, PlanMode};
use crate::downloader::control::{StopReason, TaskToken};
use crate::downloader::ingest::{IngestRequest, IngestedFile, Ingestor};
use crate::downloader::progress::{ProgressHandle, ProgressReporter, ProgressSnapshot};
use crate::downloader::retry::{RetryDecision, RetryPolicy};
use crate::downloader::task::HttpOptions;
use crate::error::{DownloadError, Result};
use crate::persistence::Database;
use crate::staging::{sanitize_file_name, sha256_file, ChunkRecord, ScratchLayout, Sidecar, StagedBlob};

/// 最多跟随的重定向次数
const MAX_REDIRECTS: usize = 10;

/// HTTP 下载结果
#[derive(Debug, Clone)]
pub struct HttpOutcome {
    pub file: IngestedFile,
    /// 所有分片的重试总次数
    pub retry_count: u32,
}

/// 探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMeta {
    /// 文件大小，未知时为 -1
    pub size: i64,
    pub accept_ranges: bool,
    pub file_name: String,
}

/// HTTP 下载器
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    db: Database,
    ingestor: Ingestor,
    retry_base: Duration,
    retry_cap: Duration,
    progress_interval: Duration,
    flush_every_chunks: usize,
    flush_interval: Duration,
}

impl HttpFetcher {
    pub fn new(db: Database, ingestor: Ingestor, config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("offline-dl/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| DownloadError::invalid(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            db,
            ingestor,
            retry_base: Duration::from_millis(config.retry_base_ms),
            retry_cap: Duration::from_millis(config.retry_cap_ms),
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            flush_every_chunks: config.sidecar_flush_chunks.max(1),
            flush_interval: Duration::from_secs(config.sidecar_flush_secs),
        })
    }

    fn retry_policy(&self, opts: &HttpOptions) -> RetryPolicy {
        RetryPolicy::new(opts.max_retries, self.retry_base, self.retry_cap)
    }

    /// 下载单个 URL 并入库
    pub async fn download_http(
        &self,
        task_id: &str,
        url: &str,
        user_id: i64,
        target_dir: &Path,
        opts: &HttpOptions,
        token: &TaskToken,
    ) -> Result<HttpOutcome> {
        opts.validate()?;
        validate_url(url)?;

        let timeout = Duration::from_secs(opts.timeout_secs);
        let policy = self.retry_policy(opts);
        let retries = AtomicU32::new(0);

        let remote = self.inspect_remote(url, timeout, &policy, token, &retries).await?;

        // 恢复时沿用第一次探测得到的文件名，保证临时文件路径不变
        let file_name = self
            .db
            .with_repos(|r| r.tasks().get(task_id))?
            .map(|t| t.file_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| remote.file_name.clone());

        info!(
            "探测完成: task={}, name={}, size={}, accept_ranges={}",
            task_id, file_name, remote.size, remote.accept_ranges
        );
        self.db
            .with_repos(|r| r.tasks().update_remote_meta(task_id, &file_name, remote.size))?;

        if remote.size > 0 {
            self.ingestor.precheck_quota(user_id, remote.size as u64)?;
        }

        let layout = ScratchLayout::new(target_dir, task_id);
        layout.create().await?;
        let data_path = layout.data_path(&file_name);
        let info_path = layout.info_path(&file_name);

        let mode = choose_plan(remote.size, remote.accept_ranges, opts.chunk_size);
        let records = prepare_data_file(&data_path, &info_path, url, &remote, opts.chunk_size, mode).await?;
        let base = Sidecar::new(
            url.to_string(),
            remote.size,
            opts.chunk_size,
            remote.accept_ranges,
            file_name.clone(),
            records.clone(),
        );
        let total = remote.size.max(0) as u64;
        let chunks = ChunkManager::from_records(total, &records);
        let already = chunks.downloaded_bytes();

        let reporter = ProgressReporter::spawn(
            self.db.clone(),
            task_id.to_string(),
            ProgressSnapshot {
                downloaded: already,
                total: remote.size,
            },
            self.progress_interval,
        );

        let job = Arc::new(ChunkJob {
            client: self.client.clone(),
            task_id: task_id.to_string(),
            url: url.to_string(),
            data_path: data_path.clone(),
            info_path: info_path.clone(),
            timeout,
            policy,
            token: token.clone(),
            mode,
            send_range: remote.accept_ranges,
            total_size: remote.size,
            state: Mutex::new(JobState {
                chunks,
                since_flush: 0,
                last_flush: Instant::now(),
            }),
            base: Mutex::new(base),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_every_chunks: self.flush_every_chunks,
            flush_interval: self.flush_interval,
            downloaded: AtomicU64::new(already),
            retries,
            progress: reporter.handle(),
        });
        job.flush().await?;

        let run = match mode {
            PlanMode::Parallel => run_parallel(job.clone(), opts.max_concurrent).await,
            PlanMode::Stream => run_stream(job.clone()).await,
        };

        if let Err(e) = run {
            reporter.finish().await;
            return Err(self.abandon(&job, &layout, e).await);
        }

        let written = job.downloaded.load(Ordering::Acquire);
        let size = if remote.size >= 0 { remote.size as u64 } else { written };
        let finalized = self.finalize(&job, size, token).await;
        reporter.finish().await;
        let sha256 = match finalized {
            Ok(sha) => sha,
            Err(e) => return Err(self.abandon(&job, &layout, e).await),
        };

        let file = self
            .ingestor
            .ingest(IngestRequest {
                user_id,
                virtual_path: opts.virtual_path.clone(),
                staged: StagedBlob {
                    path: data_path,
                    size,
                    sha256,
                    file_name,
                },
                encrypt: opts.enable_encryption,
                sidecar: Some(info_path),
            })
            .await?;

        if let Err(e) = layout.remove().await {
            warn!("清理临时目录失败: task={}, {}", task_id, e);
        }

        let retry_count = job.retries.load(Ordering::Acquire);
        info!(
            "✓ HTTP 下载完成: task={}, file_id={}, size={}, 重试 {} 次",
            task_id, file.file_id, file.file_size, retry_count
        );
        Ok(HttpOutcome { file, retry_count })
    }

    /// 下载中断后的收尾：暂停/失败时保存断点，取消时删除临时目录
    async fn abandon(&self, job: &ChunkJob, layout: &ScratchLayout, err: DownloadError) -> DownloadError {
        let err = match job.token.reason() {
            Some(_) if err.is_interrupt() => job.token.stop_error(),
            _ => err,
        };

        if job.token.reason() == Some(StopReason::Cancel) {
            if let Err(e) = layout.remove().await {
                error!("取消后删除临时目录失败: task={}, {}", job.task_id, e);
            }
            info!("任务已取消，临时目录已删除: task={}", job.task_id);
            return DownloadError::Cancelled;
        }

        if let Err(e) = job.flush().await {
            warn!("保存断点失败: task={}, {}", job.task_id, e);
        }
        match &err {
            DownloadError::Paused => info!(
                "任务已暂停，断点已保存: task={}, 已下载 {} bytes",
                job.task_id,
                job.downloaded.load(Ordering::Acquire)
            ),
            e => error!("下载失败: task={}, {}", job.task_id, e),
        }
        err
    }

    /// 校验大小并计算哈希
    async fn finalize(&self, job: &ChunkJob, size: u64, token: &TaskToken) -> Result<String> {
        token.check()?;
        let actual = tokio::fs::metadata(&job.data_path).await?.len();
        if actual != size {
            return Err(DownloadError::storage(format!(
                "文件大小校验失败: 期望 {} bytes，实际 {} bytes",
                size, actual
            )));
        }

        let sha256 = sha256_file(&job.data_path, || token.check()).await?;
        job.base.lock().sha256 = Some(sha256.clone());
        job.flush().await?;
        debug!("文件哈希: task={}, sha256={}", job.task_id, sha256);
        Ok(sha256)
    }

    /// 探测文件信息，暂时性错误按退避策略重试
    async fn inspect_remote(
        &self,
        url: &str,
        timeout: Duration,
        policy: &RetryPolicy,
        token: &TaskToken,
        retries: &AtomicU32,
    ) -> Result<RemoteMeta> {
        let mut attempt = 0u32;
        loop {
            token.check()?;
            let result = tokio::select! {
                biased;
                _ = token.stopped() => return Err(token.stop_error()),
                r = self.inspect_once(url, timeout) => r,
            };
            match result {
                Ok(info) => return Ok(info),
                Err(e) => {
                    attempt += 1;
                    match policy.decide(attempt, &e) {
                        RetryDecision::NoRetry => return Err(e),
                        RetryDecision::RetryAfter(delay) => {
                            retries.fetch_add(1, Ordering::AcqRel);
                            warn!("探测失败，{:?} 后第 {} 次重试: {}", delay, attempt, e);
                            token.sleep(delay).await?;
                        }
                    }
                }
            }
        }
    }

    async fn inspect_once(&self, url: &str, timeout: Duration) -> Result<RemoteMeta> {
        let head = self.client.head(url).timeout(timeout).send().await;
        match head {
            Ok(resp) if resp.status().is_success() => {
                let headers = resp.headers();
                let size = header_u64(headers, CONTENT_LENGTH.as_str());
                if let Some(size) = size {
                    return Ok(RemoteMeta {
                        size: size as i64,
                        accept_ranges: accepts_bytes(headers),
                        file_name: resolve_file_name(headers, resp.url()),
                    });
                }
                debug!("HEAD 未返回 Content-Length，改用 Range 探测: {}", url);
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                // 5xx / 429 直接交给重试，其它状态可能只是不支持 HEAD
                if DownloadError::from_status(status, "HEAD").is_retryable() {
                    return Err(DownloadError::from_status(status, "探测失败"));
                }
                debug!("HEAD 返回 {}，改用 Range 探测: {}", status, url);
            }
            Err(e) => {
                let err = DownloadError::from(e);
                if !err.is_retryable() {
                    return Err(err);
                }
                debug!("HEAD 请求失败，改用 Range 探测: {}", err);
            }
        }

        let resp = self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .timeout(timeout)
            .send()
            .await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let file_name = resolve_file_name(&headers, resp.url());

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let total = headers
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range)
                    .and_then(|r| r.total);
                Ok(RemoteMeta {
                    size: total.map(|t| t as i64).unwrap_or(-1),
                    accept_ranges: total.is_some(),
                    file_name,
                })
            }
            s if s.is_success() => Ok(RemoteMeta {
                size: header_u64(&headers, CONTENT_LENGTH.as_str())
                    .map(|v| v as i64)
                    .unwrap_or(-1),
                accept_ranges: false,
                file_name,
            }),
            s => Err(DownloadError::from_status(s.as_u16(), "探测失败")),
        }
    }
}

/// 准备数据文件：断点可用时沿用，否则新建并预分配
async fn prepare_data_file(
    data_path: &Path,
    info_path: &Path,
    url: &str,
    remote: &RemoteMeta,
    chunk_size: u64,
    mode: PlanMode,
) -> Result<Vec<ChunkRecord>> {
    if let Some(sidecar) = Sidecar::load(info_path) {
        let data_ok = tokio::fs::metadata(data_path)
            .await
            .map(|m| m.len() == remote.size as u64)
            .unwrap_or(false);
        if sidecar.matches(url, remote.size)
            && sidecar.chunk_size == chunk_size
            && sidecar.accept_ranges == remote.accept_ranges
            && data_ok
        {
            info!(
                "从断点恢复: {:?}, 已完成 {}/{} 个分片, {} bytes",
                data_path,
                sidecar.completed_count(),
                sidecar.chunks.len(),
                sidecar.downloaded_bytes()
            );
            return Ok(sidecar.chunks);
        }
        warn!("断点与远端文件不一致，重新下载: {:?}", info_path);
    }

    let file = tokio::fs::File::create(data_path).await?;
    if remote.size > 0 {
        file.set_len(remote.size as u64).await?;
    }
    debug!("文件准备完成: {:?}, 大小: {} bytes", data_path, remote.size);

    let size = remote.size.max(0) as u64;
    Ok(match mode {
        PlanMode::Parallel => plan_chunks(size, chunk_size),
        PlanMode::Stream if size > 0 => vec![ChunkRecord::new(0, size)],
        PlanMode::Stream => Vec::new(),
    })
}

struct JobState {
    chunks: ChunkManager,
    since_flush: usize,
    last_flush: Instant,
}

/// 一次下载中各分片线程共享的上下文
struct ChunkJob {
    client: Client,
    task_id: String,
    url: String,
    data_path: PathBuf,
    info_path: PathBuf,
    timeout: Duration,
    policy: RetryPolicy,
    token: TaskToken,
    mode: PlanMode,
    /// 服务器支持 Range 时才发送 Range 头
    send_range: bool,
    total_size: i64,
    state: Mutex<JobState>,
    base: Mutex<Sidecar>,
    flush_lock: tokio::sync::Mutex<()>,
    flush_every_chunks: usize,
    flush_interval: Duration,
    downloaded: AtomicU64,
    retries: AtomicU32,
    progress: ProgressHandle,
}

impl ChunkJob {
    fn add_written(&self, index: Option<usize>, bytes: u64) {
        if let Some(index) = index {
            self.state.lock().chunks.add_written(index, bytes);
        }
        let now = self.downloaded.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.progress.report(now);
    }

    /// 服务器不支持续传时丢弃分片已写入的部分
    fn discard_written(&self, index: usize) {
        let dropped = {
            let mut state = self.state.lock();
            let written = state.chunks.chunks().get(index).map(|c| c.written).unwrap_or(0);
            state.chunks.reset_written(index);
            written
        };
        if dropped > 0 {
            let now = self.downloaded.fetch_sub(dropped, Ordering::AcqRel) - dropped;
            self.progress.report(now);
        }
    }

    /// 写入一段数据，写入完成后才计入 `written`
    async fn append(&self, file: &mut tokio::fs::File, index: Option<usize>, bytes: &[u8]) -> Result<()> {
        file.write_all(bytes).await?;
        file.flush().await?;
        self.add_written(index, bytes.len() as u64);
        Ok(())
    }

    /// 保存断点：先取快照再 fsync 数据文件，快照中的字节都已落盘
    async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;

        let sidecar = {
            let mut state = self.state.lock();
            state.since_flush = 0;
            state.last_flush = Instant::now();
            let mut sidecar = self.base.lock().clone();
            sidecar.chunks = state.chunks.to_records();
            sidecar
        };

        match tokio::fs::OpenOptions::new().write(true).open(&self.data_path).await {
            Ok(file) => file.sync_data().await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let path = self.info_path.clone();
        tokio::task::spawn_blocking(move || sidecar.save(&path))
            .await
            .map_err(|e| DownloadError::storage(format!("保存断点任务异常: {}", e)))??;
        Ok(())
    }

    /// 标记分片完成，满足条件时保存断点
    async fn complete_chunk(&self, index: usize) -> Result<()> {
        let due = {
            let mut state = self.state.lock();
            state.chunks.mark_completed(index);
            state.since_flush += 1;
            state.since_flush >= self.flush_every_chunks
                || state.last_flush.elapsed() >= self.flush_interval
        };
        if due {
            self.flush().await?;
        }
        Ok(())
    }

    /// 下载分片，暂时性错误按退避策略重试
    async fn fetch_with_retry(&self, index: usize, worker_id: usize) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            self.token.check()?;
            if !self.send_range {
                self.discard_written(index);
            }
            match self.fetch_chunk(index, worker_id).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    match self.policy.decide(attempt, &e) {
                        RetryDecision::NoRetry => {
                            error!(
                                "[分片线程{}] ✗ 分片 #{} 下载失败，已重试 {} 次: {}",
                                worker_id,
                                index,
                                attempt - 1,
                                e
                            );
                            return Err(e);
                        }
                        RetryDecision::RetryAfter(delay) => {
                            self.retries.fetch_add(1, Ordering::AcqRel);
                            warn!(
                                "[分片线程{}] ⚠ 分片 #{} 下载失败，{:?} 后第 {}/{} 次重试: {}",
                                worker_id, index, delay, attempt, self.policy.max_retries, e
                            );
                            self.token.sleep(delay).await?;
                        }
                    }
                }
            }
        }
    }

    /// 单次请求下载一个分片（从已写入位置继续）
    async fn fetch_chunk(&self, index: usize, worker_id: usize) -> Result<()> {
        let chunk = self
            .state
            .lock()
            .chunks
            .chunks()
            .get(index)
            .cloned()
            .ok_or_else(|| DownloadError::storage(format!("分片 #{} 不存在", index)))?;

        let mut offset = chunk.resume_offset();
        let end = chunk.range.end;
        if offset >= end {
            return Ok(());
        }

        let mut request = self.client.get(&self.url).timeout(self.timeout);
        if self.send_range {
            request = request.header(RANGE, format!("bytes={}-{}", offset, end - 1));
        }
        debug!(
            "[分片线程{}] 下载分片 #{}: bytes={}-{}",
            worker_id,
            index,
            offset,
            end - 1
        );

        let resp = tokio::select! {
            biased;
            _ = self.token.stopped() => return Err(self.token.stop_error()),
            r = request.send() => r?,
        };

        let status = resp.status();
        if status == StatusCode::PARTIAL_CONTENT {
            let range = resp
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
                .ok_or_else(|| DownloadError::NetworkFatal("206 响应缺少有效的 Content-Range".to_string()))?;
            if range.start != offset || range.end + 1 != end {
                return Err(DownloadError::NetworkFatal(format!(
                    "Content-Range 不匹配: 请求 {}-{}，返回 {}-{}",
                    offset,
                    end - 1,
                    range.start,
                    range.end
                )));
            }
            if let Some(len) = header_u64(resp.headers(), CONTENT_LENGTH.as_str()) {
                if len != range.end - range.start + 1 {
                    return Err(DownloadError::NetworkFatal(format!(
                        "Content-Length {} 与 Content-Range {}-{} 不一致",
                        len, range.start, range.end
                    )));
                }
            }
        } else if status.is_success() {
            // 200 只在单连接下载整个文件时可接受
            let whole_body = self.mode == PlanMode::Stream && chunk.range.start == 0;
            if !whole_body {
                return Err(DownloadError::NetworkFatal(format!(
                    "服务器未按 Range 返回分片 #{}: HTTP {}",
                    index, status
                )));
            }
            if offset > 0 {
                warn!("服务器忽略了续传请求，从头下载: task={}", self.task_id);
                self.discard_written(index);
                offset = 0;
            }
            if let Some(len) = header_u64(resp.headers(), CONTENT_LENGTH.as_str()) {
                if self.total_size >= 0 && len != self.total_size as u64 {
                    return Err(DownloadError::NetworkFatal(format!(
                        "Content-Length {} 与探测到的大小 {} 不一致",
                        len, self.total_size
                    )));
                }
            }
        } else {
            return Err(DownloadError::from_status(status.as_u16(), "分片请求失败"));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.data_path)
            .await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut stream = resp.bytes_stream();
        let mut position = offset;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.stopped() => {
                    file.flush().await?;
                    return Err(self.token.stop_error());
                }
                next = stream.next() => next,
            };
            let Some(bytes) = next else { break };
            let bytes = bytes?;
            if position + bytes.len() as u64 > end {
                return Err(DownloadError::NetworkFatal(format!(
                    "分片 #{} 响应数据超出范围",
                    index
                )));
            }
            self.append(&mut file, Some(index), &bytes).await?;
            position += bytes.len() as u64;
        }
        file.flush().await?;

        if position != end {
            return Err(DownloadError::NetworkTransient(format!(
                "分片 #{} 数据不完整: 收到 {}/{} bytes",
                index,
                position - chunk.range.start,
                end - chunk.range.start
            )));
        }

        debug!(
            "[分片线程{}] ✓ 分片 #{} 下载完成",
            worker_id, index
        );
        Ok(())
    }

    /// 大小未知（或为 0）时顺序读取整个响应体，失败只能从头开始
    async fn fetch_unsized(&self) -> Result<()> {
        let written = self.downloaded.swap(0, Ordering::AcqRel);
        if written > 0 {
            self.progress.report(0);
        }

        let resp = tokio::select! {
            biased;
            _ = self.token.stopped() => return Err(self.token.stop_error()),
            r = self.client.get(&self.url).timeout(self.timeout).send() => r?,
        };
        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::from_status(status.as_u16(), "下载请求失败"));
        }

        let mut file = tokio::fs::File::create(&self.data_path).await?;
        let mut stream = resp.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.stopped() => {
                    file.flush().await?;
                    return Err(self.token.stop_error());
                }
                next = stream.next() => next,
            };
            let Some(bytes) = next else { break };
            let bytes = bytes?;
            self.append(&mut file, None, &bytes).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

/// 分片线程：循环领取分片直到没有待下载的分片
async fn run_worker(job: Arc<ChunkJob>, worker_id: usize) -> Result<()> {
    loop {
        job.token.check()?;
        let Some(chunk) = job.state.lock().chunks.take_next() else {
            return Ok(());
        };
        match job.fetch_with_retry(chunk.index, worker_id).await {
            Ok(()) => job.complete_chunk(chunk.index).await?,
            Err(e) => {
                job.state.lock().chunks.unmark_downloading(chunk.index);
                return Err(e);
            }
        }
    }
}

async fn run_parallel(job: Arc<ChunkJob>, max_concurrent: usize) -> Result<()> {
    let pending = job.state.lock().chunks.pending_count();
    let workers = max_concurrent.min(pending).max(1);
    info!(
        "开始并发下载: task={}, 待下载分片 {}，线程数 {}",
        job.task_id, pending, workers
    );

    let mut set = JoinSet::new();
    for worker_id in 0..workers {
        set.spawn(run_worker(job.clone(), worker_id));
    }

    let mut first_err: Option<DownloadError> = None;
    while let Some(joined) = set.join_next().await {
        let res = match joined {
            Ok(res) => res,
            Err(e) if e.is_cancelled() => continue,
            Err(e) => Err(DownloadError::storage(format!("分片线程异常退出: {}", e))),
        };
        if let Err(e) = res {
            if first_err.is_none() {
                // 不可恢复的错误：其余分片不再继续
                if !e.is_interrupt() {
                    set.abort_all();
                }
                first_err = Some(e);
            }
        }
    }

    if let Some(e) = first_err {
        return Err(e);
    }
    if !job.state.lock().chunks.is_completed() {
        return Err(job.token.check().err().unwrap_or_else(|| {
            DownloadError::storage("分片未全部完成".to_string())
        }));
    }
    Ok(())
}

async fn run_stream(job: Arc<ChunkJob>) -> Result<()> {
    let has_window = job.state.lock().chunks.chunk_count() > 0;
    if has_window {
        let done = job.state.lock().chunks.is_completed();
        if !done {
            job.fetch_with_retry(0, 0).await?;
            job.complete_chunk(0).await?;
        }
        return Ok(());
    }

    let mut attempt = 0u32;
    loop {
        job.token.check()?;
        match job.fetch_unsized().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_interrupt() => return Err(e),
            Err(e) => {
                attempt += 1;
                match job.policy.decide(attempt, &e) {
                    RetryDecision::NoRetry => return Err(e),
                    RetryDecision::RetryAfter(delay) => {
                        job.retries.fetch_add(1, Ordering::AcqRel);
                        warn!("下载失败，{:?} 后第 {} 次重试: {}", delay, attempt, e);
                        job.token.sleep(delay).await?;
                    }
                }
            }
        }
    }
}

pub(crate) fn validate_url(url: &str) -> Result<()> {
    let parsed = Url::parse(url).map_err(|e| DownloadError::invalid(format!("无效的 URL {}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(DownloadError::invalid(format!("不支持的协议: {}", other))),
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn accepts_bytes(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|u| u.trim().eq_ignore_ascii_case("bytes")))
        .unwrap_or(false)
}

/// `Content-Range: bytes a-b/total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    /// 闭区间上界
    pub end: u64,
    pub total: Option<u64>,
}

pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some(ContentRange { start, end, total })
}

/// 从 Content-Disposition 或 URL 末段得到文件名
fn resolve_file_name(headers: &HeaderMap, url: &Url) -> String {
    let from_header = headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_disposition);
    let name = from_header.or_else(|| {
        url.path_segments()
            .and_then(|mut s| s.next_back())
            .filter(|s| !s.is_empty())
            .map(|s| {
                urlencoding::decode(s)
                    .map(|d| d.into_owned())
                    .unwrap_or_else(|_| s.to_string())
            })
    });
    sanitize_file_name(name.as_deref().unwrap_or(""))
}

pub fn filename_from_disposition(value: &str) -> Option<String> {
    let params: Vec<&str> = value.split(';').map(str::trim).collect();

    // RFC 5987: filename*=UTF-8''%E4%B8%AD.txt
    for param in &params {
        if let Some(rest) = param.strip_prefix("filename*=") {
            let encoded = rest.split_once("''").map(|(_, v)| v).unwrap_or(rest);
            if let Ok(decoded) = urlencoding::decode(encoded.trim_matches('"')) {
                if !decoded.is_empty() {
                    return Some(decoded.into_owned());
                }
            }
        }
    }
    for param in &params {
        if let Some(rest) = param.strip_prefix("filename=") {
            let name = rest.trim_matches('"');
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::db::test_support::temp_db;
    use reqwest::header::HeaderValue;
    use tempfile::TempDir;

    fn chunk_job(dir: &Path, db: Database, total: u64, chunk_size: u64) -> (Arc<ChunkJob>, ProgressReporter) {
        let data_path = dir.join("f.bin.data");
        let info_path = dir.join("f.bin.data.info");
        std::fs::File::create(&data_path).unwrap().set_len(total).unwrap();

        let url = "http://127.0.0.1/f.bin".to_string();
        let records = plan_chunks(total, chunk_size);
        let reporter = ProgressReporter::spawn(
            db,
            "t".to_string(),
            ProgressSnapshot {
                downloaded: 0,
                total: total as i64,
            },
            Duration::from_millis(10),
        );
        let job = Arc::new(ChunkJob {
            client: Client::new(),
            task_id: "t".to_string(),
            url: url.clone(),
            data_path,
            info_path,
            timeout: Duration::from_secs(5),
            policy: RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1)),
            token: TaskToken::new(),
            mode: PlanMode::Parallel,
            send_range: true,
            total_size: total as i64,
            state: Mutex::new(JobState {
                chunks: ChunkManager::from_records(total, &records),
                since_flush: 0,
                last_flush: Instant::now(),
            }),
            base: Mutex::new(Sidecar::new(
                url,
                total as i64,
                chunk_size,
                true,
                "f.bin".to_string(),
                records,
            )),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_every_chunks: 8,
            flush_interval: Duration::from_secs(5),
            downloaded: AtomicU64::new(0),
            retries: AtomicU32::new(0),
            progress: reporter.handle(),
        });
        (job, reporter)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_checkpoint_never_ahead_of_data() {
        let dir = TempDir::new().unwrap();
        let (_db_dir, db) = temp_db();
        let chunk = 256 * 1024u64;
        let (job, reporter) = chunk_job(dir.path(), db, 2 * chunk, chunk);
        // 不含 0 字节，文件中的空洞可以直接看出来
        let payload: Vec<u8> = (0..chunk).map(|i| (i % 251) as u8 + 1).collect();

        let writer = {
            let job = job.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                let mut file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(&job.data_path)
                    .await
                    .unwrap();
                file.seek(std::io::SeekFrom::Start(chunk)).await.unwrap();
                for piece in payload.chunks(4096) {
                    job.append(&mut file, Some(1), piece).await.unwrap();
                }
            })
        };

        let mut checks = 0;
        loop {
            let finished = writer.is_finished();
            job.flush().await.unwrap();
            let sidecar = Sidecar::load(&job.info_path).unwrap();
            let record = &sidecar.chunks[1];
            let data = std::fs::read(&job.data_path).unwrap();
            let start = record.from as usize;
            let written = record.written as usize;
            assert_eq!(
                &data[start..start + written],
                &payload[..written],
                "断点记录了 {} bytes，但数据文件中没有全部写入",
                written
            );
            checks += 1;
            if finished {
                break;
            }
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();

        job.flush().await.unwrap();
        let sidecar = Sidecar::load(&job.info_path).unwrap();
        assert_eq!(sidecar.chunks[1].written, chunk);
        assert_eq!(sidecar.chunks[0].written, 0);
        assert!(checks >= 1);
        reporter.finish().await;
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 0-1048575/4194304"),
            Some(ContentRange {
                start: 0,
                end: 1048575,
                total: Some(4194304)
            })
        );
        assert_eq!(
            parse_content_range("bytes 10-19/*"),
            Some(ContentRange {
                start: 10,
                end: 19,
                total: None
            })
        );
        assert_eq!(parse_content_range("bytes 20-10/100"), None);
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes */100"), None);
    }

    #[test]
    fn test_filename_from_disposition() {
        assert_eq!(
            filename_from_disposition("attachment; filename=\"report.pdf\""),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            filename_from_disposition(
                "attachment; filename=\"fallback.txt\"; filename*=UTF-8''%E6%8A%A5%E5%91%8A.txt"
            ),
            Some("报告.txt".to_string())
        );
        assert_eq!(filename_from_disposition("inline"), None);
    }

    #[test]
    fn test_resolve_file_name() {
        let url = Url::parse("http://example.com/dir/my%20file.iso?x=1").unwrap();
        assert_eq!(resolve_file_name(&HeaderMap::new(), &url), "my file.iso");

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"a.bin\""),
        );
        assert_eq!(resolve_file_name(&headers, &url), "a.bin");

        let root = Url::parse("http://example.com/").unwrap();
        assert_eq!(resolve_file_name(&HeaderMap::new(), &root), "download");
    }

    #[test]
    fn test_accept_ranges() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_bytes(&headers));
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        assert!(accepts_bytes(&headers));
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("none"));
        assert!(!accepts_bytes(&headers));
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com/a").is_ok());
        assert_eq!(
            validate_url("ftp://example.com/a").unwrap_err().kind(),
            crate::error::ErrorKind::InvalidInput
        );
        assert!(validate_url("not a url").is_err());
    }
}
