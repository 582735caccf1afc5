use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bit_set::BitSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    BatchResult, FailedFile, SessionEvent, TorrentClient, TorrentMetadata, TorrentOptions,
    TorrentSession, TorrentSource,
};
use crate::downloader::control::{StopReason, TaskToken};
use crate::downloader::ingest::{IngestRequest, IngestedFile, Ingestor};
use crate::downloader::progress::{ProgressReporter, ProgressSnapshot};
use crate::error::{DownloadError, Result};
use crate::persistence::Database;
use crate::staging::{sha256_file, ScratchLayout, StagedBlob};

/// 已入库文件的记录，保存在临时目录中，恢复后不会重复入库
const BATCH_STATE_FILE: &str = ".batch.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct BatchState {
    /// 相对路径 -> 入库结果
    ingested: HashMap<String, IngestedFile>,
    failed: Vec<FailedFile>,
}

impl BatchState {
    fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("批量状态文件损坏 {:?}: {}", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn is_settled(&self, rel: &str) -> bool {
        self.ingested.contains_key(rel) || self.failed.iter().any(|f| f.path == rel)
    }
}

/// BT 下载器
#[derive(Clone)]
pub struct TorrentFetcher {
    client: Arc<dyn TorrentClient>,
    ingestor: Ingestor,
    db: Database,
    progress_interval: Duration,
}

impl TorrentFetcher {
    pub fn new(
        client: Arc<dyn TorrentClient>,
        ingestor: Ingestor,
        db: Database,
        progress_interval: Duration,
    ) -> Self {
        Self {
            client,
            ingestor,
            db,
            progress_interval,
        }
    }

    /// 下载种子中的全部文件，每个文件完成后单独入库
    ///
    /// 暂停：停止会话并保留临时目录，返回 `Paused`；
    /// 取消：停止会话并删除临时目录，返回 `Cancelled`
    #[allow(clippy::too_many_arguments)]
    pub async fn download(
        &self,
        task_id: &str,
        source: &TorrentSource,
        user_id: i64,
        target_dir: &Path,
        virtual_path: &str,
        opts: &TorrentOptions,
        token: &TaskToken,
    ) -> Result<BatchResult> {
        opts.validate()?;
        let layout = ScratchLayout::new(target_dir, task_id);
        layout.create().await?;
        let state_path = layout.dir().join(BATCH_STATE_FILE);
        let mut state = BatchState::load(&state_path);

        info!(
            "开始 BT 下载: task={}, source={}, 已入库 {} 个文件",
            task_id,
            source.display_name(),
            state.ingested.len()
        );

        let config = opts.session_config(layout.dir());
        let mut session = self.client.start(source, &config).await?;

        let reporter = ProgressReporter::spawn(
            self.db.clone(),
            task_id.to_string(),
            ProgressSnapshot {
                downloaded: 0,
                total: -1,
            },
            self.progress_interval,
        );

        let mut run = SessionRun {
            task_id,
            user_id,
            virtual_path,
            encrypt: opts.enable_encryption,
            layout: &layout,
            state_path: &state_path,
            state: &mut state,
            metadata: None,
            pieces: BitSet::new(),
            reporter: &reporter,
        };

        let outcome = self.drive(&mut run, session.as_mut(), token).await;
        let metadata = run.metadata.take();
        reporter.finish().await;

        match outcome {
            Ok(()) => {
                if let Err(e) = session.stop(false).await {
                    debug!("停止已完成的会话失败: {}", e);
                }
                let meta = metadata.ok_or_else(|| {
                    DownloadError::NetworkFatal("会话结束但未收到元数据".to_string())
                })?;
                let result = BatchResult {
                    total_files: meta.files.len(),
                    success_files: meta
                        .files
                        .iter()
                        .filter_map(|f| state.ingested.get(&rel_key(&f.path)).cloned())
                        .collect(),
                    failed_files: state.failed.clone(),
                };
                if let Err(e) = layout.remove().await {
                    warn!("清理临时目录失败: task={}, {}", task_id, e);
                }
                info!(
                    "✓ BT 下载完成: task={}, 成功 {}/{}, 失败 {}",
                    task_id,
                    result.success_files.len(),
                    result.total_files,
                    result.failed_files.len()
                );
                Ok(result)
            }
            Err(e) if e.is_interrupt() => {
                let preserve = token.reason() == Some(StopReason::Pause);
                if let Err(stop_err) = session.stop(preserve).await {
                    warn!("停止 BT 会话失败: task={}, {}", task_id, stop_err);
                }
                if !preserve {
                    layout.remove().await?;
                }
                info!("BT 任务已中断: task={}, 原因={}", task_id, e);
                Err(e)
            }
            Err(e) => {
                if let Err(stop_err) = session.stop(true).await {
                    warn!("停止 BT 会话失败: task={}, {}", task_id, stop_err);
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        run: &mut SessionRun<'_>,
        session: &mut dyn TorrentSession,
        token: &TaskToken,
    ) -> Result<()> {
        loop {
            let event = tokio::select! {
                biased;
                _ = token.stopped() => return Err(token.stop_error()),
                ev = session.next_event() => ev,
            };

            match event {
                Some(SessionEvent::Metadata(meta)) => {
                    info!(
                        "BT 元数据就绪: task={}, name={}, 文件数={}, 大小={}",
                        run.task_id,
                        meta.name,
                        meta.files.len(),
                        meta.total_length
                    );
                    let size = meta.total_length as i64;
                    self.db.with_repos(|r| {
                        r.tasks().update_remote_meta(run.task_id, &meta.name, size)
                    })?;
                    run.reporter.set_total(size);
                    run.metadata = Some(meta);
                    // 空文件没有分片，元数据就绪即可入库
                    let files: Vec<usize> = (0..run.meta()?.files.len()).collect();
                    for file_index in files {
                        self.try_ingest_file(run, file_index, token).await?;
                    }
                }
                Some(SessionEvent::PieceCompleted {
                    index,
                    downloaded_bytes,
                }) => {
                    run.pieces.insert(index);
                    run.reporter.report(downloaded_bytes);
                    let files = run.meta()?.files_for_piece(index);
                    for file_index in files {
                        self.try_ingest_file(run, file_index, token).await?;
                    }
                }
                Some(SessionEvent::Finished) => {
                    let count = run.meta()?.files.len();
                    for file_index in 0..count {
                        run.mark_all_pieces(file_index)?;
                        self.try_ingest_file(run, file_index, token).await?;
                    }
                    return Ok(());
                }
                Some(SessionEvent::Error(msg)) => {
                    return Err(DownloadError::NetworkFatal(format!("BT 会话错误: {}", msg)));
                }
                None => {
                    return Err(DownloadError::NetworkFatal(
                        "BT 会话意外结束".to_string(),
                    ));
                }
            }
        }
    }

    /// 文件的全部分片已完成且尚未处理时入库
    async fn try_ingest_file(
        &self,
        run: &mut SessionRun<'_>,
        file_index: usize,
        token: &TaskToken,
    ) -> Result<()> {
        let meta = run.meta()?;
        let Some(entry) = meta.files.get(file_index).cloned() else {
            return Ok(());
        };
        let key = rel_key(&entry.path);
        if run.state.is_settled(&key) {
            return Ok(());
        }
        if !meta
            .pieces_for_file(file_index)
            .all(|p| run.pieces.contains(p))
        {
            return Ok(());
        }

        token.check()?;
        let path = run.layout.dir().join(&entry.path);
        let name = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.clone());

        match self.ingest_one(run, &entry.path, &path, &name, entry.length, token).await {
            Ok(file) => {
                run.state.ingested.insert(key, file);
            }
            Err(e) if e.is_interrupt() => return Err(e),
            Err(e) => {
                warn!("BT 文件入库失败: task={}, file={}, {}", run.task_id, key, e);
                run.state.failed.push(FailedFile {
                    name,
                    path: key,
                    error: e.to_string(),
                });
            }
        }
        run.state.save(run.state_path)?;
        Ok(())
    }

    async fn ingest_one(
        &self,
        run: &SessionRun<'_>,
        rel: &Path,
        path: &Path,
        name: &str,
        expected_len: u64,
        token: &TaskToken,
    ) -> Result<IngestedFile> {
        let actual = tokio::fs::metadata(path).await?.len();
        if actual != expected_len {
            return Err(DownloadError::storage(format!(
                "文件大小不一致: 期望 {}，实际 {}",
                expected_len, actual
            )));
        }
        let sha256 = sha256_file(path, || token.check()).await?;

        // 种子内的子目录映射到网盘目录
        let mut virtual_dir = PathBuf::from(run.virtual_path);
        if let Some(parent) = rel.parent() {
            virtual_dir.push(parent);
        }

        self.ingestor
            .ingest(IngestRequest {
                user_id: run.user_id,
                virtual_path: virtual_dir.to_string_lossy().replace('\\', "/"),
                staged: StagedBlob {
                    path: path.to_path_buf(),
                    size: actual,
                    sha256,
                    file_name: name.to_string(),
                },
                encrypt: run.encrypt,
                sidecar: None,
            })
            .await
    }
}

struct SessionRun<'a> {
    task_id: &'a str,
    user_id: i64,
    virtual_path: &'a str,
    encrypt: bool,
    layout: &'a ScratchLayout,
    state_path: &'a Path,
    state: &'a mut BatchState,
    metadata: Option<TorrentMetadata>,
    pieces: BitSet,
    reporter: &'a ProgressReporter,
}

impl SessionRun<'_> {
    fn meta(&self) -> Result<&TorrentMetadata> {
        self.metadata
            .as_ref()
            .ok_or_else(|| DownloadError::NetworkFatal("尚未收到种子元数据".to_string()))
    }

    fn mark_all_pieces(&mut self, file_index: usize) -> Result<()> {
        let range = self.meta()?.pieces_for_file(file_index);
        for p in range {
            self.pieces.insert(p);
        }
        Ok(())
    }
}

fn rel_key(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::ingest::tests::make_ingestor;
    use crate::downloader::task::{DownloadTask, TaskKind, TaskOptions};
    use crate::persistence::db::test_support::temp_db;
    use crate::persistence::User;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    use super::super::{SessionConfig, TorrentFileEntry};

    /// 脚本化会话：`None` 表示在此处挂起，直到被停止
    struct ScriptedSession {
        events: VecDeque<Option<SessionEvent>>,
        stops: Arc<Mutex<Vec<bool>>>,
    }

    #[async_trait]
    impl TorrentSession for ScriptedSession {
        async fn next_event(&mut self) -> Option<SessionEvent> {
            match self.events.pop_front() {
                Some(Some(ev)) => Some(ev),
                Some(None) => std::future::pending::<Option<SessionEvent>>().await,
                None => None,
            }
        }

        async fn stop(&mut self, preserve_data: bool) -> Result<()> {
            self.stops.lock().push(preserve_data);
            Ok(())
        }
    }

    /// 启动时把文件内容写入保存目录，然后按脚本发事件
    struct ScriptedClient {
        files: Vec<(PathBuf, Vec<u8>)>,
        script: Vec<Option<SessionEvent>>,
        stops: Arc<Mutex<Vec<bool>>>,
        configs: Arc<Mutex<Vec<SessionConfig>>>,
    }

    #[async_trait]
    impl TorrentClient for ScriptedClient {
        async fn start(
            &self,
            _source: &TorrentSource,
            config: &SessionConfig,
        ) -> Result<Box<dyn TorrentSession>> {
            for (rel, content) in &self.files {
                let path = config.save_dir.join(rel);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, content)?;
            }
            self.configs.lock().push(config.clone());
            Ok(Box::new(ScriptedSession {
                events: self.script.clone().into(),
                stops: self.stops.clone(),
            }))
        }
    }

    fn two_file_meta() -> TorrentMetadata {
        TorrentMetadata {
            name: "pack".to_string(),
            piece_length: 4,
            total_length: 10,
            files: vec![
                TorrentFileEntry {
                    path: PathBuf::from("pack/a.txt"),
                    length: 6,
                    offset: 0,
                },
                TorrentFileEntry {
                    path: PathBuf::from("pack/sub/b.txt"),
                    length: 4,
                    offset: 6,
                },
            ],
        }
    }

    fn files() -> Vec<(PathBuf, Vec<u8>)> {
        vec![
            (PathBuf::from("pack/a.txt"), b"aaaaaa".to_vec()),
            (PathBuf::from("pack/sub/b.txt"), b"bbbb".to_vec()),
        ]
    }

    struct Fixture {
        _dir: TempDir,
        _db_dir: TempDir,
        db: Database,
        scratch: PathBuf,
        task: DownloadTask,
        ingestor: Ingestor,
    }

    fn fixture(space: i64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let (db_dir, db) = temp_db();
        db.with_repos(|r| {
            r.users().insert(&User {
                id: 1,
                name: "u".to_string(),
                space,
                free_space: space,
            })
        })
        .unwrap();
        let scratch = dir.path().join("scratch");
        let task = DownloadTask::new(
            1,
            TaskKind::Magnet,
            "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a".to_string(),
            "/bt".to_string(),
            scratch.clone(),
            TaskOptions::Torrent(TorrentOptions::default()),
        );
        db.with_repos(|r| r.tasks().insert(&task)).unwrap();
        db.with_repos(|r| r.tasks().mark_downloading(&task.id)).unwrap();
        let ingestor = make_ingestor(&db, dir.path());
        Fixture {
            _dir: dir,
            _db_dir: db_dir,
            db,
            scratch,
            task,
            ingestor,
        }
    }

    fn fetcher(fx: &Fixture, client: ScriptedClient) -> TorrentFetcher {
        TorrentFetcher::new(
            Arc::new(client),
            fx.ingestor.clone(),
            fx.db.clone(),
            Duration::from_millis(10),
        )
    }

    fn source() -> TorrentSource {
        TorrentSource::parse("magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a")
            .unwrap()
    }

    #[tokio::test]
    async fn test_each_file_ingested_separately() {
        let fx = fixture(0);
        let stops = Arc::new(Mutex::new(Vec::new()));
        let configs = Arc::new(Mutex::new(Vec::new()));
        let client = ScriptedClient {
            files: files(),
            script: vec![
                Some(SessionEvent::Metadata(two_file_meta())),
                Some(SessionEvent::PieceCompleted {
                    index: 0,
                    downloaded_bytes: 4,
                }),
                Some(SessionEvent::PieceCompleted {
                    index: 1,
                    downloaded_bytes: 8,
                }),
                Some(SessionEvent::PieceCompleted {
                    index: 2,
                    downloaded_bytes: 10,
                }),
                Some(SessionEvent::Finished),
            ],
            stops: stops.clone(),
            configs: configs.clone(),
        };

        let opts = TorrentOptions {
            max_concurrent_peers: 7,
            download_rate_mbps: 1,
            upload_rate_mbps: 0,
            enable_encryption: false,
        };
        let result = fetcher(&fx, client)
            .download(
                &fx.task.id,
                &source(),
                1,
                &fx.scratch,
                "/bt",
                &opts,
                &TaskToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.total_files, 2);
        assert_eq!(result.success_files.len(), 2);
        assert!(result.failed_files.is_empty());
        assert_ne!(result.success_files[0].file_id, result.success_files[1].file_id);
        assert_eq!(result.total_size(), 10);

        let b = &result.success_files[1];
        assert_eq!(b.file_name, "b.txt");
        assert_eq!(std::fs::read(&b.blob_path).unwrap(), b"bbbb");

        let cfg = configs.lock()[0].clone();
        assert_eq!(cfg.max_peers, 7);
        assert_eq!(cfg.download_limit_bps, Some(125_000));
        assert_eq!(*stops.lock(), vec![false]);

        let task = fx.db.with_repos(|r| r.tasks().require(&fx.task.id)).unwrap();
        assert_eq!(task.file_name, "pack");
        assert_eq!(task.file_size, 10);

        // 批量状态文件和种子目录树随临时目录一起删除
        assert!(!fx.scratch.join(&fx.task.id).exists());
    }

    #[tokio::test]
    async fn test_quota_failure_is_per_file() {
        // 只够放下 a.txt
        let fx = fixture(7);
        let client = ScriptedClient {
            files: files(),
            script: vec![
                Some(SessionEvent::Metadata(two_file_meta())),
                Some(SessionEvent::PieceCompleted {
                    index: 0,
                    downloaded_bytes: 4,
                }),
                Some(SessionEvent::PieceCompleted {
                    index: 1,
                    downloaded_bytes: 8,
                }),
                Some(SessionEvent::PieceCompleted {
                    index: 2,
                    downloaded_bytes: 10,
                }),
                Some(SessionEvent::Finished),
            ],
            stops: Arc::new(Mutex::new(Vec::new())),
            configs: Arc::new(Mutex::new(Vec::new())),
        };

        let result = fetcher(&fx, client)
            .download(
                &fx.task.id,
                &source(),
                1,
                &fx.scratch,
                "/bt",
                &TorrentOptions::default(),
                &TaskToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.success_files.len(), 1);
        assert_eq!(result.failed_files.len(), 1);
        assert_eq!(result.failed_files[0].name, "b.txt");
        assert_eq!(result.failed_files[0].path, "pack/sub/b.txt");
        // 入库失败的文件不再保留
        assert!(!fx.scratch.join(&fx.task.id).exists());
    }

    #[tokio::test]
    async fn test_pause_preserves_scratch_and_cancel_removes_it() {
        for (pause, expect_preserve) in [(true, true), (false, false)] {
            let fx = fixture(0);
            let stops = Arc::new(Mutex::new(Vec::new()));
            let client = ScriptedClient {
                files: files(),
                script: vec![
                    Some(SessionEvent::Metadata(two_file_meta())),
                    Some(SessionEvent::PieceCompleted {
                        index: 0,
                        downloaded_bytes: 4,
                    }),
                    None,
                ],
                stops: stops.clone(),
                configs: Arc::new(Mutex::new(Vec::new())),
            };

            let token = TaskToken::new();
            let t2 = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                if pause {
                    t2.pause();
                } else {
                    t2.cancel();
                }
            });

            let err = fetcher(&fx, client)
                .download(
                    &fx.task.id,
                    &source(),
                    1,
                    &fx.scratch,
                    "/bt",
                    &TorrentOptions::default(),
                    &token,
                )
                .await
                .unwrap_err();

            assert!(err.is_interrupt());
            assert_eq!(*stops.lock(), vec![expect_preserve]);
            assert_eq!(fx.scratch.join(&fx.task.id).exists(), expect_preserve);
        }
    }

    #[tokio::test]
    async fn test_resume_skips_ingested_files() {
        let fx = fixture(0);
        let make_client = |script: Vec<Option<SessionEvent>>| ScriptedClient {
            files: files(),
            script,
            stops: Arc::new(Mutex::new(Vec::new())),
            configs: Arc::new(Mutex::new(Vec::new())),
        };

        // 第一轮：a.txt 完成后挂起并暂停
        let token = TaskToken::new();
        let t2 = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            t2.pause();
        });
        let first = fetcher(
            &fx,
            make_client(vec![
                Some(SessionEvent::Metadata(two_file_meta())),
                Some(SessionEvent::PieceCompleted {
                    index: 0,
                    downloaded_bytes: 4,
                }),
                Some(SessionEvent::PieceCompleted {
                    index: 1,
                    downloaded_bytes: 8,
                }),
                None,
            ]),
        )
        .download(
            &fx.task.id,
            &source(),
            1,
            &fx.scratch,
            "/bt",
            &TorrentOptions::default(),
            &token,
        )
        .await;
        assert!(matches!(first, Err(DownloadError::Paused)));

        // 第二轮：新会话重新报告全部分片
        let result = fetcher(
            &fx,
            make_client(vec![
                Some(SessionEvent::Metadata(two_file_meta())),
                Some(SessionEvent::Finished),
            ]),
        )
        .download(
            &fx.task.id,
            &source(),
            1,
            &fx.scratch,
            "/bt",
            &TorrentOptions::default(),
            &TaskToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.success_files.len(), 2);
        let links = fx
            .db
            .with_repos(|r| r.user_files().list_by_user(1, 0, 100))
            .unwrap();
        assert_eq!(links.len(), 2);
    }

    #[tokio::test]
    async fn test_session_error_fails() {
        let fx = fixture(0);
        let client = ScriptedClient {
            files: vec![],
            script: vec![Some(SessionEvent::Error("no peers".to_string()))],
            stops: Arc::new(Mutex::new(Vec::new())),
            configs: Arc::new(Mutex::new(Vec::new())),
        };
        let err = fetcher(&fx, client)
            .download(
                &fx.task.id,
                &source(),
                1,
                &fx.scratch,
                "/bt",
                &TorrentOptions::default(),
                &TaskToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NetworkFatal);
    }
}
