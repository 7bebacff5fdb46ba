//! 单次运行的状态机：会话 → 目录 → 逐章下载 → 合并 CBZ。
//!
//! `Idle → Authenticating → FetchingMetadata → Downloading → Archiving →
//! {Completed | PartiallyCompleted | Cancelled | Failed}`

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::fetcher::ChapterFetcher;
use super::models::{DownloadRange, Manifest, RunOutcome, RunState};
use super::orchestrator::DownloadOrchestrator;
use super::progress::{EventSink, PipelineEvent};
use crate::archive::builder::{ArchiveBuilder, ArchiveError};
use crate::base_system::config::ConfigError;
use crate::base_system::context::{Config, safe_fs_name};
use crate::base_system::workspace::Workspace;
use crate::network_parser::manifest::{ManifestError, MetadataFetcher};
use crate::session::Session;
use crate::session::store::{SessionError, SessionStore};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no usable session: {0}")]
    Auth(#[source] SessionError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("unsafe working directories: {0}")]
    UnsafeWorkspace(#[source] ConfigError),
    #[error("cannot prepare working directories: {0}")]
    Workspace(#[source] io::Error),
    #[error("cannot set up download clients: {0}")]
    Setup(String),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// 作品目录来源。
pub trait ManifestSource: Send {
    fn fetch(&self, url: &str, session: &Session) -> Result<Manifest, ManifestError>;
}

impl ManifestSource for MetadataFetcher {
    fn fetch(&self, url: &str, session: &Session) -> Result<Manifest, ManifestError> {
        MetadataFetcher::fetch(self, url, session)
    }
}

/// 拿到作品地址（即 referer）后再构造下载链。
pub type FetcherFactory = Box<dyn FnMut(&str) -> anyhow::Result<ChapterFetcher> + Send>;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub url: String,
    pub range: Option<DownloadRange>,
    /// 调用方已持有的会话；为空时从 cookies 文件载入。
    pub session: Option<Session>,
}

pub struct DownloadPipeline {
    cfg: Config,
    store: SessionStore,
    metadata: Box<dyn ManifestSource>,
    make_fetcher: FetcherFactory,
    events: EventSink,
    cancel: Arc<AtomicBool>,
    state: RunState,
    session: Option<Session>,
}

impl DownloadPipeline {
    /// 使用真实网络客户端的标准装配。
    pub fn new(cfg: &Config, events: EventSink, cancel: Arc<AtomicBool>) -> anyhow::Result<Self> {
        let store = SessionStore::new(cfg.cookie_path());
        let metadata = MetadataFetcher::new(cfg)?;
        let factory_cfg = cfg.clone();
        let factory_store = store.clone();
        let make_fetcher: FetcherFactory = Box::new(move |referer: &str| {
            ChapterFetcher::standard(&factory_cfg, referer, &factory_store)
        });
        Ok(Self::with_parts(
            cfg.clone(),
            store,
            Box::new(metadata),
            make_fetcher,
            events,
            cancel,
        ))
    }

    pub fn with_parts(
        cfg: Config,
        store: SessionStore,
        metadata: Box<dyn ManifestSource>,
        make_fetcher: FetcherFactory,
        events: EventSink,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cfg,
            store,
            metadata,
            make_fetcher,
            events,
            cancel,
            state: RunState::Idle,
            session: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// 最近一次运行结束时的会话（可能已被刷新）。
    #[cfg(test)]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    fn transition(&mut self, next: RunState) {
        info!(target: "download", "状态: {:?} → {:?}", self.state, next);
        self.state = next;
        self.events.state(next);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// 执行一次完整运行，总是以终态结束并发出完成事件。
    pub fn run(&mut self, req: RunRequest) -> RunOutcome {
        self.state = RunState::Idle;
        let outcome = match self.run_inner(req) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(target: "download", "运行失败: {}", e);
                RunOutcome::failed(e, Default::default())
            }
        };
        self.transition(outcome.state);
        self.events.log(match &outcome.error {
            Some(err) => format!("下载结束: {:?} ({err})", outcome.state),
            None => format!("下载结束: {:?}", outcome.state),
        });
        self.events.emit(PipelineEvent::Finished(outcome.clone()));
        outcome
    }

    fn run_inner(&mut self, req: RunRequest) -> Result<RunOutcome, PipelineError> {
        // 工作目录会被整体删除，先确认不会波及用户数据
        self.cfg
            .check_workspace()
            .map_err(PipelineError::UnsafeWorkspace)?;

        self.transition(RunState::Authenticating);
        debug!(target: "session", "cookies 文件: {}", self.store.path().display());
        let session = self.store.resolve(req.session).map_err(PipelineError::Auth)?;
        if !session.is_authenticated() {
            warn!(target: "session", "会话缺少登录令牌，仍尝试继续");
        }
        self.session = Some(session.clone());

        if self.cancelled() {
            return Ok(RunOutcome::cancelled(Default::default()));
        }
        self.transition(RunState::FetchingMetadata);
        let manifest = self.metadata.fetch(&req.url, &session)?;

        if self.cancelled() {
            return Ok(RunOutcome::cancelled(Default::default()));
        }
        let workspace = Workspace::acquire(self.cfg.download_path(), self.cfg.temp_path())
            .map_err(PipelineError::Workspace)?;

        self.transition(RunState::Downloading);
        self.events
            .log(format!("开始下载: {} ({} 章)", manifest.title, manifest.chapters.len()));
        let mut fetcher =
            (self.make_fetcher)(&req.url).map_err(|e| PipelineError::Setup(e.to_string()))?;
        let report = DownloadOrchestrator::new(
            &mut fetcher,
            workspace.download_dir(),
            self.cfg.request_delay(),
            self.events.clone(),
            self.cancel.clone(),
        )
        .run(&manifest, req.range, &req.url, session);
        self.session = Some(report.session.clone());

        if report.cancelled {
            workspace.release();
            return Ok(RunOutcome {
                chapters_total: report.selected,
                ..RunOutcome::cancelled(report.failures)
            });
        }

        self.transition(RunState::Archiving);
        let output = self.output_path(&manifest.title);
        let built = ArchiveBuilder::new(workspace.scratch_dir())
            .with_cancel(self.cancel.clone())
            .build(&report.archives, &output);
        workspace.release();

        let outcome = match built {
            Ok(merged) => {
                let state = if report.failures.is_empty() {
                    RunState::Completed
                } else {
                    RunState::PartiallyCompleted
                };
                for skipped in &merged.skipped {
                    warn!(target: "archive", "章节包无法读取，已跳过: {}", skipped.display());
                }
                info!(
                    target: "archive",
                    "CBZ 已生成: {} ({}/{} 章)",
                    merged.output.display(),
                    merged.chapters_merged,
                    merged.chapters_total
                );
                RunOutcome {
                    state,
                    output: Some(merged.output),
                    failures: report.failures,
                    pages: merged.pages,
                    chapters_ok: merged.chapters_merged,
                    chapters_total: report.selected,
                    error: None,
                }
            }
            Err(ArchiveError::Cancelled) => RunOutcome {
                chapters_total: report.selected,
                ..RunOutcome::cancelled(report.failures)
            },
            Err(e) => {
                error!(target: "archive", "打包失败: {}", e);
                RunOutcome {
                    chapters_total: report.selected,
                    ..RunOutcome::failed(PipelineError::Archive(e), report.failures)
                }
            }
        };
        Ok(outcome)
    }

    fn output_path(&self, title: &str) -> PathBuf {
        self.cfg
            .default_save_dir()
            .join(format!("{}.cbz", safe_fs_name(title, 150)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::orchestrator::tests::{FakeSite, manifest};
    use crate::download::progress::{PipelineEvent, event_channel};
    use crate::session::SessionToken;
    use std::fs::File;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FixedManifest {
        result: Mutex<Option<Result<Manifest, ManifestError>>>,
        calls: Arc<Mutex<usize>>,
    }

    impl ManifestSource for FixedManifest {
        fn fetch(&self, _url: &str, _session: &Session) -> Result<Manifest, ManifestError> {
            *self.calls.lock().unwrap() += 1;
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(ManifestError::ManifestNotFound))
        }
    }

    struct Harness {
        root: tempfile::TempDir,
        cfg: Config,
        manifest_calls: Arc<Mutex<usize>>,
    }

    impl Harness {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let cfg = Config {
                request_delay_ms: 0,
                strategy_pause_ms: 0,
                save_path: root.path().join("out").to_string_lossy().into_owned(),
                ..Config::default()
            }
            .with_data_dir(Some(root.path()));
            Self {
                root,
                cfg,
                manifest_calls: Arc::default(),
            }
        }

        fn pipeline(
            &self,
            manifest: Result<Manifest, ManifestError>,
            site: FakeSite,
            cancel: Arc<AtomicBool>,
        ) -> (DownloadPipeline, crossbeam_channel::Receiver<PipelineEvent>) {
            let (sink, rx) = event_channel();
            let source = FixedManifest {
                result: Mutex::new(Some(manifest)),
                calls: self.manifest_calls.clone(),
            };
            let mut site = Some(site);
            let factory: FetcherFactory = Box::new(move |_referer: &str| {
                let site = site.take().ok_or_else(|| anyhow::anyhow!("used twice"))?;
                Ok(ChapterFetcher::new(vec![Box::new(site)], Duration::ZERO))
            });
            let pipeline = DownloadPipeline::with_parts(
                self.cfg.clone(),
                SessionStore::new(self.cfg.cookie_path()),
                Box::new(source),
                factory,
                sink,
                cancel,
            );
            (pipeline, rx)
        }

        fn request(&self) -> RunRequest {
            RunRequest {
                url: "https://com-x.life/77-berserk.html".to_string(),
                range: None,
                session: Some(Session::new([
                    SessionToken::new("dle_user_id", "1"),
                    SessionToken::new("dle_password", "p"),
                ])),
            }
        }

        fn output(&self) -> PathBuf {
            self.root.path().join("out").join("Berserk.cbz")
        }

        fn workspace_gone(&self) -> bool {
            !self.cfg.download_path().exists() && !self.cfg.temp_path().exists()
        }
    }

    fn entry_names(path: &Path) -> Vec<String> {
        let zip = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    #[test]
    fn one_failed_chapter_yields_partial_archive() {
        let h = Harness::new();
        let (mut pipeline, rx) =
            h.pipeline(Ok(manifest(3)), FakeSite::new(&["c2"]), Arc::default());

        let outcome = pipeline.run(h.request());

        assert_eq!(outcome.state, RunState::PartiallyCompleted);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures.entries()[0].seq, 2);
        assert_eq!(outcome.pages, 4);
        assert_eq!((outcome.chapters_ok, outcome.chapters_total), (2, 3));
        assert_eq!(outcome.output.as_deref(), Some(h.output().as_path()));
        assert_eq!(
            entry_names(&h.output()),
            ["000001.jpg", "000002.jpg", "000003.jpg", "000004.jpg"]
        );
        assert!(h.workspace_gone());
        assert_eq!(pipeline.state(), RunState::PartiallyCompleted);

        let states: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                PipelineEvent::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                RunState::Authenticating,
                RunState::FetchingMetadata,
                RunState::Downloading,
                RunState::Archiving,
                RunState::PartiallyCompleted,
            ]
        );
    }

    #[test]
    fn all_chapters_ok_is_completed() {
        let h = Harness::new();
        let (mut pipeline, rx) = h.pipeline(Ok(manifest(2)), FakeSite::new(&[]), Arc::default());
        let outcome = pipeline.run(h.request());
        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.pages, 4);
        assert!(matches!(
            rx.try_iter().last(),
            Some(PipelineEvent::Finished(o)) if o.state == RunState::Completed
        ));
    }

    #[test]
    fn empty_manifest_fails_with_no_content_and_no_output() {
        let h = Harness::new();
        let (mut pipeline, _rx) =
            h.pipeline(Ok(manifest(0)), FakeSite::new(&[]), Arc::default());

        let outcome = pipeline.run(h.request());

        assert_eq!(outcome.state, RunState::Failed);
        assert!(outcome.error.unwrap().contains("no pages"));
        assert!(outcome.output.is_none());
        assert!(!h.output().exists());
        assert!(h.workspace_gone());
    }

    #[test]
    fn cancel_during_first_chapter_skips_the_rest_and_archiving() {
        let h = Harness::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let mut site = FakeSite::new(&[]);
        site.cancel_after = Some(("c1".to_string(), cancel.clone()));
        let visited = site.visited.clone();
        let (mut pipeline, _rx) = h.pipeline(Ok(manifest(3)), site, cancel);

        let outcome = pipeline.run(h.request());

        assert_eq!(outcome.state, RunState::Cancelled);
        assert_eq!(*visited.lock().unwrap(), vec!["c1"]);
        assert!(outcome.output.is_none());
        assert!(!h.output().exists());
        assert!(h.workspace_gone());
    }

    #[test]
    fn missing_session_aborts_before_any_fetch() {
        let h = Harness::new();
        let (mut pipeline, _rx) =
            h.pipeline(Ok(manifest(2)), FakeSite::new(&[]), Arc::default());
        let req = RunRequest {
            session: None,
            ..h.request()
        };

        let outcome = pipeline.run(req);

        assert_eq!(outcome.state, RunState::Failed);
        assert!(outcome.error.unwrap().contains("no usable session"));
        assert_eq!(*h.manifest_calls.lock().unwrap(), 0);
    }

    #[test]
    fn manifest_error_is_fatal() {
        let h = Harness::new();
        let (mut pipeline, _rx) = h.pipeline(
            Err(ManifestError::ParentIdMissing),
            FakeSite::new(&[]),
            Arc::default(),
        );
        let outcome = pipeline.run(h.request());
        assert_eq!(outcome.state, RunState::Failed);
        assert!(!h.output().exists());
    }

    #[test]
    fn workspace_covering_the_data_dir_is_refused_before_any_deletion() {
        let mut h = Harness::new();
        h.cfg.download_dir = ".".to_string();
        let cookies = h.cfg.cookie_path();
        let config_file = h.root.path().join("config.yml");
        std::fs::write(&cookies, b"[]").unwrap();
        std::fs::write(&config_file, b"base_url: x").unwrap();

        let (mut pipeline, _rx) = h.pipeline(Ok(manifest(1)), FakeSite::new(&[]), Arc::default());
        let outcome = pipeline.run(h.request());

        assert_eq!(outcome.state, RunState::Failed);
        assert!(outcome.error.unwrap().contains("unsafe working directories"));
        assert!(cookies.exists());
        assert!(config_file.exists());
        assert_eq!(*h.manifest_calls.lock().unwrap(), 0);
    }

    #[test]
    fn save_path_inside_download_dir_is_refused() {
        let mut h = Harness::new();
        h.cfg.save_path = h.cfg.download_path().to_string_lossy().into_owned();
        let (mut pipeline, _rx) = h.pipeline(Ok(manifest(1)), FakeSite::new(&[]), Arc::default());

        let outcome = pipeline.run(h.request());

        assert_eq!(outcome.state, RunState::Failed);
        assert!(outcome.output.is_none());
        assert!(!h.cfg.download_path().join("Berserk.cbz").exists());
    }

    #[test]
    fn final_session_is_available_after_the_run() {
        let h = Harness::new();
        let (mut pipeline, _rx) = h.pipeline(Ok(manifest(1)), FakeSite::new(&[]), Arc::default());
        pipeline.run(h.request());
        assert_eq!(pipeline.session().and_then(|s| s.get("dle_password")), Some("p"));
    }

    #[test]
    fn stale_workspace_from_previous_run_is_purged() {
        let h = Harness::new();
        std::fs::create_dir_all(h.cfg.download_path()).unwrap();
        std::fs::write(h.cfg.download_path().join("9999_stale.zip"), b"old").unwrap();

        let (mut pipeline, _rx) = h.pipeline(Ok(manifest(1)), FakeSite::new(&[]), Arc::default());
        let outcome = pipeline.run(h.request());

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(entry_names(&h.output()), ["000001.jpg", "000002.jpg"]);
        assert!(h.workspace_gone());
    }
}
