//! 按阅读顺序逐章下载（严格串行），收集成功的压缩包与失败记录。

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use super::fetcher::ChapterFetcher;
use super::models::{
    ChapterArchive, DownloadRange, FailureLog, Manifest, chapter_file_name, select_chapters,
};
use super::progress::{EventSink, PipelineEvent};
use super::strategy::ChapterRequest;
use crate::session::Session;

#[derive(Debug)]
pub struct DownloadReport {
    pub archives: Vec<ChapterArchive>,
    pub failures: FailureLog,
    pub selected: usize,
    /// 运行结束时的会话（可能已被恢复策略替换）。
    pub session: Session,
    pub cancelled: bool,
}

pub struct DownloadOrchestrator<'a> {
    fetcher: &'a mut ChapterFetcher,
    download_dir: &'a Path,
    delay: Duration,
    events: EventSink,
    cancel: Arc<AtomicBool>,
}

impl<'a> DownloadOrchestrator<'a> {
    pub fn new(
        fetcher: &'a mut ChapterFetcher,
        download_dir: &'a Path,
        delay: Duration,
        events: EventSink,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            fetcher,
            download_dir,
            delay,
            events,
            cancel,
        }
    }

    pub fn run(
        &mut self,
        manifest: &Manifest,
        range: Option<DownloadRange>,
        referer: &str,
        mut session: Session,
    ) -> DownloadReport {
        let selected = select_chapters(&manifest.chapters, range);
        let total = selected.len();
        info!(target: "download", "下载章节: {} 章（共 {} 章）", total, manifest.chapters.len());
        self.events.emit(PipelineEvent::DownloadStarted {
            title: manifest.title.clone(),
            total,
        });

        let mut archives = Vec::with_capacity(total);
        let mut failures = FailureLog::default();

        for (idx, chapter) in selected.iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                info!(target: "download", "收到停止信号，结束任务");
                return DownloadReport {
                    archives,
                    failures,
                    selected: total,
                    session,
                    cancelled: true,
                };
            }

            let file_name = chapter_file_name(chapter.ordinal, &chapter.title);
            let dest = self.download_dir.join(&file_name);
            info!(target: "download", "[{}/{}] {}", idx + 1, total, chapter.title);

            let req = ChapterRequest {
                chapter_id: &chapter.id,
                parent_id: &manifest.parent_id,
                title: &chapter.title,
                referer,
            };
            let outcome = self.fetcher.fetch(&req, &session);
            if let Some(fresh) = outcome.refreshed {
                info!(target: "session", "后续章节改用刷新后的会话");
                session = fresh;
            }

            let ok = match outcome.payload {
                Ok(bytes) => match fs::write(&dest, &bytes) {
                    Ok(()) => {
                        info!(target: "download", "已保存: {}", file_name);
                        archives.push(ChapterArchive {
                            seq: chapter.ordinal,
                            title: chapter.title.clone(),
                            path: dest,
                        });
                        true
                    }
                    Err(e) => {
                        warn!(target: "download", "写入 {} 失败: {}", dest.display(), e);
                        failures.record(chapter.ordinal, &chapter.title);
                        false
                    }
                },
                Err(e) => {
                    warn!(target: "download", "{}", e);
                    failures.record(chapter.ordinal, &chapter.title);
                    false
                }
            };

            self.events.emit(PipelineEvent::ChapterProgress {
                done: idx + 1,
                total,
                title: chapter.title.clone(),
                ok,
            });

            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
        }

        if !failures.is_empty() {
            warn!(target: "download", "下载失败的章节: {}", failures.len());
            for failed in failures.entries() {
                warn!(target: "download", "  - {}", failed);
            }
        }

        DownloadReport {
            archives,
            failures,
            selected: total,
            session,
            cancelled: false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::download::models::ChapterRef;
    use crate::download::progress::event_channel;
    use crate::download::strategy::{FetchStrategy, StrategyFailure};
    use crate::session::SessionToken;
    use std::collections::HashSet;
    use std::io::Write;
    use std::sync::Mutex;

    pub(crate) fn zip_with(pages: &[&str]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            for page in pages {
                zip.start_file(*page, zip::write::FileOptions::default())
                    .unwrap();
                zip.write_all(page.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    /// 按章节 ID 决定成败的假站点；可在某章下载后触发取消。
    pub(crate) struct FakeSite {
        pub failing: HashSet<String>,
        pub visited: Arc<Mutex<Vec<String>>>,
        pub cancel_after: Option<(String, Arc<AtomicBool>)>,
        pub pages_per_chapter: usize,
    }

    impl FakeSite {
        pub(crate) fn new(failing: &[&str]) -> Self {
            Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                visited: Arc::default(),
                cancel_after: None,
                pages_per_chapter: 2,
            }
        }
    }

    impl FetchStrategy for FakeSite {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn attempt(
            &mut self,
            req: &ChapterRequest<'_>,
            _session: &Session,
        ) -> Result<Vec<u8>, StrategyFailure> {
            self.visited.lock().unwrap().push(req.chapter_id.to_string());
            if let Some((id, flag)) = &self.cancel_after {
                if id == req.chapter_id {
                    flag.store(true, Ordering::Relaxed);
                }
            }
            if self.failing.contains(req.chapter_id) {
                return Err(StrategyFailure::Status(503));
            }
            let names: Vec<String> = (1..=self.pages_per_chapter)
                .map(|p| format!("{p:02}.jpg"))
                .collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            Ok(zip_with(&refs))
        }
    }

    pub(crate) fn manifest(n: usize) -> Manifest {
        Manifest {
            title: "Berserk".to_string(),
            parent_id: "77".to_string(),
            chapters: (1..=n)
                .map(|i| ChapterRef {
                    id: format!("c{i}"),
                    title: format!("Ch {i}"),
                    ordinal: i,
                })
                .collect(),
        }
    }

    fn run_with(
        site: FakeSite,
        manifest: &Manifest,
        range: Option<DownloadRange>,
        cancel: Arc<AtomicBool>,
        dir: &Path,
    ) -> DownloadReport {
        let mut fetcher = ChapterFetcher::new(vec![Box::new(site)], Duration::ZERO);
        let (sink, _rx) = event_channel();
        DownloadOrchestrator::new(&mut fetcher, dir, Duration::ZERO, sink, cancel).run(
            manifest,
            range,
            "https://com-x.life/77-berserk.html",
            Session::new([SessionToken::new("dle_user_id", "1")]),
        )
    }

    #[test]
    fn full_range_visits_every_chapter_once_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let site = FakeSite::new(&[]);
        let visited = site.visited.clone();
        let report = run_with(site, &manifest(4), None, Arc::default(), dir.path());

        assert_eq!(*visited.lock().unwrap(), vec!["c1", "c2", "c3", "c4"]);
        assert_eq!(report.archives.len(), 4);
        assert!(report.failures.is_empty());
        assert!(!report.cancelled);
        assert!(dir.path().join("0001_Ch 1.zip").exists());
    }

    #[test]
    fn sub_range_attempts_exactly_the_selected_chapters() {
        let dir = tempfile::tempdir().unwrap();
        let site = FakeSite::new(&[]);
        let visited = site.visited.clone();
        let report = run_with(
            site,
            &manifest(10),
            Some(DownloadRange::new(3, 5)),
            Arc::default(),
            dir.path(),
        );

        assert_eq!(*visited.lock().unwrap(), vec!["c3", "c4", "c5"]);
        let seqs: Vec<_> = report.archives.iter().map(|a| a.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(report.selected, 3);
    }

    #[test]
    fn failed_chapter_is_recorded_and_run_continues() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_with(
            FakeSite::new(&["c2"]),
            &manifest(3),
            None,
            Arc::default(),
            dir.path(),
        );

        let seqs: Vec<_> = report.archives.iter().map(|a| a.seq).collect();
        assert_eq!(seqs, vec![1, 3]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures.entries()[0].seq, 2);
        assert_eq!(report.failures.entries()[0].title, "Ch 2");
    }

    #[test]
    fn cancellation_stops_before_the_next_chapter() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let mut site = FakeSite::new(&[]);
        site.cancel_after = Some(("c1".to_string(), cancel.clone()));
        let visited = site.visited.clone();

        let report = run_with(site, &manifest(3), None, cancel, dir.path());

        assert!(report.cancelled);
        assert_eq!(*visited.lock().unwrap(), vec!["c1"]);
        assert_eq!(report.archives.len(), 1);
    }

    /// 第一章时换出新会话，记录每章收到的 `dle_password`。
    struct RotatingSession {
        seen: Arc<Mutex<Vec<String>>>,
        pending: Option<Session>,
    }

    impl FetchStrategy for RotatingSession {
        fn name(&self) -> &'static str {
            "rotating"
        }

        fn attempt(
            &mut self,
            req: &ChapterRequest<'_>,
            session: &Session,
        ) -> Result<Vec<u8>, StrategyFailure> {
            let password = session.get("dle_password").unwrap_or_default().to_string();
            self.seen.lock().unwrap().push(password);
            if req.chapter_id == "c1" {
                self.pending = Some(Session::new([
                    SessionToken::new("dle_user_id", "1"),
                    SessionToken::new("dle_password", "fresh"),
                ]));
            }
            Ok(zip_with(&["01.jpg"]))
        }

        fn take_refreshed(&mut self) -> Option<Session> {
            self.pending.take()
        }
    }

    #[test]
    fn refreshed_session_replaces_the_old_one_for_later_chapters() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let strategy = RotatingSession {
            seen: seen.clone(),
            pending: None,
        };
        let mut fetcher = ChapterFetcher::new(vec![Box::new(strategy)], Duration::ZERO);
        let (sink, _rx) = event_channel();
        let stale = Session::new([
            SessionToken::new("dle_user_id", "1"),
            SessionToken::new("dle_password", "stale"),
        ]);

        let report =
            DownloadOrchestrator::new(&mut fetcher, dir.path(), Duration::ZERO, sink, Arc::default())
                .run(&manifest(3), None, "https://x/", stale);

        assert_eq!(*seen.lock().unwrap(), vec!["stale", "fresh", "fresh"]);
        assert_eq!(report.session.get("dle_password"), Some("fresh"));
        assert_eq!(report.archives.len(), 3);
    }

    #[test]
    fn progress_events_follow_each_chapter() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher =
            ChapterFetcher::new(vec![Box::new(FakeSite::new(&["c2"]))], Duration::ZERO);
        let (sink, rx) = event_channel();
        DownloadOrchestrator::new(&mut fetcher, dir.path(), Duration::ZERO, sink, Arc::default())
            .run(&manifest(2), None, "https://x/", Session::default());

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                PipelineEvent::DownloadStarted {
                    title: "Berserk".into(),
                    total: 2
                },
                PipelineEvent::ChapterProgress {
                    done: 1,
                    total: 2,
                    title: "Ch 1".into(),
                    ok: true
                },
                PipelineEvent::ChapterProgress {
                    done: 2,
                    total: 2,
                    title: "Ch 2".into(),
                    ok: false
                },
            ]
        );
    }
}
