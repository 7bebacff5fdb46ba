//! 交互登录：可见浏览器中恢复或等待手动登录，然后监视用户浏览的作品页，
//! 直到用户点击“下载”（地址变为 `.../download`）。

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use super::guard::BrowserGuard;
use super::{is_manga_page, manga_url_from_trigger};
use crate::base_system::context::Config;
use crate::download::progress::{EventSink, PipelineEvent};
use crate::network_parser::manifest::MetadataFetcher;
use crate::session::store::{SessionError, SessionStore};
use crate::session::{DownloadTrigger, LoginFlow, ManifestHints, Session};

const RESTORE_SETTLE: Duration = Duration::from_secs(3);
const LOGIN_POLL: Duration = Duration::from_secs(1);
const PAGE_POLL: Duration = Duration::from_millis(500);

/// 把作品页上的“关注”按钮改成跳转到 `/download` 的下载按钮。
const DOWNLOAD_BUTTON_JS: &str = r#"(() => {
  const btn = document.querySelector('a.page__btn-track.js-follow-status');
  if (!btn || btn.dataset.comxDownload) { return false; }
  btn.dataset.comxDownload = '1';
  btn.textContent = '⬇️ Скачать';
  btn.style.backgroundColor = '#28a745';
  btn.style.color = '#fff';
  btn.style.fontWeight = 'bold';
  btn.style.padding = '10px 20px';
  btn.style.borderRadius = '5px';
  btn.style.cursor = 'pointer';
  btn.onclick = (e) => {
    e.preventDefault();
    window.location.href = window.location.href.replace(/\/$/, '') + '/download';
  };
  return true;
})()"#;

pub struct ChromiumLogin {
    cfg: Config,
    store: SessionStore,
    events: EventSink,
    preview: MetadataFetcher,
    browser: Option<BrowserGuard>,
    session: Option<Session>,
}

impl ChromiumLogin {
    pub fn new(cfg: &Config, events: EventSink) -> Result<Self> {
        Ok(Self {
            cfg: cfg.clone(),
            store: SessionStore::new(cfg.cookie_path()),
            events,
            preview: MetadataFetcher::new(cfg)?,
            browser: None,
            session: None,
        })
    }

    fn browser(&mut self) -> Result<&BrowserGuard> {
        if self.browser.is_none() {
            let guard = BrowserGuard::launch(&self.cfg, false)?;
            guard.goto(self.cfg.base_url())?;
            self.browser = Some(guard);
        }
        match &self.browser {
            Some(b) => Ok(b),
            None => bail!("browser not started"),
        }
    }

    /// 关闭浏览器窗口。
    pub fn close(&mut self) {
        self.browser = None;
    }

    fn try_restore(&mut self) -> Result<Option<Session>> {
        let saved = match self.store.load() {
            Ok(saved) if !saved.is_empty() => saved,
            Ok(_) | Err(SessionError::NotFound(_)) => return Ok(None),
            Err(e) => {
                warn!(target: "session", "cookies 文件不可用: {}", e);
                return Ok(None);
            }
        };

        info!(target: "session", "尝试恢复已保存的会话");
        let browser = self.browser()?;
        browser.restore(&saved);
        browser.reload()?;
        thread::sleep(RESTORE_SETTLE);

        let current = browser.cookies()?;
        if current.is_authenticated() {
            info!(target: "session", "会话已恢复");
            return Ok(Some(current));
        }
        warn!(target: "session", "会话已过期，需要重新登录");
        Ok(None)
    }

    fn preview_page(&self, url: &str, session: &Session) -> Option<ManifestHints> {
        match self.preview.fetch(url, session) {
            Ok(manifest) => {
                info!(target: "browser", "发现章节: {}", manifest.chapters.len());
                self.events.emit(PipelineEvent::ChaptersDiscovered {
                    total: manifest.chapters.len(),
                    title: manifest.title.clone(),
                    url: url.to_string(),
                });
                Some(ManifestHints {
                    title: Some(manifest.title),
                    total_chapters: Some(manifest.chapters.len()),
                })
            }
            Err(e) => {
                warn!(target: "browser", "获取作品信息失败: {}", e);
                None
            }
        }
    }
}

impl LoginFlow for ChromiumLogin {
    fn wait_for_authenticated_session(&mut self, cancel: &Arc<AtomicBool>) -> Result<Session> {
        if let Some(session) = self.try_restore()? {
            self.session = Some(session.clone());
            return Ok(session);
        }

        info!(target: "session", "请在浏览器中手动登录，登录后会自动保存 cookies");
        self.events.log("请在浏览器中登录");
        let session = loop {
            if cancel.load(Ordering::Relaxed) {
                self.close();
                bail!("login cancelled");
            }
            let current = self.browser()?.cookies()?;
            if current.is_authenticated() {
                break current;
            }
            thread::sleep(LOGIN_POLL);
        };

        if let Err(e) = self.store.save(&session) {
            warn!(target: "session", "保存 cookies 失败: {}", e);
        }
        self.session = Some(session.clone());
        Ok(session)
    }

    fn wait_for_download_trigger(&mut self, cancel: &Arc<AtomicBool>) -> Result<DownloadTrigger> {
        info!(target: "browser", "等待打开作品页并点击下载…");
        let session = match &self.session {
            Some(s) => s.clone(),
            None => self.browser()?.cookies()?,
        };

        let mut processed: HashSet<String> = HashSet::new();
        let mut hints = ManifestHints::default();

        loop {
            if cancel.load(Ordering::Relaxed) {
                self.close();
                bail!("monitoring cancelled");
            }

            let current = self.browser()?.current_url()?.unwrap_or_default();
            if let Some(url) = manga_url_from_trigger(&current) {
                info!(target: "browser", "开始下载作品: {}", url);
                self.close();
                return Ok(DownloadTrigger { url, hints });
            }

            if is_manga_page(&current) && !processed.contains(&current) {
                info!(target: "browser", "发现作品页: {}", current);
                if let Some(found) = self.preview_page(&current, &session) {
                    hints = found;
                    processed.insert(current.clone());
                }
                match self.browser()?.run_script(DOWNLOAD_BUTTON_JS) {
                    Ok(()) => debug!(target: "browser", "下载按钮已就绪"),
                    Err(e) => warn!(target: "browser", "未找到按钮: {}", e),
                }
            }

            thread::sleep(PAGE_POLL);
        }
    }
}
