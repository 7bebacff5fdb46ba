use std::thread;

use anyhow::{Result, bail};
use tracing::info;

use super::guard::BrowserGuard;
use crate::base_system::context::Config;
use crate::session::{Session, SessionRefresher};

/// 打开站点首页、写入当前令牌、刷新页面并等待，再读回浏览器中的全部 cookies。
/// 每次刷新都启动独立的浏览器进程，返回前关闭。
pub struct ChromiumRefresher {
    cfg: Config,
}

impl ChromiumRefresher {
    pub fn new(cfg: &Config) -> Self {
        Self { cfg: cfg.clone() }
    }
}

impl SessionRefresher for ChromiumRefresher {
    fn refresh(&mut self, session: &Session) -> Result<Session> {
        info!(target: "browser", "通过浏览器恢复会话");
        let browser = BrowserGuard::launch(&self.cfg, self.cfg.headless_recovery)?;
        browser.goto(self.cfg.base_url())?;

        let restored = browser.restore(session);
        info!(target: "browser", "已写入 {}/{} 个 cookies", restored, session.len());

        browser.reload()?;
        thread::sleep(self.cfg.recovery_settle());

        let fresh = browser.cookies()?;
        if fresh.is_empty() {
            bail!("browser returned no cookies");
        }
        info!(target: "browser", "浏览器返回 {} 个 cookies", fresh.len());
        Ok(fresh)
    }
}
