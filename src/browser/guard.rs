//! 浏览器进程句柄。自带一个小型 tokio 运行时，对外只暴露阻塞接口；
//! 析构时关闭浏览器并等待进程退出，出错路径上同样生效。

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{cookie_domain, find_chromium};
use crate::base_system::context::Config;
use crate::session::{Session, SessionToken};

const NAV_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) struct BrowserGuard {
    // 析构顺序：先关闭浏览器，再丢弃运行时
    browser: Option<Browser>,
    page: Page,
    handler: Option<JoinHandle<()>>,
    rt: Runtime,
    cookie_domain: Option<String>,
}

impl BrowserGuard {
    pub(crate) fn launch(cfg: &Config, headless: bool) -> Result<Self> {
        let chrome_path = find_chromium(cfg)
            .context("未找到 Chrome/Chromium，可在 config.yml 的 browser_path 中指定")?;
        info!(target: "browser", "启动浏览器: {}", chrome_path.display());

        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .context("failed to build browser runtime")?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg(format!("--user-agent={}", cfg.user_agent))
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions");
        if headless {
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|e| anyhow!("failed to build browser config: {e}"))?;

        let (browser, page, handler) = rt.block_on(async {
            let (browser, mut handler) = Browser::launch(config)
                .await
                .context("failed to launch Chromium")?;
            let handler = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    let _ = event;
                }
            });
            let page = browser
                .new_page("about:blank")
                .await
                .context("failed to create new page")?;
            anyhow::Ok((browser, page, handler))
        })?;

        Ok(Self {
            browser: Some(browser),
            page,
            handler: Some(handler),
            rt,
            cookie_domain: cookie_domain(&cfg.base_url),
        })
    }

    pub(crate) fn goto(&self, url: &str) -> Result<()> {
        debug!(target: "browser", "打开页面: {}", url);
        self.rt.block_on(async {
            tokio::time::timeout(NAV_TIMEOUT, self.page.goto(url))
                .await
                .map_err(|_| anyhow!("navigation to {url} timed out"))?
                .with_context(|| format!("navigation to {url} failed"))?;
            anyhow::Ok(())
        })
    }

    pub(crate) fn reload(&self) -> Result<()> {
        self.rt.block_on(async {
            tokio::time::timeout(NAV_TIMEOUT, self.page.reload())
                .await
                .map_err(|_| anyhow!("page reload timed out"))?
                .context("page reload failed")?;
            anyhow::Ok(())
        })
    }

    /// 逐个写入令牌（只带名称、值与站点域，不带 secure/httpOnly/sameSite 标记）；
    /// 单个失败只记录警告，返回成功写入的数量。
    pub(crate) fn restore(&self, session: &Session) -> usize {
        let mut restored = 0;
        for token in session.tokens() {
            let mut param = CookieParam::builder()
                .name(token.name.clone())
                .value(token.value.clone())
                .path("/");
            if let Some(domain) = &self.cookie_domain {
                param = param.domain(domain.clone());
            }
            let result = param
                .build()
                .map_err(|e| anyhow!(e))
                .and_then(|cookie| {
                    self.rt.block_on(async {
                        self.page
                            .set_cookies(vec![cookie])
                            .await
                            .map_err(|e| anyhow!(e))?;
                        anyhow::Ok(())
                    })
                });
            match result {
                Ok(()) => restored += 1,
                Err(e) => warn!(target: "browser", "Cookie {} 未写入: {}", token.name, e),
            }
        }
        restored
    }

    pub(crate) fn cookies(&self) -> Result<Session> {
        let cookies = self
            .rt
            .block_on(self.page.get_cookies())
            .context("failed to read cookies")?;
        Ok(Session::new(
            cookies
                .into_iter()
                .map(|c| SessionToken::new(c.name, c.value)),
        ))
    }

    pub(crate) fn current_url(&self) -> Result<Option<String>> {
        self.rt
            .block_on(self.page.url())
            .context("failed to read current URL")
    }

    /// 执行页面脚本，忽略返回值。
    pub(crate) fn run_script(&self, script: &str) -> Result<()> {
        self.rt
            .block_on(self.page.evaluate(script))
            .context("script execution failed")?;
        Ok(())
    }
}

impl Drop for BrowserGuard {
    fn drop(&mut self) {
        let Some(mut browser) = self.browser.take() else {
            return;
        };
        let handler = self.handler.take();
        self.rt.block_on(async move {
            if let Err(e) = browser.close().await {
                debug!(target: "browser", "关闭浏览器失败: {}", e);
            }
            let _ = browser.wait().await;
            if let Some(h) = handler {
                h.abort();
            }
        });
        info!(target: "browser", "浏览器已关闭");
    }
}
