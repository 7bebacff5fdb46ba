//! 单章下载的三种方式：指纹客户端 → 反爬客户端 → 浏览器刷新会话后重试。
//!
//! 三者共用同一套请求流程（POST 章节 API 取得临时地址，再 GET 压缩包），
//! 区别只在于客户端画像、cookie 的携带方式与超时。

use std::io::Read;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{ACCEPT, COOKIE, HeaderMap, HeaderValue, REFERER};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::archive::is_valid_archive;
use crate::base_system::context::Config;
use crate::network_parser::client::{
    api_headers, chapter_download_endpoint, evasion_client, impersonated_client, seeded_jar,
};
use crate::session::store::SessionStore;
use crate::session::{Session, SessionRefresher};

/// 单章请求参数。
#[derive(Debug, Clone, Copy)]
pub struct ChapterRequest<'a> {
    pub chapter_id: &'a str,
    pub parent_id: &'a str,
    pub title: &'a str,
    pub referer: &'a str,
}

#[derive(Debug, Error)]
pub enum StrategyFailure {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("invalid JSON response: {0}")]
    BadJson(String),
    #[error("no download URL in response")]
    NoUrl,
    #[error("unusable download URL: {0}")]
    BadUrl(String),
    #[error("download failed: HTTP {0}")]
    DownloadStatus(u16),
    #[error("payload is not a ZIP archive ({0} bytes)")]
    NotArchive(usize),
    #[error("session recovery failed: {0}")]
    Recovery(String),
    #[error("client setup failed: {0}")]
    Setup(String),
}

impl From<reqwest::Error> for StrategyFailure {
    fn from(e: reqwest::Error) -> Self {
        StrategyFailure::Transport(e.to_string())
    }
}

/// 一种完整的下载方式。失败只以 `StrategyFailure` 返回，由调用方记录后继续下一种。
pub trait FetchStrategy: Send {
    fn name(&self) -> &'static str;

    fn attempt(
        &mut self,
        req: &ChapterRequest<'_>,
        session: &Session,
    ) -> Result<Vec<u8>, StrategyFailure>;

    /// 本次尝试中产生的新会话（无论成功与否），取走后清空。
    fn take_refreshed(&mut self) -> Option<Session> {
        None
    }
}

/// 去掉 JSON 转义的斜杠并补全协议：`//host/x` → `https://host/x`，站内相对路径基于站点根地址。
pub fn normalize_download_url(raw: &str, base: &str) -> Option<Url> {
    let unescaped = raw.trim().replace("\\/", "/");
    if unescaped.is_empty() {
        return None;
    }
    let absolute = match unescaped.strip_prefix("//") {
        Some(rest) => format!("https://{rest}"),
        None => unescaped,
    };
    match Url::parse(&absolute) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
        Ok(_) => None,
        Err(_) => Url::parse(base).ok()?.join(&absolute).ok(),
    }
}

/// 从章节 API 的响应体中取出下载地址（`{"data": "<url>"}`）。
pub fn extract_download_url(body: &[u8], base: &str) -> Result<Url, StrategyFailure> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| StrategyFailure::BadJson(e.to_string()))?;
    let raw = value
        .get("data")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or(StrategyFailure::NoUrl)?;
    normalize_download_url(raw, base).ok_or_else(|| StrategyFailure::BadUrl(raw.to_string()))
}

/// 三种方式共用的“解析地址 → 下载压缩包”流程。
struct RequestFlow<'a> {
    client: &'a Client,
    base_url: &'a str,
    endpoint: &'a str,
    api_headers: HeaderMap,
    cookie: Option<String>,
    resolve_timeout: Option<Duration>,
    download_timeout: Option<Duration>,
    download_headers: HeaderMap,
}

impl RequestFlow<'_> {
    fn run(&self, req: &ChapterRequest<'_>) -> Result<Vec<u8>, StrategyFailure> {
        let url = self.resolve(req)?;
        debug!(target: "download", "章节 {} 下载地址: {}", req.chapter_id, url);
        self.download(url)
    }

    fn with_cookie(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.cookie {
            Some(cookie) => builder.header(COOKIE, cookie),
            None => builder,
        }
    }

    fn resolve(&self, req: &ChapterRequest<'_>) -> Result<Url, StrategyFailure> {
        let mut builder = self
            .client
            .post(self.endpoint)
            .form(&[("chapter_id", req.chapter_id), ("news_id", req.parent_id)])
            .headers(self.api_headers.clone());
        builder = self.with_cookie(builder);
        if let Some(t) = self.resolve_timeout {
            builder = builder.timeout(t);
        }

        let resp = builder.send()?;
        if resp.status().as_u16() != 200 {
            return Err(StrategyFailure::Status(resp.status().as_u16()));
        }
        let body = resp.bytes()?;
        extract_download_url(&body, self.base_url)
    }

    fn download(&self, url: Url) -> Result<Vec<u8>, StrategyFailure> {
        let mut builder = self
            .client
            .get(url)
            .headers(self.download_headers.clone());
        builder = self.with_cookie(builder);
        if let Some(t) = self.download_timeout {
            builder = builder.timeout(t);
        }

        let mut resp = builder.send()?;
        if resp.status().as_u16() != 200 {
            return Err(StrategyFailure::DownloadStatus(resp.status().as_u16()));
        }
        let mut bytes = Vec::new();
        resp.read_to_end(&mut bytes)
            .map_err(|e| StrategyFailure::Transport(e.to_string()))?;
        if !is_valid_archive(&bytes) {
            return Err(StrategyFailure::NotArchive(bytes.len()));
        }
        Ok(bytes)
    }
}

/// 方式一：Chrome 画像客户端，cookies 以请求头形式附加。
pub struct ImpersonatedStrategy {
    client: Client,
    base_url: String,
    endpoint: String,
    api_headers: HeaderMap,
}

impl ImpersonatedStrategy {
    pub fn new(cfg: &Config, referer: &str) -> Result<Self, StrategyFailure> {
        let client = impersonated_client(cfg).map_err(|e| StrategyFailure::Setup(e.to_string()))?;
        Ok(Self {
            client,
            base_url: cfg.base_url().to_string(),
            endpoint: chapter_download_endpoint(cfg),
            api_headers: api_headers(cfg, referer),
        })
    }

    fn flow(&self, session: &Session) -> RequestFlow<'_> {
        RequestFlow {
            client: &self.client,
            base_url: &self.base_url,
            endpoint: &self.endpoint,
            api_headers: self.api_headers.clone(),
            cookie: Some(session.cookie_header()),
            resolve_timeout: None,
            download_timeout: None,
            download_headers: HeaderMap::new(),
        }
    }
}

impl FetchStrategy for ImpersonatedStrategy {
    fn name(&self) -> &'static str {
        "impersonated"
    }

    fn attempt(
        &mut self,
        req: &ChapterRequest<'_>,
        session: &Session,
    ) -> Result<Vec<u8>, StrategyFailure> {
        self.flow(session).run(req)
    }
}

/// 方式二：反爬画像客户端，独立 cookie jar（由会话令牌播种），每个请求固定超时。
pub struct EvasionStrategy {
    cfg: Config,
    referer: String,
    // 会话变化后重建 jar
    client: Option<(Client, Session)>,
}

impl EvasionStrategy {
    pub fn new(cfg: &Config, referer: &str) -> Self {
        Self {
            cfg: cfg.clone(),
            referer: referer.to_string(),
            client: None,
        }
    }

    fn client_for(&mut self, session: &Session) -> Result<&Client, StrategyFailure> {
        let stale = !matches!(&self.client, Some((_, seeded)) if seeded == session);
        if stale {
            let jar = seeded_jar(&self.cfg, session);
            let client =
                evasion_client(&self.cfg, jar).map_err(|e| StrategyFailure::Setup(e.to_string()))?;
            self.client = Some((client, session.clone()));
        }
        match &self.client {
            Some((client, _)) => Ok(client),
            None => Err(StrategyFailure::Setup("client not initialised".to_string())),
        }
    }
}

impl FetchStrategy for EvasionStrategy {
    fn name(&self) -> &'static str {
        "anti-bot"
    }

    fn attempt(
        &mut self,
        req: &ChapterRequest<'_>,
        session: &Session,
    ) -> Result<Vec<u8>, StrategyFailure> {
        let base_url = self.cfg.base_url().to_string();
        let endpoint = chapter_download_endpoint(&self.cfg);
        let api = api_headers(&self.cfg, &self.referer);
        let resolve_timeout = Duration::from_secs(self.cfg.request_timeout.max(1));
        let download_timeout = Duration::from_secs(self.cfg.download_timeout.max(1));

        let mut download_headers = HeaderMap::new();
        download_headers.insert(ACCEPT, HeaderValue::from_static("application/zip,*/*"));
        if let Ok(v) = HeaderValue::from_str(&self.referer) {
            download_headers.insert(REFERER, v);
        }

        let client = self.client_for(session)?;
        RequestFlow {
            client,
            base_url: &base_url,
            endpoint: &endpoint,
            api_headers: api,
            cookie: None,
            resolve_timeout: Some(resolve_timeout),
            download_timeout: Some(download_timeout),
            download_headers,
        }
        .run(req)
    }
}

/// 方式三：通过浏览器刷新会话，保存新 cookies，再按方式一重试。
pub struct RecoveryStrategy {
    cfg: Config,
    referer: String,
    store: SessionStore,
    refresher: Box<dyn SessionRefresher>,
    refreshed: Option<Session>,
}

impl RecoveryStrategy {
    pub fn new(
        cfg: &Config,
        referer: &str,
        store: SessionStore,
        refresher: Box<dyn SessionRefresher>,
    ) -> Self {
        Self {
            cfg: cfg.clone(),
            referer: referer.to_string(),
            store,
            refresher,
            refreshed: None,
        }
    }
}

impl FetchStrategy for RecoveryStrategy {
    fn name(&self) -> &'static str {
        "session-recovery"
    }

    fn attempt(
        &mut self,
        req: &ChapterRequest<'_>,
        session: &Session,
    ) -> Result<Vec<u8>, StrategyFailure> {
        let fresh = self
            .store
            .refresh(session, self.refresher.as_mut())
            .map_err(|e| StrategyFailure::Recovery(e.to_string()))?;
        info!(target: "session", "会话已刷新（{} 个 cookies），使用新会话重试", fresh.len());
        self.refreshed = Some(fresh.clone());

        // 新会话配新客户端，避免连接上残留旧状态
        let retry = ImpersonatedStrategy::new(&self.cfg, &self.referer)?;
        retry.flow(&fresh).run(req)
    }

    fn take_refreshed(&mut self) -> Option<Session> {
        self.refreshed.take()
    }
}
