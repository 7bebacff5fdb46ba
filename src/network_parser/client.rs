//! HTTP 客户端构建：两套浏览器画像（指纹客户端 / 反爬客户端）与章节 API 的固定请求头。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::blocking::Client;
use reqwest::cookie::Jar;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CONNECTION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue,
    ORIGIN, REFERER, USER_AGENT,
};
use reqwest::redirect::Policy;

use crate::base_system::context::Config;
use crate::session::Session;

pub(crate) const CHAPTER_DOWNLOAD_PATH: &str =
    "/engine/ajax/controller.php?mod=api&action=chapters/download";

const ACCEPT_JSON: &str = "application/json, text/javascript, */*; q=0.01";
const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const LANGUAGE: &str = "ru-RU,ru;q=0.9,en-US;q=0.8,en;q=0.7";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";
const MAX_REDIRECTS: usize = 10;

fn header_or(value: &str, fallback: &'static str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or(HeaderValue::from_static(fallback))
}

/// 桌面 Chrome 的请求头画像，供指纹客户端与页面抓取使用。
fn chrome_headers(cfg: &Config) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, header_or(&cfg.user_agent, "Mozilla/5.0"));
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(LANGUAGE));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("sec-ch-ua"),
        HeaderValue::from_static(
            "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\"",
        ),
    );
    headers.insert(
        HeaderName::from_static("sec-ch-ua-mobile"),
        HeaderValue::from_static("?0"),
    );
    headers.insert(
        HeaderName::from_static("sec-fetch-site"),
        HeaderValue::from_static("same-origin"),
    );
    headers
}

/// 反爬客户端的画像：Windows 桌面平台，且声明非移动端。
fn platform_headers(cfg: &Config) -> HeaderMap {
    let mut headers = chrome_headers(cfg);
    headers.insert(
        HeaderName::from_static("sec-ch-ua-platform"),
        HeaderValue::from_static("\"Windows\""),
    );
    headers.insert(
        HeaderName::from_static("upgrade-insecure-requests"),
        HeaderValue::from_static("1"),
    );
    headers.insert(
        HeaderName::from_static("sec-fetch-mode"),
        HeaderValue::from_static("cors"),
    );
    headers
}

/// 指纹客户端：Chrome 画像、跟随重定向、显式超时。cookies 由调用方逐请求附加。
pub(crate) fn impersonated_client(cfg: &Config) -> Result<Client> {
    let client = Client::builder()
        .default_headers(chrome_headers(cfg))
        .redirect(Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(cfg.impersonate_timeout.max(1)))
        .connect_timeout(Duration::from_secs(cfg.connect_timeout.max(1)))
        .build()?;
    Ok(client)
}

/// 反爬客户端：独立 cookie jar。超时由每个请求单独指定。
pub(crate) fn evasion_client(cfg: &Config, jar: Arc<Jar>) -> Result<Client> {
    let client = Client::builder()
        .default_headers(platform_headers(cfg))
        .cookie_provider(jar)
        .redirect(Policy::limited(MAX_REDIRECTS))
        .connect_timeout(Duration::from_secs(cfg.connect_timeout.max(1)))
        .build()?;
    Ok(client)
}

/// 用会话令牌填充一个新的 cookie jar，作用域为站点根地址。
pub(crate) fn seeded_jar(cfg: &Config, session: &Session) -> Arc<Jar> {
    let jar = Jar::default();
    if let Ok(url) = reqwest::Url::parse(cfg.base_url()) {
        for token in session.tokens() {
            jar.add_cookie_str(&format!("{}={}; Path=/", token.name, token.value), &url);
        }
    }
    Arc::new(jar)
}

/// 章节 API 的固定请求头：表单类型、XHR 标记、Origin、Referer。
pub(crate) fn api_headers(cfg: &Config, referer: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_JSON));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
    headers.insert(
        HeaderName::from_static("x-requested-with"),
        HeaderValue::from_static("XMLHttpRequest"),
    );
    headers.insert(ORIGIN, header_or(cfg.base_url(), "null"));
    if let Ok(v) = HeaderValue::from_str(referer) {
        headers.insert(REFERER, v);
    }
    headers
}

pub(crate) fn chapter_download_endpoint(cfg: &Config) -> String {
    format!("{}{}", cfg.base_url(), CHAPTER_DOWNLOAD_PATH)
}
