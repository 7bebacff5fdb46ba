//! 作品页解析：抓取页面，提取 `window.__DATA__ = {...};` 中的章节目录。

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::COOKIE;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::client::impersonated_client;
use crate::base_system::context::Config;
use crate::base_system::json_extract::{pick_array, pick_string};
use crate::download::models::{ChapterRef, Manifest};
use crate::session::Session;

const DEFAULT_TITLE: &str = "Manga";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("window.__DATA__ not found in page")]
    ManifestNotFound,
    #[error("invalid manifest JSON: {0}")]
    Json(String),
    #[error("news_id missing from both page data and URL")]
    ParentIdMissing,
}

fn data_marker() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)window\.__DATA__\s*=\s*(\{.*?\})\s*;").ok())
        .as_ref()
}

fn url_news_id() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/(\d+)-").ok()).as_ref()
}

pub struct MetadataFetcher {
    client: Client,
}

impl MetadataFetcher {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            client: impersonated_client(cfg)?,
        })
    }

    /// 带会话抓取作品页并解析目录。
    pub fn fetch(&self, url: &str, session: &Session) -> Result<Manifest, ManifestError> {
        info!(target: "download", "下载 HTML: {}", url);
        let resp = self
            .client
            .get(url)
            .header(COOKIE, session.cookie_header())
            .send()
            .map_err(|e| ManifestError::Request(e.to_string()))?;

        let status = resp.status();
        debug!(target: "download", "作品页响应状态: {}", status.as_u16());
        if !status.is_success() {
            return Err(ManifestError::Status(status.as_u16()));
        }
        let html = resp
            .text()
            .map_err(|e| ManifestError::Request(e.to_string()))?;

        let manifest = parse_manifest(&html, url)?;
        info!(target: "download", "名称: {}", manifest.title);
        info!(target: "download", "作品 ID: {}", manifest.parent_id);
        info!(target: "download", "章节总数: {}", manifest.chapters.len());
        Ok(manifest)
    }
}

/// 解析页面文本。源数据中章节按“最新在前”排列，这里反转一次得到阅读顺序。
pub fn parse_manifest(html: &str, url: &str) -> Result<Manifest, ManifestError> {
    let raw = data_marker()
        .and_then(|re| re.captures(html))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or(ManifestError::ManifestNotFound)?;

    let value: Value = serde_json::from_str(raw).map_err(|e| ManifestError::Json(e.to_string()))?;
    let data = value
        .as_object()
        .ok_or_else(|| ManifestError::Json("window.__DATA__ is not an object".to_string()))?;

    let title = pick_string(data, &["title"]).unwrap_or_else(|| DEFAULT_TITLE.to_string());
    let parent_id = pick_string(data, &["news_id"])
        .or_else(|| parent_id_from_url(url))
        .ok_or(ManifestError::ParentIdMissing)?;

    let mut seen = HashSet::new();
    let mut chapters = Vec::new();
    for item in pick_array(data, "chapters").iter().rev() {
        let Some(obj) = item.as_object() else {
            return Err(ManifestError::Json(format!("chapter entry is not an object: {item}")));
        };
        let id = pick_string(obj, &["id"])
            .ok_or_else(|| ManifestError::Json(format!("chapter entry without id: {item}")))?;
        if !seen.insert(id.clone()) {
            warn!(target: "download", "重复的章节 ID 已忽略: {}", id);
            continue;
        }
        let title = pick_string(obj, &["title"]).unwrap_or_else(|| id.clone());
        chapters.push(ChapterRef {
            id,
            title,
            ordinal: chapters.len() + 1,
        });
    }

    Ok(Manifest {
        title,
        parent_id,
        chapters,
    })
}

/// 从作品地址中提取 `/<数字>-` 形式的 ID。
pub fn parent_id_from_url(url: &str) -> Option<String> {
    url_news_id()?
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://com-x.life/4521-some-manga.html";

    fn page(data: &str) -> String {
        format!(
            "<html><head><script>var x = 1;\nwindow.__DATA__ = {data};\n</script></head><body></body></html>"
        )
    }

    #[test]
    fn chapters_are_reversed_into_reading_order() {
        let html = page(
            r#"{"title":" Berserk ","news_id":77,"chapters":[
                {"id":303,"title":"Ch 3"},{"id":302,"title":"Ch 2"},{"id":301,"title":"Ch 1"}]}"#,
        );
        let m = parse_manifest(&html, URL).unwrap();
        assert_eq!(m.title, "Berserk");
        assert_eq!(m.parent_id, "77");
        let ids: Vec<_> = m.chapters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["301", "302", "303"]);
        let ordinals: Vec<_> = m.chapters.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, [1, 2, 3]);
    }

    #[test]
    fn parent_id_falls_back_to_url() {
        let html = page(r#"{"chapters":[]}"#);
        let m = parse_manifest(&html, URL).unwrap();
        assert_eq!(m.parent_id, "4521");
        assert_eq!(m.title, "Manga");
        assert!(m.chapters.is_empty());
    }

    #[test]
    fn missing_marker_and_parent_id_are_distinct_errors() {
        assert!(matches!(
            parse_manifest("<html></html>", URL),
            Err(ManifestError::ManifestNotFound)
        ));
        assert!(matches!(
            parse_manifest(&page(r#"{"chapters":[]}"#), "https://com-x.life/reader"),
            Err(ManifestError::ParentIdMissing)
        ));
        assert!(matches!(
            parse_manifest(&page(r#"{"chapters": [1,}"#), URL),
            Err(ManifestError::Json(_))
        ));
    }

    #[test]
    fn duplicate_ids_are_dropped() {
        let html = page(r#"{"news_id":"9","chapters":[{"id":"b","title":"B"},{"id":"a","title":"A"},{"id":"a","title":"A again"}]}"#);
        let m = parse_manifest(&html, URL).unwrap();
        assert_eq!(m.chapters.len(), 2);
        assert_eq!(m.chapters[0].title, "A again");
        assert_eq!(m.chapters[1].ordinal, 2);
    }
}
