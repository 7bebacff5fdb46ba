//! 会话（登录 cookies）模型与外部协作者接口。
//!
//! - `Session`：有序的 `(name, value)` 令牌集合，刷新时整体替换
//! - `store`：令牌文件的读写（只持久化白名单内的令牌）
//! - `SessionRefresher` / `LoginFlow`：浏览器侧的窄接口，核心流程不接触 DOM 细节

pub mod store;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// 需要长期保存的令牌名；其余令牌只在内存中随请求发送。
pub const IMPORTANT_TOKENS: [&str; 4] = ["dle_user_id", "dle_password", "dle_hash", "PHPSESSID"];

/// 判定“已登录”所需的令牌。
pub const AUTH_TOKENS: [&str; 2] = ["dle_user_id", "dle_password"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub name: String,
    pub value: String,
}

impl SessionToken {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    tokens: Vec<SessionToken>,
}

impl Session {
    /// 同名令牌只保留一个：位置取首次出现处，值取最后一次出现的值。
    pub fn new(tokens: impl IntoIterator<Item = SessionToken>) -> Self {
        let mut out: Vec<SessionToken> = Vec::new();
        for token in tokens {
            if token.name.is_empty() {
                continue;
            }
            match out.iter_mut().find(|t| t.name == token.name) {
                Some(existing) => existing.value = token.value,
                None => out.push(token),
            }
        }
        Self { tokens: out }
    }

    pub fn tokens(&self) -> &[SessionToken] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.tokens
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.as_str())
    }

    pub fn is_authenticated(&self) -> bool {
        AUTH_TOKENS
            .iter()
            .all(|name| self.get(name).is_some_and(|v| !v.is_empty()))
    }

    pub fn important_subset(&self) -> Session {
        Session {
            tokens: self
                .tokens
                .iter()
                .filter(|t| IMPORTANT_TOKENS.contains(&t.name.as_str()))
                .cloned()
                .collect(),
        }
    }

    /// `Cookie` 请求头的值：`a=1; b=2`。
    pub fn cookie_header(&self) -> String {
        self.tokens
            .iter()
            .map(|t| format!("{}={}", t.name, t.value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// 通过浏览器重新派生令牌，返回取代旧会话的新会话。
pub trait SessionRefresher: Send {
    fn refresh(&mut self, session: &Session) -> Result<Session>;
}

/// 用户在浏览器中点击“下载”后交给核心流程的信息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTrigger {
    pub url: String,
    pub hints: ManifestHints,
}

/// 监视页面时预览得到的信息，仅用于展示。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestHints {
    pub title: Option<String>,
    pub total_chapters: Option<usize>,
}

/// 登录与页面监视的外部协作者。
pub trait LoginFlow {
    fn wait_for_authenticated_session(&mut self, cancel: &Arc<AtomicBool>) -> Result<Session>;
    fn wait_for_download_trigger(&mut self, cancel: &Arc<AtomicBool>) -> Result<DownloadTrigger>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(name: &str, value: &str) -> SessionToken {
        SessionToken::new(name, value)
    }

    #[test]
    fn duplicate_names_keep_position_and_last_value() {
        let s = Session::new([token("a", "1"), token("b", "2"), token("a", "3")]);
        assert_eq!(s.len(), 2);
        assert_eq!(s.cookie_header(), "a=3; b=2");
    }

    #[test]
    fn important_subset_filters_by_allow_list() {
        let s = Session::new([
            token("dle_user_id", "10"),
            token("_ga", "tracking"),
            token("PHPSESSID", "abc"),
        ]);
        let kept = s.important_subset();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept.get("_ga"), None);
        assert_eq!(kept.get("PHPSESSID"), Some("abc"));
    }

    #[test]
    fn authenticated_requires_both_login_tokens() {
        let partial = Session::new([token("dle_user_id", "10")]);
        assert!(!partial.is_authenticated());
        let full = Session::new([token("dle_user_id", "10"), token("dle_password", "h")]);
        assert!(full.is_authenticated());
    }
}
