//! 会话令牌文件：JSON 数组 `[{"name": ..., "value": ...}]`。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use super::{Session, SessionRefresher, SessionToken};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session file not found: {0}")]
    NotFound(PathBuf),
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid session file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("no usable session: {0}")]
    Unauthenticated(String),
    #[error("session refresh failed: {0}")]
    Refresh(String),
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Session, SessionError> {
        if !self.path.exists() {
            return Err(SessionError::NotFound(self.path.clone()));
        }
        let raw = fs::read_to_string(&self.path).map_err(|source| SessionError::Io {
            path: self.path.clone(),
            source,
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|e| self.parse_error(e.to_string()))?;
        let session = parse_tokens(value).map_err(|reason| self.parse_error(reason))?;
        info!(target: "session", "已从 {} 载入 {} 个 cookies", self.path.display(), session.len());
        Ok(session)
    }

    /// 只写入白名单内的令牌。
    pub fn save(&self, session: &Session) -> Result<(), SessionError> {
        let subset = session.important_subset();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| SessionError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(subset.tokens())
            .map_err(|e| self.parse_error(e.to_string()))?;
        fs::write(&self.path, json).map_err(|source| SessionError::Io {
            path: self.path.clone(),
            source,
        })?;
        info!(target: "session", "已保存 {} 个 cookies 到 {}", subset.len(), self.path.display());
        Ok(())
    }

    /// 通过浏览器刷新会话并持久化，返回新会话。
    pub fn refresh(
        &self,
        session: &Session,
        refresher: &mut dyn SessionRefresher,
    ) -> Result<Session, SessionError> {
        let fresh = refresher
            .refresh(session)
            .map_err(|e| SessionError::Refresh(format!("{e:#}")))?;
        if fresh.is_empty() {
            return Err(SessionError::Refresh("浏览器未返回任何 cookies".to_string()));
        }
        self.save(&fresh)?;
        Ok(fresh)
    }

    /// 选出本次运行使用的会话：优先使用内存中已有的，否则从文件载入。
    pub fn resolve(&self, held: Option<Session>) -> Result<Session, SessionError> {
        if let Some(session) = held.filter(|s| !s.is_empty()) {
            if let Err(e) = self.load() {
                // 内存中已有会话时文件缺失/损坏都不影响
                if !matches!(e, SessionError::NotFound(_)) {
                    warn!(target: "session", "cookies 文件不可用（已使用内存会话）: {}", e);
                }
            }
            return Ok(session);
        }

        warn!(target: "session", "cookies 未设置，尝试从文件载入");
        match self.load() {
            Ok(session) if !session.is_empty() => Ok(session),
            Ok(_) => Err(SessionError::Unauthenticated(format!(
                "{} 中没有 cookies",
                self.path.display()
            ))),
            Err(e) => Err(SessionError::Unauthenticated(e.to_string())),
        }
    }

    fn parse_error(&self, reason: String) -> SessionError {
        SessionError::Parse {
            path: self.path.clone(),
            reason,
        }
    }
}

/// 兼容两种形态：`[{name, value, ...}]`（浏览器导出的完整 cookie 也可）与旧版 `{name: value}`。
fn parse_tokens(value: Value) -> Result<Session, String> {
    match value {
        Value::Array(items) => {
            let mut tokens = Vec::with_capacity(items.len());
            for item in items {
                let name = item.get("name").and_then(Value::as_str);
                let val = item.get("value").and_then(Value::as_str);
                match (name, val) {
                    (Some(n), Some(v)) => tokens.push(SessionToken::new(n, v)),
                    _ => return Err(format!("cookie 条目缺少 name/value: {item}")),
                }
            }
            Ok(Session::new(tokens))
        }
        Value::Object(map) => Ok(Session::new(map.into_iter().filter_map(|(k, v)| {
            v.as_str().map(|s| SessionToken::new(k.clone(), s))
        }))),
        other => Err(format!("期望 JSON 数组或对象，实际为 {other}")),
    }
}
