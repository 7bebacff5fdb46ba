//! 按固定顺序依次尝试各下载方式，首个成功者胜出。

use std::thread;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{info, warn};

use super::strategy::{
    ChapterRequest, EvasionStrategy, FetchStrategy, ImpersonatedStrategy, StrategyFailure,
};
use crate::base_system::context::Config;
use crate::session::Session;
use crate::session::store::SessionStore;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("chapter {chapter_id} unavailable: {}", summarize(.attempts))]
    ChapterUnavailable {
        chapter_id: String,
        attempts: Vec<(&'static str, String)>,
    },
}

fn summarize(attempts: &[(&'static str, String)]) -> String {
    if attempts.is_empty() {
        return "no download strategy configured".to_string();
    }
    attempts
        .iter()
        .map(|(name, reason)| format!("{name}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// 一次单章下载的结果，以及期间由恢复策略产生的新会话。
#[derive(Debug)]
pub struct FetchOutcome {
    pub payload: Result<Vec<u8>, FetchError>,
    pub refreshed: Option<Session>,
}

pub struct ChapterFetcher {
    strategies: Vec<Box<dyn FetchStrategy>>,
    pause: Duration,
}

impl ChapterFetcher {
    pub fn new(strategies: Vec<Box<dyn FetchStrategy>>, pause: Duration) -> Self {
        Self { strategies, pause }
    }

    /// 标准链：指纹客户端 → 反爬客户端 →（可选）浏览器会话恢复。
    pub fn standard(cfg: &Config, referer: &str, store: &SessionStore) -> Result<Self> {
        let mut strategies: Vec<Box<dyn FetchStrategy>> = vec![
            Box::new(ImpersonatedStrategy::new(cfg, referer)?),
            Box::new(EvasionStrategy::new(cfg, referer)),
        ];
        strategies.extend(recovery_strategy(cfg, referer, store));

        let fetcher = Self::new(strategies, cfg.strategy_pause());
        info!(target: "download", "下载方式: {}", fetcher.strategy_names().join(" → "));
        Ok(fetcher)
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn fetch(&mut self, req: &ChapterRequest<'_>, session: &Session) -> FetchOutcome {
        let mut attempts = Vec::with_capacity(self.strategies.len());
        let mut refreshed = None;
        let total = self.strategies.len();

        for (idx, strategy) in self.strategies.iter_mut().enumerate() {
            if idx > 0 && !self.pause.is_zero() {
                thread::sleep(self.pause);
            }
            let name = strategy.name();
            info!(target: "download", "尝试方式 {}/{} [{}]: {}", idx + 1, total, name, req.title);

            let result = strategy.attempt(req, session);
            if let Some(fresh) = strategy.take_refreshed() {
                refreshed = Some(fresh);
            }

            match result {
                Ok(bytes) => {
                    info!(target: "download", "[{}] 成功: {} ({} 字节)", name, req.title, bytes.len());
                    return FetchOutcome {
                        payload: Ok(bytes),
                        refreshed,
                    };
                }
                Err(failure) => {
                    log_failure(name, req, &failure);
                    attempts.push((name, failure.to_string()));
                }
            }
        }

        warn!(target: "download", "所有方式均失败: {}", req.title);
        FetchOutcome {
            payload: Err(FetchError::ChapterUnavailable {
                chapter_id: req.chapter_id.to_string(),
                attempts,
            }),
            refreshed,
        }
    }
}

#[cfg(feature = "browser")]
fn recovery_strategy(
    cfg: &Config,
    referer: &str,
    store: &SessionStore,
) -> Option<Box<dyn FetchStrategy>> {
    use super::strategy::RecoveryStrategy;
    use crate::browser::ChromiumRefresher;

    if !cfg.enable_session_recovery {
        return None;
    }
    Some(Box::new(RecoveryStrategy::new(
        cfg,
        referer,
        store.clone(),
        Box::new(ChromiumRefresher::new(cfg)),
    )))
}

#[cfg(not(feature = "browser"))]
fn recovery_strategy(
    cfg: &Config,
    _referer: &str,
    _store: &SessionStore,
) -> Option<Box<dyn FetchStrategy>> {
    if cfg.enable_session_recovery {
        warn!(target: "download", "未启用 browser 特性，会话恢复策略不可用");
    }
    None
}

fn log_failure(name: &str, req: &ChapterRequest<'_>, failure: &StrategyFailure) {
    warn!(target: "download", "[{}] 失败: {} ({})", name, req.title, failure);
}
