//! com-x.life 漫画下载器。
//!
//! 本 crate 负责：配置加载、会话管理、逐章下载（三级回退）与合并为 CBZ。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/工作目录等基础设施
//! - `session`：登录令牌模型与持久化
//! - `network_parser`：HTTP 客户端画像与作品页解析
//! - `download`：下载策略、回退、编排与运行状态机
//! - `archive`：章节包校验与 CBZ 合并
//! - `browser`：浏览器自动化（交互登录、会话恢复）

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::{error, info};

mod archive;
mod base_system;
#[cfg(feature = "browser")]
mod browser;
mod download;
mod network_parser;
mod session;

use base_system::config::load_or_create;
use base_system::context::Config;
use base_system::logging::{LogOptions, LogSystem, take_broadcast_rx};
use download::models::{DownloadRange, RunOutcome, RunState};
use download::pipeline::{DownloadPipeline, RunRequest};
use download::progress::{CliReporter, EventSink, PipelineEvent, event_channel, render_summary};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "comx-manga-downloader")]
#[command(about = "com-x.life manga downloader (CBZ)")]
struct Cli {
    /// 作品页地址；省略时打开浏览器，登录后在页面上点击“下载”
    #[arg(long)]
    url: Option<String>,

    /// 起始章节（从 1 开始，含）
    #[arg(long)]
    start: Option<usize>,

    /// 结束章节（含）
    #[arg(long)]
    end: Option<usize>,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 显示版本信息后退出
    #[arg(long, default_value_t = false)]
    version: bool,

    /// 数据目录路径（用于存放 config.yml、cookies 和 logs 等文件）
    #[arg(long)]
    data_dir: Option<String>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if cli.version {
        println!("Comx Manga Downloader v{}", VERSION);
        return Ok(ExitCode::SUCCESS);
    }

    let data_dir = cli.data_dir.as_deref().map(Path::new);
    let _log = init_logging(cli.debug, data_dir)?;
    info!(target: "startup", "当前版本: v{}", VERSION);

    let config = load_or_create::<Config>(data_dir)
        .map_err(|e| anyhow!(e.to_string()))?
        .with_data_dir(data_dir);

    let cancel = install_ctrlc()?;
    let range = chapter_range(cli.start, cli.end);
    let (sink, events) = event_channel();

    let worker = {
        let url = cli.url.clone();
        let cancel = cancel.clone();
        thread::Builder::new()
            .name("pipeline".to_string())
            .spawn(move || run_worker(config, url, range, sink, cancel))
            .context("failed to spawn pipeline thread")?
    };

    let logs = take_broadcast_rx();
    let mut reporter = CliReporter::new();
    let streamed = reporter.drain(&events, logs.as_ref());
    let outcome = match worker.join() {
        Ok(outcome) => outcome,
        Err(_) => streamed.unwrap_or_else(|| {
            RunOutcome::failed("pipeline thread panicked", Default::default())
        }),
    };

    eprint!("{}", render_summary(&outcome));
    Ok(match outcome.state {
        RunState::Completed => ExitCode::SUCCESS,
        RunState::PartiallyCompleted => ExitCode::from(2),
        RunState::Cancelled => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    })
}

fn run_worker(
    config: Config,
    url: Option<String>,
    range: Option<DownloadRange>,
    sink: EventSink,
    cancel: Arc<AtomicBool>,
) -> RunOutcome {
    let request = match url {
        Some(url) => Ok(RunRequest {
            url,
            range,
            session: None,
        }),
        None => interactive_request(&config, range, &sink, &cancel),
    };

    let outcome = request.and_then(|req| {
        let mut pipeline = DownloadPipeline::new(&config, sink.clone(), cancel.clone())?;
        Ok(pipeline.run(req))
    });

    match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            let outcome = if cancel.load(Ordering::Relaxed) {
                RunOutcome::cancelled(Default::default())
            } else {
                error!(target: "startup", "{:#}", e);
                RunOutcome::failed(format!("{e:#}"), Default::default())
            };
            sink.emit(PipelineEvent::Finished(outcome.clone()));
            outcome
        }
    }
}

#[cfg(feature = "browser")]
fn interactive_request(
    config: &Config,
    range: Option<DownloadRange>,
    sink: &EventSink,
    cancel: &Arc<AtomicBool>,
) -> Result<RunRequest> {
    use session::LoginFlow;

    let mut login = browser::ChromiumLogin::new(config, sink.clone())?;
    let session = login.wait_for_authenticated_session(cancel)?;
    let trigger = login.wait_for_download_trigger(cancel)?;
    if let Some(title) = &trigger.hints.title {
        info!(target: "startup", "作品: {}", title);
    }
    Ok(RunRequest {
        url: trigger.url,
        range,
        session: Some(session),
    })
}

#[cfg(not(feature = "browser"))]
fn interactive_request(
    _config: &Config,
    _range: Option<DownloadRange>,
    _sink: &EventSink,
    _cancel: &Arc<AtomicBool>,
) -> Result<RunRequest> {
    Err(anyhow!("未启用 browser 特性，请使用 --url 指定作品页"))
}

/// 只给出一端时另一端取最宽。
fn chapter_range(start: Option<usize>, end: Option<usize>) -> Option<DownloadRange> {
    match (start, end) {
        (None, None) => None,
        (s, e) => Some(DownloadRange::new(s.unwrap_or(1), e.unwrap_or(usize::MAX))),
    }
}

/// 第一次 Ctrl-C 请求停止（在章节边界生效），第二次立即退出。
fn install_ctrlc() -> Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            eprintln!("强制退出");
            std::process::exit(130);
        }
        eprintln!("正在停止，当前章节结束后退出（再次按 Ctrl-C 强制退出）");
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(cancel)
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
        console: false,
        broadcast_to_ui: true,
    };
    LogSystem::init(opts, base_dir).map_err(|e| anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_flags_fill_open_ends() {
        assert_eq!(chapter_range(None, None), None);
        assert_eq!(chapter_range(Some(3), None), Some(DownloadRange::new(3, usize::MAX)));
        assert_eq!(chapter_range(None, Some(5)), Some(DownloadRange::new(1, 5)));
    }

    #[test]
    fn cli_parses_url_and_range() {
        let cli = Cli::parse_from([
            "comx-manga-downloader",
            "--url",
            "https://com-x.life/77-berserk.html",
            "--start",
            "2",
            "--end",
            "4",
        ]);
        assert_eq!(cli.url.as_deref(), Some("https://com-x.life/77-berserk.html"));
        assert_eq!(chapter_range(cli.start, cli.end), Some(DownloadRange::new(2, 4)));
    }
}
