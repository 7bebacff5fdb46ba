//! 流水线事件与 CLI 进度条。
//!
//! 工作线程只通过 `EventSink` 单向发送事件；界面一侧持有 `Receiver`，
//! 由 `CliReporter` 渲染进度条与最终统计。

use std::fmt::Write as _;

use crossbeam_channel::{Receiver, Sender};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::models::{RunOutcome, RunState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    Log(String),
    StateChanged(RunState),
    /// 浏览器监视期间预览到的作品页。
    ChaptersDiscovered {
        total: usize,
        title: String,
        url: String,
    },
    DownloadStarted {
        title: String,
        total: usize,
    },
    ChapterProgress {
        done: usize,
        total: usize,
        title: String,
        ok: bool,
    },
    Finished(RunOutcome),
}

/// 发送端；接收端关闭后事件被静默丢弃。
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<PipelineEvent>>,
}

impl EventSink {
    pub fn new(tx: Sender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn log(&self, line: impl Into<String>) {
        self.emit(PipelineEvent::Log(line.into()));
    }

    pub fn state(&self, state: RunState) {
        self.emit(PipelineEvent::StateChanged(state));
    }
}

pub fn event_channel() -> (EventSink, Receiver<PipelineEvent>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (EventSink::new(tx), rx)
}

pub struct CliReporter {
    draw_target: fn() -> ProgressDrawTarget,
    bar: Option<ProgressBar>,
}

impl Default for CliReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            draw_target: ProgressDrawTarget::stderr,
            bar: None,
        }
    }

    #[cfg(test)]
    pub fn hidden() -> Self {
        Self {
            draw_target: ProgressDrawTarget::hidden,
            bar: None,
        }
    }

    fn start_bar(&mut self, title: &str, total: usize) {
        self.finish_bar();
        let style = ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

        let bar = ProgressBar::with_draw_target(Some(total as u64), (self.draw_target)());
        bar.set_style(style);
        bar.set_prefix(format!("章节下载 {title}"));
        self.bar = Some(bar);
    }

    fn finish_bar(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    #[cfg(test)]
    pub fn position(&self) -> Option<u64> {
        self.bar.as_ref().map(|b| b.position())
    }

    pub fn handle(&mut self, event: &PipelineEvent) {
        match event {
            PipelineEvent::DownloadStarted { title, total } => self.start_bar(title, *total),
            PipelineEvent::ChapterProgress {
                done, title, ok, ..
            } => {
                if let Some(bar) = &self.bar {
                    bar.set_position(*done as u64);
                    let mark = if *ok { "✓" } else { "✗" };
                    bar.set_message(format!("{mark} {title}"));
                }
            }
            PipelineEvent::ChaptersDiscovered { total, title, url } => {
                self.println(format!("发现作品: {title} ({total} 章) {url}"));
            }
            PipelineEvent::StateChanged(state)
                if *state == RunState::Archiving || state.is_terminal() =>
            {
                self.finish_bar();
            }
            PipelineEvent::Finished(_) => self.finish_bar(),
            PipelineEvent::Log(_) | PipelineEvent::StateChanged(_) => {}
        }
    }

    fn println(&self, line: String) {
        match &self.bar {
            Some(bar) => bar.println(line),
            None => eprintln!("{line}"),
        }
    }

    /// 控制台日志行（来自日志广播），与进度条互不覆盖。
    pub fn print_log(&self, line: &str) {
        let line = line.trim_end();
        if !line.is_empty() {
            self.println(line.to_string());
        }
    }

    /// 消费事件直到收到完成事件或发送端全部关闭，期间转印日志行。
    pub fn drain(
        &mut self,
        events: &Receiver<PipelineEvent>,
        logs: Option<&Receiver<String>>,
    ) -> Option<RunOutcome> {
        let events = events.clone();
        let logs = logs.cloned().unwrap_or_else(crossbeam_channel::never);
        loop {
            crossbeam_channel::select! {
                recv(events) -> event => match event {
                    Ok(event) => {
                        self.handle(&event);
                        if let PipelineEvent::Finished(outcome) = event {
                            for line in logs.try_iter() {
                                self.print_log(&line);
                            }
                            return Some(outcome);
                        }
                    }
                    Err(_) => {
                        self.finish_bar();
                        return None;
                    }
                },
                recv(logs) -> line => {
                    if let Ok(line) = line {
                        self.print_log(&line);
                    }
                }
            }
        }
    }
}

/// 运行结束后的统计摘要。
pub fn render_summary(outcome: &RunOutcome) -> String {
    let mut out = String::new();
    let state = match outcome.state {
        RunState::Completed => "完成",
        RunState::PartiallyCompleted => "部分完成",
        RunState::Cancelled => "已取消",
        RunState::Failed => "失败",
        _ => "未结束",
    };
    let _ = writeln!(out, "状态: {state}");
    if outcome.chapters_total > 0 {
        let _ = writeln!(
            out,
            "成功处理章节: {}/{}",
            outcome.chapters_ok, outcome.chapters_total
        );
    }
    if outcome.pages > 0 {
        let _ = writeln!(out, "总页数: {}", outcome.pages);
    }
    if !outcome.failures.is_empty() {
        let _ = writeln!(out, "下载失败的章节 ({}):", outcome.failures.len());
        for failed in outcome.failures.entries() {
            let _ = writeln!(out, "  - {failed}");
        }
    }
    if let Some(path) = &outcome.output {
        let shown = std::path::absolute(path).unwrap_or_else(|_| path.clone());
        let _ = writeln!(out, "输出文件: {}", shown.display());
    }
    if let Some(err) = &outcome.error {
        let _ = writeln!(out, "错误: {err}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::models::FailureLog;
    use std::path::PathBuf;

    fn outcome(state: RunState) -> RunOutcome {
        let mut failures = FailureLog::default();
        failures.record(2, "Ch 2");
        RunOutcome {
            state,
            output: Some(PathBuf::from("/tmp/Berserk.cbz")),
            failures,
            pages: 12,
            chapters_ok: 2,
            chapters_total: 3,
            error: None,
        }
    }

    #[test]
    fn drain_returns_finished_outcome_and_tracks_progress() {
        let (sink, rx) = event_channel();
        sink.emit(PipelineEvent::DownloadStarted {
            title: "Berserk".into(),
            total: 3,
        });
        sink.emit(PipelineEvent::ChapterProgress {
            done: 2,
            total: 3,
            title: "Ch 2".into(),
            ok: false,
        });

        let mut reporter = CliReporter::hidden();
        reporter.handle(&rx.recv().unwrap());
        reporter.handle(&rx.recv().unwrap());
        assert_eq!(reporter.position(), Some(2));

        sink.emit(PipelineEvent::Finished(outcome(RunState::PartiallyCompleted)));
        let done = reporter.drain(&rx, None).unwrap();
        assert_eq!(done.state, RunState::PartiallyCompleted);
        assert_eq!(reporter.position(), None);
    }

    #[test]
    fn drain_ends_when_sender_is_dropped() {
        let (sink, rx) = event_channel();
        sink.log("hello");
        drop(sink);
        assert!(CliReporter::hidden().drain(&rx, None).is_none());
    }

    #[test]
    fn drain_forwards_log_lines_until_finished() {
        let (sink, rx) = event_channel();
        let (log_tx, log_rx) = crossbeam_channel::unbounded();
        log_tx.send(" INFO 开始\n".to_string()).unwrap();
        sink.emit(PipelineEvent::Finished(outcome(RunState::Completed)));
        let done = CliReporter::hidden().drain(&rx, Some(&log_rx)).unwrap();
        assert_eq!(done.state, RunState::Completed);
        assert!(log_rx.try_recv().is_err());
    }

    #[test]
    fn terminal_state_closes_the_bar() {
        let mut reporter = CliReporter::hidden();
        reporter.handle(&PipelineEvent::DownloadStarted {
            title: "Berserk".into(),
            total: 2,
        });
        reporter.handle(&PipelineEvent::StateChanged(RunState::Downloading));
        assert_eq!(reporter.position(), Some(0));
        reporter.handle(&PipelineEvent::StateChanged(RunState::Cancelled));
        assert_eq!(reporter.position(), None);
    }

    #[test]
    fn default_sink_discards_events() {
        EventSink::default().state(RunState::Downloading);
    }

    #[test]
    fn summary_lists_failures_and_statistics() {
        let text = render_summary(&outcome(RunState::PartiallyCompleted));
        assert!(text.contains("状态: 部分完成"));
        assert!(text.contains("成功处理章节: 2/3"));
        assert!(text.contains("总页数: 12"));
        assert!(text.contains("第 2 章: Ch 2"));
        assert!(text.contains("Berserk.cbz"));
    }
}
