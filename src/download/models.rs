//! 下载相关的数据模型定义。
//!
//! 包含章节目录、下载范围、章节压缩包、失败记录、运行状态与结果等核心数据结构。

use std::fmt;
use std::ops::Range;
use std::path::PathBuf;

use crate::base_system::context::safe_fs_name;

/// 目录中的一章。`ordinal` 为阅读顺序中的位置（从 1 开始）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterRef {
    pub id: String,
    pub title: String,
    pub ordinal: usize,
}

/// 从页面内嵌 JSON 解析出的作品目录，章节已按阅读顺序排列。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub title: String,
    pub parent_id: String,
    pub chapters: Vec<ChapterRef>,
}

/// 用户选择的章节范围（闭区间，从 1 开始）。越界时裁剪，不报错。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadRange {
    pub start: usize,
    pub end: usize,
}

impl DownloadRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// 裁剪到 `[1, total]` 后对应的 0 基切片区间；无交集时为空区间。
    pub fn clamp(&self, total: usize) -> Range<usize> {
        let start = self.start.max(1);
        let end = self.end.min(total);
        if start > end {
            return 0..0;
        }
        (start - 1)..end
    }
}

pub fn select_chapters(chapters: &[ChapterRef], range: Option<DownloadRange>) -> &[ChapterRef] {
    match range {
        Some(r) => &chapters[r.clamp(chapters.len())],
        None => chapters,
    }
}

/// 章节压缩包文件名：`<四位序号>_<标题>.zip`，整体做文件名清洗。
pub fn chapter_file_name(seq: usize, title: &str) -> String {
    format!("{}.zip", safe_fs_name(&format!("{seq:04}_{title}"), 180))
}

/// 已下载并通过校验的单章压缩包。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterArchive {
    pub seq: usize,
    pub title: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedChapter {
    pub seq: usize,
    pub title: String,
}

impl fmt::Display for FailedChapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "第 {} 章: {}", self.seq, self.title)
    }
}

/// 所有下载方式都失败的章节，按出现顺序记录。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureLog {
    entries: Vec<FailedChapter>,
}

impl FailureLog {
    pub fn record(&mut self, seq: usize, title: &str) {
        self.entries.push(FailedChapter {
            seq,
            title: title.to_string(),
        });
    }

    pub fn entries(&self) -> &[FailedChapter] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 一次运行的状态机。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Authenticating,
    FetchingMetadata,
    Downloading,
    Archiving,
    Completed,
    PartiallyCompleted,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed
                | RunState::PartiallyCompleted
                | RunState::Cancelled
                | RunState::Failed
        )
    }
}

/// 运行结束后交给外部的结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub state: RunState,
    pub output: Option<PathBuf>,
    pub failures: FailureLog,
    pub pages: usize,
    /// 成功并入输出的章节数 / 选中的章节数。
    pub chapters_ok: usize,
    pub chapters_total: usize,
    pub error: Option<String>,
}

impl RunOutcome {
    pub(crate) fn cancelled(failures: FailureLog) -> Self {
        Self {
            state: RunState::Cancelled,
            output: None,
            failures,
            pages: 0,
            chapters_ok: 0,
            chapters_total: 0,
            error: None,
        }
    }

    pub(crate) fn failed(error: impl fmt::Display, failures: FailureLog) -> Self {
        Self {
            state: RunState::Failed,
            output: None,
            failures,
            pages: 0,
            chapters_ok: 0,
            chapters_total: 0,
            error: Some(error.to_string()),
        }
    }
}
