//! 将各章压缩包中的图片按阅读顺序合并为一个 CBZ。
//!
//! 全局页码从 1 开始单调递增，跨章不重置；读不出的章节整章跳过但不影响编号连续。

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::download::models::ChapterArchive;

pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "webp", "bmp"];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("no pages were archived")]
    NoContentArchived,
    #[error("archiving cancelled")]
    Cancelled,
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("zip write failed: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// 单章压缩包无法读取；该章被跳过。
#[derive(Debug, Error)]
#[error("cannot read {path}: {reason}")]
pub struct ArchiveEntryError {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub output: PathBuf,
    pub pages: usize,
    pub chapters_merged: usize,
    pub chapters_total: usize,
    pub skipped: Vec<PathBuf>,
}

pub struct ArchiveBuilder {
    scratch_dir: PathBuf,
    cancel: Option<Arc<AtomicBool>>,
}

impl ArchiveBuilder {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// 按 `seq` 升序合并；任何失败（含取消、零页）都会删除已创建的输出文件。
    pub fn build(
        &self,
        chapters: &[ChapterArchive],
        output: &Path,
    ) -> Result<MergeReport, ArchiveError> {
        info!(target: "archive", "打包为 CBZ: {}", output.display());
        let result = self.build_inner(chapters, output);
        if result.is_err() && output.exists() {
            let _ = fs::remove_file(output);
        }
        result
    }

    fn build_inner(
        &self,
        chapters: &[ChapterArchive],
        output: &Path,
    ) -> Result<MergeReport, ArchiveError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ArchiveError::Io { path, source }
        };

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        fs::create_dir_all(&self.scratch_dir).map_err(io_err(&self.scratch_dir))?;

        let file = File::create(output).map_err(io_err(output))?;
        let mut writer = ZipWriter::new(BufWriter::new(file));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        let mut ordered: Vec<&ChapterArchive> = chapters.iter().collect();
        ordered.sort_by_key(|c| c.seq);

        let mut next_index = 1usize;
        let mut merged = 0usize;
        let mut skipped = Vec::new();

        for chapter in ordered {
            if self.cancelled() {
                warn!(target: "archive", "打包已取消");
                return Err(ArchiveError::Cancelled);
            }
            let name = chapter
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            info!(target: "archive", "处理: {}", name);

            let mut source = match open_chapter(&chapter.path) {
                Ok(zip) => zip,
                Err(e) => {
                    warn!(target: "archive", "跳过无法读取的章节 {}: {}", name, e.reason);
                    skipped.push(chapter.path.clone());
                    continue;
                }
            };

            let pages = self.append_pages(&mut source, &mut writer, options, &mut next_index)?;
            info!(target: "archive", "  本章页数: {}", pages);
            merged += 1;
        }

        writer.finish()?;

        let pages = next_index - 1;
        info!(target: "archive", "总页数: {}", pages);
        info!(target: "archive", "成功处理章节: {}/{}", merged, chapters.len());

        if pages == 0 {
            warn!(target: "archive", "没有任何页面被打包");
            return Err(ArchiveError::NoContentArchived);
        }

        Ok(MergeReport {
            output: output.to_path_buf(),
            pages,
            chapters_merged: merged,
            chapters_total: chapters.len(),
            skipped,
        })
    }

    /// 按文件名字典序追加本章图片，返回追加的页数。
    fn append_pages<W: io::Write + io::Seek>(
        &self,
        source: &mut ZipArchive<File>,
        writer: &mut ZipWriter<W>,
        options: FileOptions,
        next_index: &mut usize,
    ) -> Result<usize, ArchiveError> {
        let mut names: Vec<String> = source.file_names().map(str::to_string).collect();
        names.sort();

        let mut appended = 0;
        for entry_name in names {
            if self.cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            let Some(ext) = image_extension(&entry_name) else {
                continue;
            };

            let out_name = format!("{:06}.{}", *next_index, ext);
            let scratch = self.scratch_dir.join(&out_name);
            if let Err(e) = extract_entry(source, &entry_name, &scratch) {
                warn!(target: "archive", "  跳过损坏的条目 {}: {}", entry_name, e);
                let _ = fs::remove_file(&scratch);
                continue;
            }

            writer.start_file(out_name.as_str(), options)?;
            let mut page = File::open(&scratch).map_err(|source| ArchiveError::Io {
                path: scratch.clone(),
                source,
            })?;
            io::copy(&mut page, writer).map_err(|source| ArchiveError::Io {
                path: scratch.clone(),
                source,
            })?;
            drop(page);
            let _ = fs::remove_file(&scratch);

            *next_index += 1;
            appended += 1;
        }
        Ok(appended)
    }
}

fn open_chapter(path: &Path) -> Result<ZipArchive<File>, ArchiveEntryError> {
    let fail = |reason: String| ArchiveEntryError {
        path: path.to_path_buf(),
        reason,
    };
    let file = File::open(path).map_err(|e| fail(e.to_string()))?;
    ZipArchive::new(file).map_err(|e| fail(e.to_string()))
}

fn extract_entry(source: &mut ZipArchive<File>, name: &str, dest: &Path) -> io::Result<()> {
    let mut entry = source
        .by_name(name)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut out = File::create(dest)?;
    io::copy(&mut entry, &mut out)?;
    Ok(())
}

/// 图片条目的小写扩展名；目录与非图片返回 `None`。
pub fn image_extension(entry_name: &str) -> Option<String> {
    if entry_name.ends_with('/') {
        return None;
    }
    let ext = Path::new(entry_name)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    IMAGE_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}
