//! 单次运行独占的工作目录（章节下载目录 + 合并临时目录）。
//!
//! 运行开始时清掉上一次的残留并重新创建，运行结束（含取消、失败）时整体删除。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

pub struct Workspace {
    download_dir: PathBuf,
    scratch_dir: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn acquire(download_dir: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let ws = Self {
            download_dir: download_dir.into(),
            scratch_dir: scratch_dir.into(),
            released: false,
        };
        ws.purge();
        fs::create_dir_all(&ws.download_dir)?;
        fs::create_dir_all(&ws.scratch_dir)?;
        Ok(ws)
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// 删除两个目录。消费 `self`，释放后不能再引用其中的路径。
    pub fn release(mut self) {
        self.purge();
        self.released = true;
    }

    fn purge(&self) {
        for dir in [&self.download_dir, &self.scratch_dir] {
            if !dir.exists() {
                continue;
            }
            match fs::remove_dir_all(dir) {
                Ok(()) => info!(target: "download", "已清理: {}", dir.display()),
                Err(e) => debug!(target: "download", "清理 {} 失败(忽略): {}", dir.display(), e),
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            self.purge();
        }
    }
}
