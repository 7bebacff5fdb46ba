//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息，以及文件名清洗工具。

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigError, ConfigSpec, FieldMeta};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 站点配置
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // 会话配置
    #[serde(default = "default_cookie_file")]
    pub cookie_file: String,

    // 网络配置
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_strategy_pause_ms")]
    pub strategy_pause_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_download_timeout")]
    pub download_timeout: u64,
    #[serde(default = "default_impersonate_timeout")]
    pub impersonate_timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    // 浏览器配置
    #[serde(default = "default_true")]
    pub enable_session_recovery: bool,
    #[serde(default = "default_recovery_settle_ms")]
    pub recovery_settle_ms: u64,
    #[serde(default)]
    pub browser_path: String,
    #[serde(default = "default_false")]
    pub headless_recovery: bool,

    // 路径配置
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    #[serde(default)]
    pub save_path: String,

    #[serde(skip)]
    pub(crate) data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            cookie_file: default_cookie_file(),
            request_delay_ms: default_request_delay_ms(),
            strategy_pause_ms: default_strategy_pause_ms(),
            request_timeout: default_request_timeout(),
            download_timeout: default_download_timeout(),
            impersonate_timeout: default_impersonate_timeout(),
            connect_timeout: default_connect_timeout(),
            enable_session_recovery: default_true(),
            recovery_settle_ms: default_recovery_settle_ms(),
            browser_path: String::new(),
            headless_recovery: default_false(),
            download_dir: default_download_dir(),
            temp_dir: default_temp_dir(),
            save_path: String::new(),
            data_dir: None,
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 16] = [
            FieldMeta {
                name: "base_url",
                description: "站点根地址（章节 API 与 Origin 头均基于此地址）",
            },
            FieldMeta {
                name: "user_agent",
                description: "请求与浏览器使用的 User-Agent",
            },
            FieldMeta {
                name: "cookie_file",
                description: "会话 cookies 保存文件（相对数据目录）",
            },
            FieldMeta {
                name: "request_delay_ms",
                description: "每章下载后的固定间隔, 单位ms",
            },
            FieldMeta {
                name: "strategy_pause_ms",
                description: "两种下载方式之间的停顿, 单位ms",
            },
            FieldMeta {
                name: "request_timeout",
                description: "反爬客户端解析下载地址的超时时间（秒）",
            },
            FieldMeta {
                name: "download_timeout",
                description: "反爬客户端下载章节压缩包的超时时间（秒）",
            },
            FieldMeta {
                name: "impersonate_timeout",
                description: "浏览器指纹客户端单次请求的超时时间（秒）",
            },
            FieldMeta {
                name: "connect_timeout",
                description: "连接超时时间（秒）",
            },
            FieldMeta {
                name: "enable_session_recovery",
                description: "前两种方式失败时是否启动浏览器刷新会话后重试",
            },
            FieldMeta {
                name: "recovery_settle_ms",
                description: "会话恢复时页面刷新后的等待时间, 单位ms",
            },
            FieldMeta {
                name: "browser_path",
                description: "Chrome/Chromium 可执行文件路径（留空自动查找）",
            },
            FieldMeta {
                name: "headless_recovery",
                description: "会话恢复时是否使用无头浏览器",
            },
            FieldMeta {
                name: "download_dir",
                description: "章节压缩包下载目录（每次运行前后清空）",
            },
            FieldMeta {
                name: "temp_dir",
                description: "合并 CBZ 时的临时目录（每次运行前后清空）",
            },
            FieldMeta {
                name: "save_path",
                description: "CBZ 保存路径（留空为当前目录）",
            },
        ];
        &FIELDS
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if reqwest::Url::parse(&self.base_url).is_err() {
            return Err(ConfigError::Validation(format!(
                "base_url 不是合法地址: {}",
                self.base_url
            )));
        }
        if self.download_dir.trim().is_empty() || self.temp_dir.trim().is_empty() {
            return Err(ConfigError::Validation(
                "download_dir 与 temp_dir 不能为空".to_string(),
            ));
        }
        self.check_workspace()
    }
}

impl Config {
    /// 记录数据目录，相对路径（cookies、下载目录）都基于它解析。
    pub fn with_data_dir(mut self, dir: Option<&Path>) -> Self {
        self.data_dir = dir.map(Path::to_path_buf);
        self
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let path = PathBuf::from(raw);
        match &self.data_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }

    fn data_root(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// 下载目录与临时目录每次运行前后都会被整体删除，
    /// 因此必须是独立子目录，且不能包含数据目录、cookies 文件或 CBZ 保存目录。
    pub fn check_workspace(&self) -> Result<(), ConfigError> {
        for (field, raw) in [("download_dir", &self.download_dir), ("temp_dir", &self.temp_dir)] {
            let dir = Path::new(raw.trim());
            let escapes = dir.components().any(|c| c == Component::ParentDir);
            if escapes || dir.file_name().is_none() {
                return Err(ConfigError::Validation(format!(
                    "{field} 必须是独立的子目录: {raw:?}"
                )));
            }
        }

        let protected = [
            ("数据目录", self.data_root()),
            ("cookies 文件", self.cookie_path()),
            ("save_path", self.default_save_dir()),
        ];
        for owned in [self.download_path(), self.temp_path()] {
            let owned = lexical_absolute(&owned);
            for (what, path) in &protected {
                if lexical_absolute(path).starts_with(&owned) {
                    return Err(ConfigError::Validation(format!(
                        "{} 每次运行都会被清空，不能包含{}: {}",
                        owned.display(),
                        what,
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn cookie_path(&self) -> PathBuf {
        self.resolve(&self.cookie_file)
    }

    pub fn download_path(&self) -> PathBuf {
        self.resolve(&self.download_dir)
    }

    pub fn temp_path(&self) -> PathBuf {
        self.resolve(&self.temp_dir)
    }

    pub fn default_save_dir(&self) -> PathBuf {
        if self.save_path.trim().is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(&self.save_path)
        }
    }

    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn strategy_pause(&self) -> Duration {
        Duration::from_millis(self.strategy_pause_ms)
    }

    pub fn recovery_settle(&self) -> Duration {
        Duration::from_millis(self.recovery_settle_ms)
    }
}

/// 转为绝对路径并按字面消去 `.` 与 `..`（不访问文件系统）。
fn lexical_absolute(path: &Path) -> PathBuf {
    let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for component in abs.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// 将任意标题转为可安全用作文件名的形式：非单词字符（保留 `-` 与空格）替换为 `_`。
pub fn safe_fs_name(name: &str, max_len: usize) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|ch| match ch {
            '-' | ' ' | '_' => ch,
            c if c.is_alphanumeric() => c,
            _ => '_',
        })
        .collect();

    while cleaned.ends_with(' ') {
        cleaned.pop();
    }
    if cleaned.is_empty() {
        cleaned.push_str("unnamed");
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if RESERVED.contains(&cleaned.to_uppercase().as_str()) {
        cleaned = format!("_{}", cleaned);
    }

    if cleaned.len() > max_len {
        // 避免在多字节 UTF-8 字符中间截断
        let mut end = max_len;
        while end > 0 && !cleaned.is_char_boundary(end) {
            end -= 1;
        }
        cleaned.truncate(end);
        while cleaned.ends_with(' ') {
            cleaned.pop();
        }
        if cleaned.is_empty() {
            cleaned.push_str("unnamed");
        }
    }

    cleaned
}

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "https://com-x.life".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}

fn default_cookie_file() -> String {
    "comx_life_cookies_v3.json".to_string()
}

fn default_request_delay_ms() -> u64 {
    1500
}

fn default_strategy_pause_ms() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_download_timeout() -> u64 {
    60
}

fn default_impersonate_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_recovery_settle_ms() -> u64 {
    2000
}

fn default_download_dir() -> String {
    "downloads".to_string()
}

fn default_temp_dir() -> String {
    "combined_cbz_temp".to_string()
}
