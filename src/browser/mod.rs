//! 通过 Chromium DevTools 协议驱动真实浏览器。
//!
//! - `guard`：浏览器进程的作用域句柄，析构时关闭进程
//! - `refresher`：会话恢复（第三级下载方式）
//! - `login`：交互登录与页面监视

mod guard;
mod login;
mod refresher;

pub use login::ChromiumLogin;
pub use refresher::ChromiumRefresher;

use std::path::PathBuf;

use reqwest::Url;

use crate::base_system::context::Config;

const DOWNLOAD_SUFFIX: &str = "/download";

/// 按顺序查找浏览器：配置项 → `CHROME_PATH` → PATH 中的常见名称 → 常见安装位置。
pub fn find_chromium(cfg: &Config) -> Option<PathBuf> {
    let configured = cfg.browser_path.trim();
    if !configured.is_empty() {
        let path = PathBuf::from(configured);
        if path.exists() {
            return Some(path);
        }
    }

    if let Ok(p) = std::env::var("CHROME_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    for name in [
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
        "chrome",
    ] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    let common: &[&str] = if cfg!(target_os = "macos") {
        &["/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    } else {
        &[]
    };
    common.iter().map(PathBuf::from).find(|p| p.exists())
}

/// cookies 的作用域：站点主机名前加点，覆盖所有子域。
pub(crate) fn cookie_domain(base_url: &str) -> Option<String> {
    let url = Url::parse(base_url).ok()?;
    let host = url.host_str()?;
    Some(format!(".{}", host.trim_start_matches("www.")))
}

/// 用户点击“下载”后地址以 `/download` 结尾；去掉后缀即作品地址。
pub(crate) fn manga_url_from_trigger(url: &str) -> Option<String> {
    let trimmed = url.trim_end_matches('/');
    trimmed
        .strip_suffix(DOWNLOAD_SUFFIX)
        .filter(|rest| !rest.is_empty())
        .map(str::to_string)
}

/// 作品页形如 `https://host/<id>-<slug>.html`。
pub(crate) fn is_manga_page(url: &str) -> bool {
    Url::parse(url)
        .map(|u| u.path().ends_with(".html"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_domain_covers_subdomains() {
        assert_eq!(
            cookie_domain("https://com-x.life").as_deref(),
            Some(".com-x.life")
        );
        assert_eq!(
            cookie_domain("https://www.com-x.life/").as_deref(),
            Some(".com-x.life")
        );
        assert_eq!(cookie_domain("not a url"), None);
    }

    #[test]
    fn download_trigger_strips_suffix() {
        assert_eq!(
            manga_url_from_trigger("https://com-x.life/77-berserk.html/download").as_deref(),
            Some("https://com-x.life/77-berserk.html")
        );
        assert_eq!(manga_url_from_trigger("https://com-x.life/77-berserk.html"), None);
        assert_eq!(manga_url_from_trigger("/download"), None);
    }

    #[test]
    fn manga_pages_are_html_documents() {
        assert!(is_manga_page("https://com-x.life/77-berserk.html"));
        assert!(is_manga_page("https://com-x.life/77-berserk.html?page=2"));
        assert!(!is_manga_page("https://com-x.life/"));
        assert!(!is_manga_page("https://com-x.life/77-berserk.html/download"));
    }

    #[test]
    fn configured_browser_path_wins_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("chrome-bin");
        std::fs::write(&fake, b"").unwrap();
        let cfg = Config {
            browser_path: fake.to_string_lossy().into_owned(),
            ..Config::default()
        };
        assert_eq!(find_chromium(&cfg), Some(fake));
    }
}
