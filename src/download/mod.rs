//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`：数据模型（Manifest / DownloadRange / FailureLog / RunState 等）
//! - `strategy`：单章下载的三种方式
//! - `fetcher`：按顺序回退的单章下载
//! - `orchestrator`：逐章下载编排
//! - `progress`：事件通道与 CLI 进度条
//! - `pipeline`：单次运行的状态机

pub mod fetcher;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod strategy;
