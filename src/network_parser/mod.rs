//! 网络层：浏览器画像客户端与作品页目录解析。

pub(crate) mod client;
pub mod manifest;
