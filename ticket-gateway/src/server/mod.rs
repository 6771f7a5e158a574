//! サーバー層（HTTP）

pub mod http;
