#![recursion_limit = "256"]

// データセット処理
pub mod dataset;
pub mod error;
pub mod logging;

// 学習・推論
pub mod ml;
pub mod model;

// 出力・配信
pub mod export;
pub mod server;

// CLI
pub mod commands;
pub mod workflow;
