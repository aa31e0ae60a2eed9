//! 推論 HTTP サーバー
//!
//! 起動時にモデルバンドルを1度だけ読み込み、[`InferenceService`] として
//! 全リクエストで共有します。

pub mod handlers;

use anyhow::{Context, Result};
use axum::{
    http::{header::CONTENT_TYPE, Method},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use burn::tensor::backend::Backend;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::ml::inference::{InferenceEngine, Prediction};

/// プロセス全体で共有する推論サービス
pub struct InferenceService<B: Backend> {
    engine: Mutex<InferenceEngine<B>>,
    classes: Vec<String>,
    started_at: Instant,
}

pub type SharedService<B> = Arc<InferenceService<B>>;

impl<B: Backend> InferenceService<B> {
    pub fn new(engine: InferenceEngine<B>) -> Self {
        let classes = engine.config().class_labels.clone();
        Self {
            engine: Mutex::new(engine),
            classes,
            started_at: Instant::now(),
        }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// base64 文字列（`data:image/...;base64,` 付きでも可）を分類
    pub fn predict_base64(&self, encoded: &str) -> Result<Prediction> {
        let payload = strip_data_url(encoded.trim());
        let bytes = STANDARD.decode(payload).context("Invalid base64 image")?;
        let engine = self
            .engine
            .lock()
            .map_err(|_| anyhow::anyhow!("推論エンジンのロックに失敗しました"))?;
        engine.classify_bytes(&bytes)
    }
}

/// `data:<mime>;base64,` の接頭辞を取り除く
pub fn strip_data_url(encoded: &str) -> &str {
    if encoded.starts_with("data:") {
        if let Some((_, rest)) = encoded.split_once(',') {
            return rest;
        }
    }
    encoded
}

/// ルーターを構築
pub fn router<B: Backend + 'static>(service: SharedService<B>) -> Router {
    Router::new()
        .route("/", post(handlers::predict::<B>))
        .route("/predict", post(handlers::predict::<B>))
        .route("/health", get(handlers::health::<B>))
        .with_state(service)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::POST, Method::OPTIONS])
                .allow_headers([CONTENT_TYPE])
                .max_age(Duration::from_secs(3600)),
        )
}

/// サーバーを起動（終了するまで戻らない）
pub async fn serve<B: Backend + 'static>(service: SharedService<B>, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context(format!("Invalid address: {}:{}", host, port))?;
    tracing::info!("推論サーバーを起動します: http://{}", addr);
    tracing::info!("クラス: {}", service.classes().join(", "));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind {}", addr))?;
    axum::serve(listener, router(service)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_data_url() {
        assert_eq!(strip_data_url("data:image/png;base64,AAAA"), "AAAA");
        assert_eq!(strip_data_url("AAAA"), "AAAA");
        assert_eq!(strip_data_url("data:broken"), "data:broken");
    }
}
