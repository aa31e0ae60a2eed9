//! リクエストハンドラ

use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::ml::inference::Prediction;
use crate::server::SharedService;

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub classes: Vec<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error(status: StatusCode, message: String) -> ApiError {
    (status, Json(ErrorResponse { error: message }))
}

/// POST / と POST /predict
///
/// 本文が JSON として読めない場合も画像なしとして扱います。
pub async fn predict<B: Backend + 'static>(
    State(service): State<SharedService<B>>,
    body: Bytes,
) -> Result<Json<Prediction>, ApiError> {
    let image = serde_json::from_slice::<PredictRequest>(&body)
        .ok()
        .and_then(|req| req.image)
        .filter(|image| !image.trim().is_empty())
        .ok_or_else(|| error(StatusCode::BAD_REQUEST, "No image provided".to_string()))?;

    let result = tokio::task::spawn_blocking(move || service.predict_base64(&image))
        .await
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, format!("Error processing image: {}", e)))?;

    match result {
        Ok(prediction) => {
            tracing::debug!("予測: {} ({:.3})", prediction.class, prediction.confidence);
            Ok(Json(prediction))
        }
        Err(e) => {
            tracing::warn!("推論失敗: {:#}", e);
            Err(error(StatusCode::INTERNAL_SERVER_ERROR, format!("Error processing image: {:#}", e)))
        }
    }
}

/// GET /health
pub async fn health<B: Backend + 'static>(State(service): State<SharedService<B>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: service.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        classes: service.classes().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::leaf_image;
    use crate::ml::inference::{model_to_bytes, InferenceEngine};
    use crate::ml::ml_model::ModelConfig;
    use crate::model::{save_model_with_metadata, ModelMetadata};
    use crate::server::{router, InferenceService};
    use axum::body::Body;
    use axum::http::{header, Request};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use burn::backend::NdArray;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(dir: &std::path::Path) -> axum::Router {
        let device = Default::default();
        let config = ModelConfig::new(3).with_image_size(32);
        let model = config.init::<NdArray>(&device);
        let metadata = ModelMetadata::new(
            vec!["early_blight_leaf".into(), "healthy_leaf".into(), "late_blight_leaf".into()],
            config,
            1,
            0.0,
        );
        let path = save_model_with_metadata(&dir.join("model"), &metadata, &model_to_bytes(model).unwrap()).unwrap();
        let engine = InferenceEngine::<NdArray>::load(path, &device).unwrap();
        router(Arc::new(InferenceService::new(engine)))
    }

    fn post(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn png_base64() -> String {
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(leaf_image(64, 48, 5))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        STANDARD.encode(png)
    }

    #[tokio::test]
    async fn test_missing_image_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        for body in ["{}", r#"{"image": ""}"#, "not json"] {
            let response = app(dir.path()).oneshot(post("/predict", body.to_string())).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(json_body(response).await["error"], "No image provided");
        }
    }

    #[tokio::test]
    async fn test_undecodable_image_is_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let body = serde_json::json!({"image": STANDARD.encode(b"garbage bytes")}).to_string();
        let response = app(dir.path()).oneshot(post("/", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_body(response).await;
        assert!(json["error"].as_str().unwrap().starts_with("Error processing image:"));
    }

    #[tokio::test]
    async fn test_valid_png_returns_probabilities() {
        let dir = tempfile::tempdir().unwrap();
        let body = serde_json::json!({"image": format!("data:image/png;base64,{}", png_base64())}).to_string();
        let response = app(dir.path()).oneshot(post("/predict", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        let probs = json["all_probabilities"].as_object().unwrap();
        assert_eq!(probs.len(), 3);
        let sum: f64 = probs.values().map(|v| v.as_f64().unwrap()).sum();
        assert!((sum - 1.0).abs() < 1e-3);
        assert!(probs.contains_key(json["class"].as_str().unwrap()));
    }

    #[tokio::test]
    async fn test_preflight_is_answered() {
        let dir = tempfile::tempdir().unwrap();
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/predict")
            .header(header::ORIGIN, "http://example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap();
        let response = app(dir.path()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "3600");
    }

    #[tokio::test]
    async fn test_health_lists_classes() {
        let dir = tempfile::tempdir().unwrap();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app(dir.path()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["classes"].as_array().unwrap().len(), 3);
    }
}
