//! Axum JSON API for triggering import runs.
//!
//! One endpoint does the work: `POST /import` takes a multipart upload with a
//! `file` part and a `phase` part. Malformed requests are rejected before any
//! row is processed; a well-formed request always gets the full per-row
//! outcome report back, however many rows failed.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tracing::warn;

use teim_core::ImportPhase;
use teim_storage::{Backend, MemoryBackend, PgBackend};
use teim_sync::{ImportConfig, ImportEngine};

pub const CRATE_NAME: &str = "teim-web";

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn Backend>,
    pub config: ImportConfig,
}

impl AppState {
    pub fn new(backend: Arc<dyn Backend>, config: ImportConfig) -> Self {
        Self { backend, config }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/import", post(import_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TEIM_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);

    let backend: Arc<dyn Backend> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let backend = PgBackend::connect(&url).await?;
            backend.ensure_schema().await?;
            Arc::new(backend)
        }
        Err(_) => {
            warn!("DATABASE_URL unset, imports go to a process-local memory store");
            Arc::new(MemoryBackend::new())
        }
    };

    let state = AppState::new(backend, ImportConfig::from_env());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn import_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Response {
    let mut phase_raw: Option<String> = None;
    let mut file: Option<Vec<u8>> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return bad_request(format!("malformed multipart body: {err}")),
        };
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("phase") => match field.text().await {
                Ok(text) => phase_raw = Some(text),
                Err(err) => return bad_request(format!("unreadable phase field: {err}")),
            },
            Some("file") => match field.bytes().await {
                Ok(bytes) => file = Some(bytes.to_vec()),
                Err(err) => return bad_request(format!("unreadable file field: {err}")),
            },
            _ => {}
        }
    }

    // Structural rejects happen before any row is touched.
    let Some(phase_raw) = phase_raw else {
        return bad_request("missing phase field".to_string());
    };
    let phase = match ImportPhase::from_str(&phase_raw) {
        Ok(phase) => phase,
        Err(err) => return bad_request(err),
    };
    let Some(file) = file else {
        return bad_request("missing file field".to_string());
    };

    let engine = ImportEngine::new(state.backend.as_ref(), state.config.clone());
    match engine.run(&file, phase).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "success": false, "error": err.to_string() })),
        )
            .into_response(),
    }
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "success": false, "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const BOUNDARY: &str = "teim-test-boundary";

    fn test_app() -> Router {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        app(AppState::new(backend, ImportConfig::default()))
    }

    fn multipart_body(phase: Option<&str>, file: Option<&[u8]>) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some(phase) = phase {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"phase\"\r\n\r\n{phase}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some(file) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"import.csv\"\r\nContent-Type: text/csv\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(file);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn import_request(phase: Option<&str>, file: Option<&[u8]>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/import")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(phase, file)))
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let resp = test_app()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_phase_is_rejected_before_processing() {
        let resp = test_app()
            .oneshot(import_request(None, Some(b"dni;name\n12345678Z;Ana\n")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_phase_is_rejected() {
        let resp = test_app()
            .oneshot(import_request(Some("moodle"), Some(b"dni\n12345678Z\n")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_file_is_rejected() {
        let resp = test_app()
            .oneshot(import_request(Some("users"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn users_upload_returns_the_outcome_report() {
        let resp = test_app()
            .oneshot(import_request(
                Some("users"),
                Some(b"dni;name;surname1\n12345678Z;Ana;Garcia\n"),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["phase"], "users");
        assert_eq!(json["results"].as_array().unwrap().len(), 1);
        assert_eq!(json["results"][0]["status"], "ok");
    }

    #[tokio::test]
    async fn row_failures_still_return_a_full_report() {
        // Second row has no identity signal at all; the run must finish and
        // report it as skipped.
        let csv = b"dni;name\n12345678Z;Ana\n;\n";
        let resp = test_app()
            .oneshot(import_request(Some("users"), Some(csv)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ok"], 1);
        assert_eq!(json["skipped"], 1);
        assert_eq!(
            json["results"][1]["reason"],
            "insufficient_user_data"
        );
    }
}
