//! HTTP surface of the face registry.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use facevault_core::{ErrorKind, FaceSummary, Registry, RegistryError};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

type SharedState = Arc<Registry>;

/// Error body returned for every failed request: `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let status = match e.kind() {
            ErrorKind::ClientInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Internal => {
                tracing::error!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

pub fn router(registry: Arc<Registry>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/register-face/{face_id}", post(register_face))
        .route("/registered-faces", get(list_faces))
        .route("/face/{face_id}", get(get_face).delete(delete_face))
        .route("/face/{face_id}/image", get(get_face_image))
        .route("/verify-face/{face_id}", post(verify_face))
        .route("/search-face", post(search_face))
        .route("/compare-faces", post(compare_faces))
        .with_state(registry)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Run registry work off the async runtime; extraction and SQLite both block.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, RegistryError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "blocking task failed");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal task failure")
        })?
        .map_err(ApiError::from)
}

/// Collect the named file fields of a multipart upload.
async fn read_fields(mut multipart: Multipart) -> Result<HashMap<String, Bytes>, ApiError> {
    let mut fields = HashMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(e.status(), e.body_text()))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
        fields.insert(name, data);
    }
    Ok(fields)
}

fn take_field(fields: &mut HashMap<String, Bytes>, name: &str) -> Result<Bytes, ApiError> {
    fields
        .remove(name)
        .ok_or_else(|| ApiError::bad_request(format!("missing multipart field `{name}`")))
}

async fn root(State(registry): State<SharedState>) -> impl IntoResponse {
    let matcher = registry.matcher();
    Json(json!({
        "message": "Face recognition service is running",
        "version": env!("CARGO_PKG_VERSION"),
        "registered_faces": registry.store().len(),
        "metric": matcher.metric(),
        "threshold": matcher.threshold(),
        "model_version": registry.model_version(),
    }))
}

async fn register_face(
    State(registry): State<SharedState>,
    Path(face_id): Path<String>,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let image = take_field(&mut read_fields(multipart).await?, "image")?;

    let id = face_id.clone();
    let record = blocking(move || registry.register(&id, &image)).await?;

    Ok(Json(json!({
        "message": format!("Face registered successfully with ID: {face_id}"),
        "face_id": record.identity,
        "dimension": record.embedding.dimension(),
    })))
}

async fn list_faces(State(registry): State<SharedState>) -> impl IntoResponse {
    Json(json!({ "registered_faces": registry.list() }))
}

async fn get_face(
    State(registry): State<SharedState>,
    Path(face_id): Path<String>,
) -> Result<Json<FaceSummary>, ApiError> {
    let record = registry.get(&face_id)?;
    Ok(Json(FaceSummary::from(&record)))
}

async fn get_face_image(
    State(registry): State<SharedState>,
    Path(face_id): Path<String>,
) -> Result<Response, ApiError> {
    let record = registry.get(&face_id)?;
    let bytes = record.image.ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            format!("no stored image for face with ID {face_id}"),
        )
    })?;

    let mime = image::guess_format(&bytes)
        .map(|f| f.to_mime_type())
        .unwrap_or("application/octet-stream");
    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}

async fn delete_face(
    State(registry): State<SharedState>,
    Path(face_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = face_id.clone();
    let removed = blocking(move || registry.delete(&id)).await?;
    if !removed {
        return Err(RegistryError::IdentityNotFound(face_id).into());
    }
    Ok(Json(json!({
        "message": format!("Face with ID {face_id} deleted successfully"),
    })))
}

async fn verify_face(
    State(registry): State<SharedState>,
    Path(face_id): Path<String>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let image = take_field(&mut read_fields(multipart).await?, "image")?;
    let comparison = blocking(move || registry.verify(&face_id, &image)).await?;
    Ok(Json(comparison))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    limit: Option<usize>,
}

async fn search_face(
    State(registry): State<SharedState>,
    Query(params): Query<SearchParams>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let image = take_field(&mut read_fields(multipart).await?, "image")?;
    let matches = blocking(move || registry.search(&image, params.limit)).await?;
    Ok(Json(matches))
}

async fn compare_faces(
    State(registry): State<SharedState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut fields = read_fields(multipart).await?;
    let source = take_field(&mut fields, "source_image")?;
    let target = take_field(&mut fields, "target_image")?;
    let comparison = blocking(move || registry.compare(&source, &target)).await?;
    Ok(Json(comparison))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use facevault_core::{
        Embedding, EmbeddingExtractor, ExtractionError, FaceStore, Matcher, Metric,
    };
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use serde_json::Value;
    use std::io::Cursor;
    use tower::ServiceExt;

    /// Embeds the top-left pixel. Black has no face, pure red has two.
    struct PixelExtractor;

    impl EmbeddingExtractor for PixelExtractor {
        fn extract(&self, image: &DynamicImage) -> Result<Embedding, ExtractionError> {
            let [r, g, b] = image.to_rgb8().get_pixel(0, 0).0;
            match (r, g, b) {
                (0, 0, 0) => Err(ExtractionError::NoFaceDetected),
                (255, 0, 0) => Err(ExtractionError::AmbiguousFace { faces: 2 }),
                _ => Ok(Embedding::new(vec![r as f32, g as f32, b as f32])),
            }
        }

        fn model_version(&self) -> Option<&str> {
            Some("pixel-test")
        }
    }

    fn png(color: [u8; 3]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        RgbImage::from_pixel(4, 4, Rgb(color))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn app() -> Router {
        app_with_limit(1024 * 1024)
    }

    fn app_with_limit(limit: usize) -> Router {
        let registry = Registry::new(
            Arc::new(FaceStore::open_in_memory().unwrap()),
            Arc::new(PixelExtractor),
            Matcher::new(Metric::Cosine),
        );
        router(Arc::new(registry), limit)
    }

    const BOUNDARY: &str = "facevault-test-boundary";

    fn multipart_request(uri: &str, parts: &[(&str, Vec<u8>)]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, bytes) in parts {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; \
                     filename=\"{name}.png\"\r\nContent-Type: image/png\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send(app, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn register(app: &Router, id: &str, color: [u8; 3]) {
        let (status, _) = send(
            app,
            multipart_request(&format!("/register-face/{id}"), &[("image", png(color))]),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "registering {id}");
    }

    #[tokio::test]
    async fn test_root_reports_status() {
        let app = app();
        register(&app, "alice", [10, 200, 30]).await;

        let (status, body) = send_json(&app, request("GET", "/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["registered_faces"], 1);
        assert_eq!(body["metric"], "cosine");
        assert_eq!(body["model_version"], "pixel-test");
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let app = app();
        let (status, body) = send_json(
            &app,
            multipart_request("/register-face/bob", &[("image", png([1, 2, 3]))]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Face registered successfully with ID: bob");
        assert_eq!(body["dimension"], 3);

        register(&app, "alice", [3, 2, 1]).await;
        let (_, body) = send_json(&app, request("GET", "/registered-faces")).await;
        assert_eq!(body, json!({ "registered_faces": ["alice", "bob"] }));
    }

    #[tokio::test]
    async fn test_register_without_face_is_bad_request() {
        let app = app();
        let (status, body) = send_json(
            &app,
            multipart_request("/register-face/ghost", &[("image", png([0, 0, 0]))]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "no face detected");

        let (_, body) = send_json(&app, request("GET", "/registered-faces")).await;
        assert_eq!(body["registered_faces"], json!([]));
    }

    #[tokio::test]
    async fn test_register_ambiguous_and_undecodable() {
        let app = app();
        let (status, _) = send(
            &app,
            multipart_request("/register-face/crowd", &[("image", png([255, 0, 0]))]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send_json(
            &app,
            multipart_request("/register-face/junk", &[("image", b"not an image".to_vec())]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().starts_with("invalid image"));
    }

    #[tokio::test]
    async fn test_missing_field_is_bad_request() {
        let app = app();
        let (status, body) = send_json(
            &app,
            multipart_request("/register-face/a", &[("photo", png([1, 1, 1]))]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "missing multipart field `image`");
    }

    #[tokio::test]
    async fn test_get_face_and_image() {
        let app = app();
        let image = png([9, 8, 7]);
        send(&app, multipart_request("/register-face/carol", &[("image", image.clone())])).await;

        let (status, body) = send_json(&app, request("GET", "/face/carol")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["face_id"], "carol");
        assert_eq!(body["has_image"], true);

        let resp = app.clone().oneshot(request("GET", "/face/carol/image")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), image.as_slice());

        let (status, _) = send(&app, request("GET", "/face/nobody")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_face() {
        let app = app();
        register(&app, "dave", [5, 5, 5]).await;

        let (status, body) = send_json(&app, request("DELETE", "/face/dave")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Face with ID dave deleted successfully");

        let (status, body) = send_json(&app, request("DELETE", "/face/dave")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["detail"], "face with ID dave not found");
    }

    #[tokio::test]
    async fn test_verify_face() {
        let app = app();
        register(&app, "erin", [10, 200, 30]).await;

        let (status, body) = send_json(
            &app,
            multipart_request("/verify-face/erin", &[("image", png([10, 200, 30]))]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["verified"], true);
        assert_eq!(body["metric"], "cosine");

        let (_, body) = send_json(
            &app,
            multipart_request("/verify-face/erin", &[("image", png([200, 10, 30]))]),
        )
        .await;
        assert_eq!(body["verified"], false);

        let (status, _) = send(
            &app,
            multipart_request("/verify-face/nobody", &[("image", png([10, 200, 30]))]),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_search_orders_and_limits() {
        let app = app();
        register(&app, "x", [10, 200, 30]).await;
        register(&app, "y", [200, 10, 30]).await;
        register(&app, "z", [30, 10, 200]).await;

        let (status, body) = send_json(
            &app,
            multipart_request("/search-face", &[("image", png([12, 198, 31]))]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let results = body.as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["face_id"], "x");
        assert_eq!(results[0]["verified"], true);
        let distances: Vec<f64> = results.iter().map(|r| r["distance"].as_f64().unwrap()).collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));

        let (_, body) = send_json(
            &app,
            multipart_request("/search-face?limit=1", &[("image", png([12, 198, 31]))]),
        )
        .await;
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_search_empty_registry() {
        let app = app();
        let (status, body) = send_json(
            &app,
            multipart_request("/search-face", &[("image", png([1, 2, 3]))]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_compare_faces() {
        let app = app();
        let (status, body) = send_json(
            &app,
            multipart_request(
                "/compare-faces",
                &[
                    ("source_image", png([40, 50, 60])),
                    ("target_image", png([40, 50, 60])),
                ],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["verified"], true);
        assert!(body["distance"].as_f64().unwrap().abs() < 1e-6);

        let (status, _) = send(
            &app,
            multipart_request("/compare-faces", &[("source_image", png([40, 50, 60]))]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Nothing was registered along the way.
        let (_, body) = send_json(&app, request("GET", "/registered-faces")).await;
        assert_eq!(body["registered_faces"], json!([]));
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected() {
        let app = app_with_limit(256);
        let big = vec![7u8; 4096];
        let (status, _) = send(
            &app,
            multipart_request("/register-face/big", &[("image", big)]),
        )
        .await;
        assert!(status.is_client_error(), "status {status}");

        let (_, body) = send_json(&app, request("GET", "/registered-faces")).await;
        assert_eq!(body["registered_faces"], json!([]));
    }
}
