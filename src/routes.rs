use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::cleanup::GuardedStream;
use crate::config::Settings;
use crate::downloader;
use crate::error::ApiError;
use crate::lister;
use crate::media::{content_disposition, MediaInfo};
use crate::provider::MediaProvider;

// ============= Application State =============

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub provider: Arc<dyn MediaProvider>,
}

impl AppState {
    pub fn new(settings: Settings, provider: Arc<dyn MediaProvider>) -> Self {
        Self {
            settings: Arc::new(settings),
            provider,
        }
    }
}

// ============= Request Models =============

#[derive(Deserialize)]
struct FormatsQuery {
    url: String,
}

#[derive(Deserialize)]
struct DownloadQuery {
    url: String,
    format_id: String,
}

// ============= Handlers =============

/// GET /formats: title, thumbnail and downloadable formats for a URL
async fn formats_handler(
    State(state): State<AppState>,
    Query(query): Query<FormatsQuery>,
) -> Result<Json<MediaInfo>, ApiError> {
    lister::list_formats(state.provider.as_ref(), &query.url)
        .await
        .map(Json)
        .map_err(|e| {
            error!("Format listing failed for {}: {e}", query.url);
            ApiError::Discovery(e.to_string())
        })
}

/// GET /download: fetch one format and stream it back as an attachment
async fn download_handler(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let done = downloader::download(
        state.provider.as_ref(),
        &state.settings,
        &query.url,
        &query.format_id,
    )
    .await
    .map_err(|e| {
        error!(
            "Download of format {} failed for {}: {e}",
            query.format_id, query.url
        );
        ApiError::Download(e.to_string())
    })?;

    // Any early return from here on drops `done`, removing the work dir.
    let file = tokio::fs::File::open(&done.file_path)
        .await
        .map_err(|e| ApiError::Download(format!("Failed to open downloaded file: {e}")))?;
    let disposition = HeaderValue::from_str(&content_disposition(&done.display_filename))
        .map_err(|e| ApiError::Download(format!("Invalid filename header: {e}")))?;

    let body = Body::from_stream(GuardedStream::new(ReaderStream::new(file), done.workspace));

    let mut resp = Response::new(body);
    *resp.status_mut() = StatusCode::OK;
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(done.mime_type));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(done.size_bytes));
    Ok(resp)
}

/// GET /health: liveness and active backend
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Json(serde_json::json!({
        "status": "ok",
        "backend": state.provider.name(),
        "timestamp": now,
    }))
}

/// 404 handler
async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"detail": "Route not found"})),
    )
}

// ============= Router =============

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            header::CONTENT_DISPOSITION,
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
        ]);

    Router::new()
        .route("/formats", get(formats_handler))
        .route("/download", get(download_handler))
        .route("/health", get(health_handler))
        .fallback(not_found_handler)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::error::{ProviderError, Result};
    use crate::media::{AudioRule, MediaStream, StreamKind};
    use crate::provider::piped::PipedProvider;
    use crate::provider::ResolvedMedia;

    /// Backend fake: knows "good" URLs, writes `<id>-bytes` as the media.
    struct FakeProvider {
        fetch_delay: Duration,
        fail_fetch: bool,
    }

    impl FakeProvider {
        fn new() -> Self {
            Self {
                fetch_delay: Duration::ZERO,
                fail_fetch: false,
            }
        }
    }

    fn fake_stream(id: &str, kind: StreamKind, ext: &str, label: &str) -> MediaStream {
        MediaStream {
            id: id.into(),
            kind,
            extension: ext.into(),
            resolution_label: label.into(),
            size_bytes: 0,
            direct_url: None,
        }
    }

    #[async_trait]
    impl MediaProvider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn resolve(&self, url: &str) -> Result<ResolvedMedia> {
            if !url.contains("good") {
                return Err(ProviderError::Extraction(format!(
                    "Could not derive a video id from URL: {url}"
                )));
            }
            Ok(ResolvedMedia {
                title: "a/b*c?d".into(),
                thumbnail_url: Some("https://img/t.jpg".into()),
                streams: vec![
                    fake_stream("18", StreamKind::Video, "mp4", "360p (30fps)"),
                    fake_stream("22", StreamKind::Video, "mp4", "720p (30fps)"),
                    fake_stream("140", StreamKind::Audio, "m4a", "Audio"),
                ],
            })
        }

        async fn fetch(
            &self,
            _url: &str,
            stream: &MediaStream,
            work_dir: &Path,
            file_name: &str,
        ) -> Result<PathBuf> {
            tokio::time::sleep(self.fetch_delay).await;
            let path = work_dir.join(file_name);
            tokio::fs::write(&path, format!("{}-bytes", stream.id)).await?;
            if self.fail_fetch {
                return Err(ProviderError::Fetch("Origin returned status 403 Forbidden".into()));
            }
            Ok(path)
        }
    }

    fn app_with(provider: Arc<dyn MediaProvider>, temp: &Path) -> Router {
        let settings = Settings::for_tests("http://unused", temp);
        create_router(AppState::new(settings, provider))
    }

    async fn get(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn header_str<'a>(resp: &'a Response, name: header::HeaderName) -> &'a str {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    fn work_dirs(base: &Path) -> usize {
        std::fs::read_dir(base).unwrap().count()
    }

    /// Body-drop cleanup runs on the blocking pool; give it a moment.
    async fn settle_work_dirs(base: &Path, expected: usize) {
        for _ in 0..200 {
            if work_dirs(base) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(work_dirs(base), expected);
    }

    #[tokio::test]
    async fn formats_lists_every_stream() {
        let temp = tempfile::tempdir().unwrap();
        let app = app_with(Arc::new(FakeProvider::new()), temp.path());

        let resp = get(&app, "/formats?url=https%3A%2F%2Fgood.example%2Fwatch%3Fv%3Dabc").await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json_body(resp).await;
        assert_eq!(body["title"], "a/b*c?d");
        assert_eq!(body["thumbnail"], "https://img/t.jpg");
        let formats = body["formats"].as_array().unwrap();
        assert_eq!(formats.len(), 3);
        assert_eq!(
            formats[0],
            serde_json::json!({"id": "18", "ext": "mp4", "resolution": "360p (30fps)", "size": 0})
        );
        for f in formats {
            assert!(f["size"].as_u64().is_some());
            assert!(!f["resolution"].as_str().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn formats_with_unresolvable_url_is_400() {
        let temp = tempfile::tempdir().unwrap();
        let app = app_with(Arc::new(FakeProvider::new()), temp.path());

        let resp = get(&app, "/formats?url=not%20a%20url").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert!(body["detail"]
            .as_str()
            .unwrap()
            .contains("Could not derive a video id"));

        let resp = get(&app, "/formats?url=").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["detail"], "URL parameter is required");
    }

    #[tokio::test]
    async fn download_streams_file_then_removes_work_dir() {
        let temp = tempfile::tempdir().unwrap();
        let app = app_with(Arc::new(FakeProvider::new()), temp.path());

        let resp = get(&app, "/download?url=good&format_id=22").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header_str(&resp, header::CONTENT_TYPE), "video/mp4");
        assert_eq!(
            header_str(&resp, header::CONTENT_DISPOSITION),
            "attachment; filename*=UTF-8''abcd.mp4"
        );
        assert_eq!(header_str(&resp, header::CONTENT_LENGTH), "8");

        // The body still needs the file, so the work dir is alive.
        assert_eq!(work_dirs(temp.path()), 1);

        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"22-bytes");
        settle_work_dirs(temp.path(), 0).await;
    }

    #[tokio::test]
    async fn dropped_response_still_cleans_up() {
        let temp = tempfile::tempdir().unwrap();
        let app = app_with(Arc::new(FakeProvider::new()), temp.path());

        let resp = get(&app, "/download?url=good&format_id=140").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header_str(&resp, header::CONTENT_TYPE), "audio/mp4");
        drop(resp);
        settle_work_dirs(temp.path(), 0).await;
    }

    #[tokio::test]
    async fn download_unknown_format_is_500_without_leftovers() {
        let temp = tempfile::tempdir().unwrap();
        let app = app_with(Arc::new(FakeProvider::new()), temp.path());

        let resp = get(&app, "/download?url=good&format_id=999").await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(resp).await["detail"], "Format not found: 999");
        assert_eq!(work_dirs(temp.path()), 0);
    }

    #[tokio::test]
    async fn download_failures_are_500_without_leftovers() {
        let temp = tempfile::tempdir().unwrap();
        let provider = FakeProvider {
            fetch_delay: Duration::ZERO,
            fail_fetch: true,
        };
        let app = app_with(Arc::new(provider), temp.path());

        let resp = get(&app, "/download?url=good&format_id=18").await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(resp).await["detail"],
            "Origin returned status 403 Forbidden"
        );
        assert_eq!(work_dirs(temp.path()), 0);

        let resp = get(&app, "/download?url=bad&format_id=18").await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(work_dirs(temp.path()), 0);
    }

    #[tokio::test]
    async fn concurrent_downloads_do_not_interfere() {
        let temp = tempfile::tempdir().unwrap();
        let provider = FakeProvider {
            fetch_delay: Duration::from_millis(50),
            fail_fetch: false,
        };
        let app = app_with(Arc::new(provider), temp.path());

        let (a, b) = tokio::join!(
            get(&app, "/download?url=good&format_id=18"),
            get(&app, "/download?url=good&format_id=140"),
        );
        assert_eq!(a.status(), StatusCode::OK);
        assert_eq!(b.status(), StatusCode::OK);
        assert_eq!(work_dirs(temp.path()), 2);

        let a_bytes = to_bytes(a.into_body(), usize::MAX).await.unwrap();
        settle_work_dirs(temp.path(), 1).await;
        let b_bytes = to_bytes(b.into_body(), usize::MAX).await.unwrap();

        assert_eq!(&a_bytes[..], b"18-bytes");
        assert_eq!(&b_bytes[..], b"140-bytes");
        settle_work_dirs(temp.path(), 0).await;
    }

    #[tokio::test]
    async fn missing_query_parameter_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let app = app_with(Arc::new(FakeProvider::new()), temp.path());

        let resp = get(&app, "/download?url=good").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(work_dirs(temp.path()), 0);
    }

    #[tokio::test]
    async fn cors_exposes_download_headers() {
        let temp = tempfile::tempdir().unwrap();
        let app = app_with(Arc::new(FakeProvider::new()), temp.path());

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/download?url=good&format_id=18")
                    .header("Origin", "http://localhost:5173")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            header_str(&resp, header::ACCESS_CONTROL_ALLOW_ORIGIN),
            "*"
        );
        let exposed = header_str(&resp, header::ACCESS_CONTROL_EXPOSE_HEADERS).to_lowercase();
        for name in ["content-disposition", "content-type", "content-length"] {
            assert!(exposed.contains(name), "missing {name} in {exposed}");
        }
    }

    #[tokio::test]
    async fn health_and_fallback() {
        let temp = tempfile::tempdir().unwrap();
        let app = app_with(Arc::new(FakeProvider::new()), temp.path());

        let resp = get(&app, "/health").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["backend"], "fake");

        let resp = get(&app, "/nope").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["detail"], "Route not found");
    }

    #[tokio::test]
    async fn piped_listing_then_download_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/streams/dQw4w9WgXcQ"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "title": "Rick: Roll",
                "thumbnailUrl": "https://img/rr.jpg",
                "videoStreams": [{
                    "url": format!("{}/cdn/v18", server.uri()),
                    "itag": 18,
                    "mimeType": "video/mp4",
                    "quality": "360p",
                    "fps": 30,
                    "contentLength": 10
                }],
                "audioStreams": [{
                    "url": format!("{}/cdn/a140", server.uri()),
                    "itag": 140,
                    "mimeType": "audio/mp4",
                    "quality": "128 kbps",
                    "contentLength": 6
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdn/a140"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"AUDIO!".to_vec()))
            .mount(&server)
            .await;

        let temp = tempfile::tempdir().unwrap();
        let provider = PipedProvider::new(server.uri(), reqwest::Client::new(), AudioRule::Mp3OrM4a);
        let app = app_with(Arc::new(provider), temp.path());
        let watch = "https%3A%2F%2Fwww.youtube.com%2Fwatch%3Fv%3DdQw4w9WgXcQ";

        let resp = get(&app, &format!("/formats?url={watch}")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let listing = json_body(resp).await;
        let audio = listing["formats"]
            .as_array()
            .unwrap()
            .iter()
            .find(|f| f["resolution"] == "Audio")
            .unwrap()
            .clone();
        assert_eq!(audio["id"], "140");
        assert_eq!(audio["ext"], "m4a");

        let resp = get(&app, &format!("/download?url={watch}&format_id=140")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header_str(&resp, header::CONTENT_TYPE), "audio/mp4");
        assert_eq!(
            header_str(&resp, header::CONTENT_DISPOSITION),
            "attachment; filename*=UTF-8''Rick%20Roll.m4a"
        );
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"AUDIO!");
        settle_work_dirs(temp.path(), 0).await;
    }

    #[tokio::test]
    async fn long_multibyte_title_still_downloads() {
        let server = MockServer::start().await;
        let title = "日".repeat(100);
        Mock::given(method("GET"))
            .and(path("/streams/dQw4w9WgXcQ"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "title": title,
                "thumbnailUrl": "https://img/long.jpg",
                "videoStreams": [{
                    "url": format!("{}/cdn/v18", server.uri()),
                    "itag": 18,
                    "mimeType": "video/mp4",
                    "quality": "360p",
                    "fps": 30,
                    "contentLength": 5
                }],
                "audioStreams": []
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdn/v18"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"VIDEO".to_vec()))
            .mount(&server)
            .await;

        let temp = tempfile::tempdir().unwrap();
        let provider = PipedProvider::new(server.uri(), reqwest::Client::new(), AudioRule::Mp3OrM4a);
        let app = app_with(Arc::new(provider), temp.path());

        let resp = get(&app, "/formats?url=dQw4w9WgXcQ").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["formats"][0]["id"], "18");

        let resp = get(&app, "/download?url=dQw4w9WgXcQ&format_id=18").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let disposition = header_str(&resp, header::CONTENT_DISPOSITION).to_string();
        assert!(disposition.starts_with("attachment; filename*=UTF-8''%E6%97%A5"));
        assert!(disposition.ends_with(".mp4"));

        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"VIDEO");
        settle_work_dirs(temp.path(), 0).await;
    }
}
