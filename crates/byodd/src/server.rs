//! Companion HTTP endpoints
//!
//! Endpoints:
//!   GET  /healthz                 liveness (always 200 while running)
//!   GET  /readyz                  readiness (200 if the job platform answers)
//!   GET  /api/status              backend, profile, region
//!   GET  /api/jobs                recent jobs (`limit`, `status`, `plugin`)
//!   GET  /api/jobs/{id}           one job's status
//!   POST /api/submit              encrypt and upload, then register; SSE progress
//!   POST /api/jobs/{id}/get       download and decrypt; SSE progress
//!   GET  /api/jobs/{id}/results   files already extracted under the results root
//!
//! Streaming endpoints answer `text/event-stream` with `progress` events and
//! exactly one terminal `complete` or `error` event. Error bodies and error
//! events carry sanitized messages only; details go to the log.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use byod_core::types::JobFilter;
use byod_core::{BackendCategory, ByodError, JobStatus};
use byod_jobs::events::input_size;
use byod_jobs::{
    check_job_id, get_results_streaming, submit_streaming, GetOptions, JobEvent, JobPlatform, SubmitRequest,
    MAX_UPLOAD_BYTES,
};
use byod_kms::KeyManagementBackend;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

/// Upper bound on `limit` for `/api/jobs`.
const MAX_LIST_LIMIT: usize = 100;

/// What `/api/status` reports about the loaded config.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub backend: String,
    pub profile: Option<String>,
    pub authenticated: bool,
}

/// Shared across handlers; cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub platform: Arc<dyn JobPlatform>,
    pub kms: Arc<dyn KeyManagementBackend>,
    pub info: ServerInfo,
    /// Default parent for `get` output, and the root `/results` lists from
    pub results_root: PathBuf,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/api/status", get(status_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/{id}", get(job_status_handler))
        .route("/api/jobs/{id}/get", post(get_results_handler))
        .route("/api/jobs/{id}/results", get(results_handler))
        .route("/api/submit", post(submit_handler))
        .with_state(state)
}

/// Serve the companion API on `addr` (e.g. "127.0.0.1:8470") until the
/// process is stopped.
pub async fn serve(addr: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind {addr}: {e}"))?;

    let local = listener.local_addr()?;
    if !local.ip().is_loopback() {
        warn!(addr = %local, "listening on a non-loopback address; anyone who can reach it can submit jobs as you");
    }
    info!(addr = %local, "byodd: listening");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("server: {e}"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// A [`ByodError`] rendered as `{"error": "..."}` with a matching status.
pub struct ApiError {
    status: StatusCode,
    err: ByodError,
}

impl ApiError {
    fn new(status: StatusCode, err: ByodError) -> Self {
        Self { status, err }
    }
}

impl From<ByodError> for ApiError {
    fn from(err: ByodError) -> Self {
        let status = status_for(&err);
        Self { status, err }
    }
}

fn status_for(err: &ByodError) -> StatusCode {
    match err {
        ByodError::Validation(_) => StatusCode::BAD_REQUEST,
        ByodError::Authentication(_) => StatusCode::UNAUTHORIZED,
        ByodError::NotFound(_) | ByodError::MissingArtifact { .. } => StatusCode::NOT_FOUND,
        ByodError::JobNotReady { .. } => StatusCode::CONFLICT,
        ByodError::Api { status, .. } if (400..500).contains(status) => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        ByodError::Api { .. } => StatusCode::BAD_GATEWAY,
        ByodError::Backend {
            category: BackendCategory::Network,
            ..
        } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, "request failed: {:#}", self.err);
        } else {
            debug!(status = %self.status, "request rejected: {}", self.err);
        }
        // Not-found and not-ready messages only name the job id the caller sent.
        let message = match &self.err {
            ByodError::NotFound(_) | ByodError::JobNotReady { .. } => self.err.to_string(),
            other => other.public_message(),
        };
        (self.status, Json(json!({ "error": message }))).into_response()
    }
}

// ── SSE ───────────────────────────────────────────────────────────────────────

fn event_stream(rx: UnboundedReceiver<JobEvent>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = UnboundedReceiverStream::new(rx).map(|event| {
        Ok(Event::default()
            .event(event.name())
            .data(event.data().to_string()))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness: 200 if the job platform is reachable, 503 otherwise.
async fn readyz_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.platform.check_ready().await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(e) => {
            warn!("readiness check failed: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, "platform unreachable")
        }
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    let region = match state.platform.region().await {
        Ok(region) => Some(region),
        Err(e) => {
            debug!("region lookup failed: {e}");
            None
        }
    };
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.info.backend,
        "profile": state.info.profile,
        "authenticated": state.info.authenticated,
        "region": region,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    limit: Option<usize>,
    status: Option<String>,
    plugin: Option<String>,
}

async fn list_jobs_handler(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let filter = JobFilter {
        limit: params
            .limit
            .unwrap_or(JobFilter::default().limit)
            .clamp(1, MAX_LIST_LIMIT),
        status: params.status.as_deref().map(JobStatus::parse),
        plugin: params.plugin.filter(|p| !p.is_empty()),
    };
    let jobs = state.platform.list_jobs(&filter).await?;
    Ok(Json(json!({ "jobs": jobs })))
}

async fn job_status_handler(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    check_job_id(&job_id)?;
    let info = state.platform.job_status(&job_id).await?;
    if info.status == JobStatus::NotFound {
        return Err(ByodError::NotFound(format!("Job {job_id} not found")).into());
    }
    let body = serde_json::to_value(&info).map_err(|e| ByodError::Other(e.into()))?;
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub plugin: String,
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub config: Option<Value>,
}

async fn submit_handler(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> Result<Response, ApiError> {
    if body.plugin.trim().is_empty() {
        return Err(ByodError::Validation("plugin is required".into()).into());
    }
    if body.paths.is_empty() {
        return Err(ByodError::Validation("at least one input path is required".into()).into());
    }
    if let Some(missing) = body.paths.iter().find(|p| !p.exists()) {
        return Err(ByodError::Validation(format!("Input not found: {}", missing.display())).into());
    }
    if let Some(config) = &body.config {
        if !config.is_object() {
            return Err(ByodError::Validation("config must be a JSON object".into()).into());
        }
    }

    let paths = body.paths.clone();
    let total = tokio::task::spawn_blocking(move || input_size(&paths))
        .await
        .map_err(|e| ByodError::Other(anyhow::anyhow!("sizing task failed: {e}")))??;
    if total > MAX_UPLOAD_BYTES {
        return Err(ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            ByodError::Validation(format!(
                "Total upload size exceeds {} MB limit",
                MAX_UPLOAD_BYTES / (1024 * 1024)
            )),
        ));
    }

    info!(plugin = %body.plugin, inputs = body.paths.len(), bytes = total, "submit requested");
    let request = SubmitRequest {
        plugin: body.plugin,
        inputs: body.paths,
        description: body.description,
        config: body.config,
        tags: body.tags,
    };
    let rx = submit_streaming(state.platform.clone(), state.kms.clone(), request);
    Ok(event_stream(rx).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct GetBody {
    /// Relative paths land under the results root; default `{root}/{job_id}`
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub keep_encrypted: bool,
    #[serde(default)]
    pub overwrite: bool,
}

async fn get_results_handler(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
    Json(body): Json<GetBody>,
) -> Result<Response, ApiError> {
    check_job_id(&job_id)?;

    let info = state.platform.job_status(&job_id).await?;
    match info.status {
        JobStatus::Completed => {}
        JobStatus::NotFound => {
            return Err(ByodError::NotFound(format!("Job {job_id} not found")).into());
        }
        other => {
            return Err(ByodError::JobNotReady {
                job_id,
                status: other.to_string(),
            }
            .into());
        }
    }

    let output = match body.output {
        Some(path) if path.is_absolute() => path,
        Some(path) => state.results_root.join(path),
        None => state.results_root.join(&job_id),
    };
    info!(job_id = %job_id, output = %output.display(), "get requested");
    let options = GetOptions {
        keep_encrypted: body.keep_encrypted,
        overwrite: body.overwrite,
    };
    let rx = get_results_streaming(state.platform.clone(), state.kms.clone(), job_id, output, options);
    Ok(event_stream(rx).into_response())
}

#[derive(Debug, Serialize)]
struct ResultFile {
    path: String,
    size: u64,
}

fn list_files(root: &Path) -> std::io::Result<Vec<ResultFile>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<ResultFile>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            let path = entry.path();
            if meta.is_dir() {
                walk(root, &path, out)?;
            } else if meta.is_file() {
                let rel = path.strip_prefix(root).unwrap_or(&path);
                out.push(ResultFile {
                    path: rel.to_string_lossy().replace('\\', "/"),
                    size: meta.len(),
                });
            }
        }
        Ok(())
    }
    let mut files = Vec::new();
    walk(root, root, &mut files)?;
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

async fn results_handler(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    check_job_id(&job_id)?;
    let dir = state.results_root.join(&job_id);
    if !dir.is_dir() {
        return Err(ByodError::NotFound(format!("No results for job {job_id}")).into());
    }
    let files = tokio::task::spawn_blocking(move || list_files(&dir))
        .await
        .map_err(|e| ByodError::Other(anyhow::anyhow!("listing task failed: {e}")))?
        .map_err(ByodError::from)?;
    Ok(Json(json!({ "job_id": job_id, "files": files })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use byod_kms::InMemoryKms;
    use byod_storage::BucketOperators;
    use opendal::Operator;
    use tower::ServiceExt;

    struct Harness {
        state: AppState,
        kms: Arc<InMemoryKms>,
        key_arn: String,
        results: Operator,
        work: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let data = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        let results = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        let (kms, key_arn) = InMemoryKms::with_key();
        let kms = Arc::new(kms);
        let platform = byod_jobs::StoragePlatform::new(
            BucketOperators {
                data,
                results: results.clone(),
            },
            key_arn.clone(),
            "us-east-1",
        )
        .with_user("tester");
        let work = tempfile::tempdir().unwrap();
        let state = AppState {
            platform: Arc::new(platform),
            kms: kms.clone(),
            info: ServerInfo {
                backend: "storage".into(),
                profile: None,
                authenticated: false,
            },
            results_root: work.path().join("results"),
        };
        Harness {
            state,
            kms,
            key_arn,
            results,
            work,
        }
    }

    async fn send(state: &AppState, req: Request<Body>) -> (StatusCode, String) {
        let resp = router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    /// `(event, data)` pairs from an SSE body.
    fn sse_events(body: &str) -> Vec<(String, Value)> {
        body.split("\n\n")
            .filter_map(|block| {
                let mut name = None;
                let mut data = None;
                for line in block.lines() {
                    if let Some(v) = line.strip_prefix("event:") {
                        name = Some(v.trim().to_string());
                    } else if let Some(v) = line.strip_prefix("data:") {
                        data = serde_json::from_str(v.trim()).ok();
                    }
                }
                Some((name?, data?))
            })
            .collect()
    }

    async fn submit_one(h: &Harness) -> String {
        let input = h.work.path().join("data.txt");
        std::fs::write(&input, b"alpha\nbeta\n").unwrap();
        let (status, body) = send(
            &h.state,
            post_json(
                "/api/submit",
                json!({ "plugin": "demo-count", "paths": [input], "tags": {"run": "1"} }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let events = sse_events(&body);
        let (last, data) = events.last().unwrap();
        assert_eq!(last, "complete", "events: {events:?}");
        assert!(events[..events.len() - 1].iter().all(|(n, _)| n == "progress"));
        data["job_id"].as_str().unwrap().to_string()
    }

    /// Stand in for the enclave: seal `output` under a fresh DEK and drop both
    /// result objects where the platform looks for them.
    async fn complete_job(h: &Harness, job_id: &str, output: &[u8]) {
        let dek = h.kms.generate_data_key(&h.key_arn).await.unwrap();
        let sealed = byod_crypto::seal_payload(output, &dek.key).unwrap();
        h.results
            .write(&format!("results/{job_id}/output.enc"), sealed)
            .await
            .unwrap();
        h.results
            .write(&format!("results/{job_id}/output_key.bin"), dek.wrapped)
            .await
            .unwrap();
    }

    #[test]
    fn test_job_id_check() {
        assert!(check_job_id("demo-count-20260101120000-0a1b2c3d").is_ok());
        assert!(check_job_id("srv-123").is_ok());
        assert!(check_job_id("").is_err());
        assert!(check_job_id("..").is_err());
        assert!(check_job_id("../etc").is_err());
        assert!(check_job_id("a/b").is_err());
        assert!(check_job_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&ByodError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&ByodError::Authentication("x".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(&ByodError::JobNotReady {
                job_id: "j".into(),
                status: "processing".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ByodError::Api {
                status: 404,
                detail: "gone".into()
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&ByodError::Api {
                status: 503,
                detail: "down".into()
            }),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn test_backend_errors_are_sanitized() {
        let resp = ApiError::from(ByodError::backend(
            "KMS Decrypt failed for arn:aws:kms:us-east-1:123456789012:key/abcd",
        ))
        .into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(!body.contains("123456789012"));
        assert!(body.contains("Encryption operation failed"));
    }

    #[test]
    fn test_list_files_is_relative_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        std::fs::write(dir.path().join("nested/a.txt"), b"a").unwrap();

        let files = list_files(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(names, ["b.txt", "nested/a.txt"]);
        assert_eq!(files[0].size, 2);
    }

    #[tokio::test]
    async fn test_healthz_and_status() {
        let h = harness();
        let (status, body) = send(&h.state, get_req("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");

        let (status, body) = send(&h.state, get_req("/readyz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ready");

        let (status, body) = send(&h.state, get_req("/api/status")).await;
        assert_eq!(status, StatusCode::OK);
        let v: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["backend"], "storage");
        assert_eq!(v["region"], "us-east-1");
        assert_eq!(v["authenticated"], false);
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let h = harness();
        let (status, body) = send(&h.state, get_req("/api/jobs/nope-1")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let v: Value = serde_json::from_str(&body).unwrap();
        assert!(v["error"].as_str().unwrap().contains("nope-1"));
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_input_before_streaming() {
        let h = harness();
        let (status, _) = send(
            &h.state,
            post_json("/api/submit", json!({ "plugin": "demo-count", "paths": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let missing = h.work.path().join("missing.txt");
        let (status, body) = send(
            &h.state,
            post_json("/api/submit", json!({ "plugin": "demo-count", "paths": [missing] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("Input not found"));
    }

    #[tokio::test]
    async fn test_submit_streams_then_job_is_listed() {
        let h = harness();
        let job_id = submit_one(&h).await;

        let (status, body) = send(&h.state, get_req(&format!("/api/jobs/{job_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        let v: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["status"], "submitted");

        let (status, body) = send(&h.state, get_req("/api/jobs?limit=5&plugin=demo-count")).await;
        assert_eq!(status, StatusCode::OK);
        let v: Value = serde_json::from_str(&body).unwrap();
        let jobs = v["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["job_id"], job_id.as_str());
    }

    #[tokio::test]
    async fn test_get_before_completion_conflicts() {
        let h = harness();
        let job_id = submit_one(&h).await;
        let (status, body) = send(
            &h.state,
            post_json(&format!("/api/jobs/{job_id}/get"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.contains(&job_id));
    }

    #[tokio::test]
    async fn test_get_streams_results_into_results_root() {
        let h = harness();
        let job_id = submit_one(&h).await;
        complete_job(&h, &job_id, b"lines: 2\n").await;

        let (status, body) = send(
            &h.state,
            post_json(&format!("/api/jobs/{job_id}/get"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let events = sse_events(&body);
        let (last, data) = events.last().unwrap();
        assert_eq!(last, "complete", "events: {events:?}");
        assert_eq!(data["files"], json!(["output.bin"]));

        let written = h.state.results_root.join(&job_id).join("output.bin");
        assert_eq!(std::fs::read(written).unwrap(), b"lines: 2\n");

        let (status, body) = send(&h.state, get_req(&format!("/api/jobs/{job_id}/results"))).await;
        assert_eq!(status, StatusCode::OK);
        let v: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["files"], json!([{ "path": "output.bin", "size": 9 }]));
    }

    #[tokio::test]
    async fn test_traversal_job_id_rejected() {
        let h = harness();
        let (status, _) = send(
            &h.state,
            post_json("/api/jobs/..%2Fetc/get", json!({ "overwrite": true })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&h.state, get_req("/api/jobs/a%2Fb/results")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
