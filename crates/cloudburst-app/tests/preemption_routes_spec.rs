use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use bytes::Bytes;
use chrono::Utc;
use cloudburst_app::config::{
    AppConfig, InstanceConfig, PipelineConfig, ServerConfig, StorageBackend, StorageConfig,
};
use cloudburst_app::constants::{RECLAIMED_ERROR, TRANSIENT_PHASE};
use cloudburst_app::server::{ServeRole, build_api_router, build_handlers};
use cloudburst_app::services::store::create_typed;
use cloudburst_app::services::{
    BlobStore, DurableWrite, InstanceSpec, JobDocument, JobStatus, MemoryBlobStore,
    MemoryRepository, PhaseState, PipelineContext, RetentionFlag, S3Options, WorkUnit,
    YieldWaiter, load,
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::watch;
use tower::ServiceExt;

const RECLAIM_PATH: &str = "/v1/reclaim-scheduled";

struct Harness {
    _temp: TempDir,
    scratch: std::path::PathBuf,
    repo: Arc<MemoryRepository>,
    blobs: Arc<MemoryBlobStore>,
    app: Router,
}

fn app_config(root: &Path, command: &[&str]) -> AppConfig {
    AppConfig {
        server: ServerConfig::default(),
        storage: StorageConfig {
            path: root.join("state"),
            backend: StorageBackend::Fs,
            bucket: "bucket".to_string(),
            durability: DurableWrite::None,
            s3: S3Options::default(),
        },
        pipeline: PipelineConfig::default(),
        instance: InstanceConfig {
            command: command.iter().map(|part| part.to_string()).collect(),
            scratch_dir: Some(root.join("scratch")),
            ..InstanceConfig::default()
        },
    }
}

fn harness(role: ServeRole, command: &[&str]) -> Harness {
    let temp = TempDir::new().expect("temp dir");
    let config = app_config(temp.path(), command);
    let repo = Arc::new(MemoryRepository::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let ctx = PipelineContext::new(repo.clone(), blobs.clone(), config.pipeline.clone())
        .with_waiter(YieldWaiter);
    let (_tx, rx) = watch::channel(false);
    let handlers = build_handlers(&config, Arc::new(ctx), role, rx).expect("handlers");
    let app = build_api_router(&config.server, handlers).expect("router");
    Harness {
        scratch: temp.path().join("scratch"),
        _temp: temp,
        repo,
        blobs,
        app,
    }
}

async fn transient_job(repo: &MemoryRepository, status: JobStatus, inputs: Vec<WorkUnit>) {
    let mut job = JobDocument::new("batch", "bucket");
    let mut state = PhaseState::pending(0, RetentionFlag::Discard);
    state.status = status;
    job.phases.insert(TRANSIENT_PHASE.into(), state);
    job.instance = Some(InstanceSpec {
        compute_target: Some("vm-42".into()),
        ..InstanceSpec::new(4)
    });
    job.inputs = inputs;
    create_typed(repo, job).await.expect("job");
}

fn reclaim_request(instance_id: &str, with_nonce: bool) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(RECLAIM_PATH)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "signature");
    if with_nonce {
        builder = builder.header("x-ibm-nonce", "nonce-1");
    }
    let body = json!({
        "id": instance_id,
        "serviceName": "compute",
        "event": "reclaim-scheduled",
        "timestamp": 1_700_000_000,
        "link": format!("https://example.invalid/instances/{instance_id}"),
    });
    builder
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn trigger_request(job_id: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/jobs")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "id": job_id }).to_string()))
        .expect("request")
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (status, serde_json::from_slice(&bytes).expect("json body"))
}

#[tokio::test]
async fn reclaim_flushes_in_flight_input() {
    let h = harness(ServeRole::Instance, &["./run.sh"]);
    let mut done = WorkUnit::new("input-0", "batch/input-0/a.nw");
    done.compute_start = Some(Utc::now());
    done.compute_end = Some(Utc::now());
    let running = WorkUnit {
        output_key: Some("batch/input-1/results.out".into()),
        compute_start: Some(Utc::now()),
        ..WorkUnit::new("input-1", "batch/input-1/b.nw")
    };
    transient_job(h.repo.as_ref(), JobStatus::Processing, vec![done, running]).await;

    let work_dir = h.scratch.join("batch/input-1");
    std::fs::create_dir_all(&work_dir).expect("work dir");
    std::fs::write(work_dir.join("results.out"), b"partial").expect("results");

    let (status, body) = send(&h.app, reclaim_request("vm-42", true)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"result": "batch INCOMPLETE and prepped for reclamation"}));

    assert_eq!(
        h.blobs
            .get("bucket", "batch/input-1/results.out")
            .await
            .expect("partial results"),
        Bytes::from_static(b"partial")
    );
    let job: JobDocument = load(h.repo.as_ref(), "batch").await.expect("job");
    assert_eq!(job.status(TRANSIENT_PHASE), Some(JobStatus::Reclaimed));
    assert_eq!(job.inputs[1].error.as_deref(), Some(RECLAIMED_ERROR));

    let (status, body) = send(&h.app, reclaim_request("vm-42", true)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"result": "batch INCOMPLETE and prepped for reclamation"}));
}

#[tokio::test]
async fn reclaim_of_complete_job_is_acknowledged() {
    let h = harness(ServeRole::Instance, &["./run.sh"]);
    transient_job(h.repo.as_ref(), JobStatus::Complete, Vec::new()).await;

    let (status, body) = send(&h.app, reclaim_request("vm-42", true)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"result": "batch COMPLETE and prepped for reclamation"}));
    let job: JobDocument = load(h.repo.as_ref(), "batch").await.expect("job");
    assert_eq!(job.status(TRANSIENT_PHASE), Some(JobStatus::Complete));
}

#[tokio::test]
async fn reclaim_failures_are_server_errors() {
    let h = harness(ServeRole::Instance, &["./run.sh"]);
    transient_job(h.repo.as_ref(), JobStatus::Processing, Vec::new()).await;

    let (status, body) = send(&h.app, reclaim_request("vm-42", false)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().expect("error").contains("x-ibm-nonce"));

    let (status, _) = send(&h.app, reclaim_request("vm-unknown", true)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let job: JobDocument = load(h.repo.as_ref(), "batch").await.expect("job");
    assert_eq!(job.status(TRANSIENT_PHASE), Some(JobStatus::Processing));
}

#[tokio::test]
async fn trigger_reports_missing_and_finished_jobs() {
    let h = harness(ServeRole::Controller, &["./run.sh"]);
    let (status, _) = send(&h.app, trigger_request("nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    transient_job(h.repo.as_ref(), JobStatus::Complete, Vec::new()).await;
    let (status, body) = send(&h.app, trigger_request("batch")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"result": "batch already complete"}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn instance_trigger_runs_job_in_background() {
    let h = harness(
        ServeRole::Instance,
        &["sh", "-c", "tr a-z A-Z < input.dat > results.out"],
    );
    h.blobs
        .put("bucket", "batch/input-0/a.nw", Bytes::from_static(b"hello"))
        .await
        .expect("input");
    transient_job(
        h.repo.as_ref(),
        JobStatus::Processing,
        vec![WorkUnit::new("input-0", "batch/input-0/a.nw")],
    )
    .await;

    let (status, body) = send(&h.app, trigger_request("batch")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"result": "batch started on this instance"}));

    let mut finished = None;
    for _ in 0..200 {
        let job: JobDocument = load(h.repo.as_ref(), "batch").await.expect("job");
        if job.status(TRANSIENT_PHASE) == Some(JobStatus::Complete) {
            finished = Some(job);
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let job = finished.expect("job completes");
    assert!(job.inputs[0].compute_end.is_some());
    assert!(job.inputs[0].error.is_none());
    assert_eq!(
        h.blobs
            .get("bucket", "batch/input-0/results.out")
            .await
            .expect("results"),
        Bytes::from_static(b"HELLO")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_triggers_start_one_run() {
    let h = harness(ServeRole::Instance, &["sh", "-c", "sleep 2"]);
    h.blobs
        .put("bucket", "batch/input-0/a.nw", Bytes::from_static(b"hello"))
        .await
        .expect("input");
    transient_job(
        h.repo.as_ref(),
        JobStatus::Processing,
        vec![WorkUnit::new("input-0", "batch/input-0/a.nw")],
    )
    .await;

    let (first, second) = tokio::join!(
        send(&h.app, trigger_request("batch")),
        send(&h.app, trigger_request("batch")),
    );
    let mut statuses = [first.0, second.0];
    statuses.sort();
    assert_eq!(statuses, [StatusCode::OK, StatusCode::INTERNAL_SERVER_ERROR]);

    let (accepted, refused) = if first.0 == StatusCode::OK {
        (first.1, second.1)
    } else {
        (second.1, first.1)
    };
    assert_eq!(accepted, json!({"result": "batch started on this instance"}));
    assert!(refused["error"].as_str().expect("error").contains("busy"));
}
