use actix_web::dev::ServerHandle;
use actix_web::http::StatusCode;
use actix_web::{test, web, App, HttpResponse, HttpServer};
use async_trait::async_trait;
use backend::config::Settings;
use backend::db::Database;
use backend::error::CoreError;
use backend::identity::USER_HEADER;
use backend::ledger::CreditLedger;
use backend::poller::{await_completion, HttpProgressSource, PollPolicy, ProgressSource};
use backend::processing::backend::{
    BackendError, DispatchRequest, Engines, ProcessingBackend, RemoteStatus, RemoteTicket,
};
use backend::processing::local::LocalEngine;
use backend::processing::{Attachment, EngineRoute, JobPayload};
use backend::AppContext;
use common::jobs::{JobHandle, JobKind, JobSnapshot, JobStatus, ProcessingKindInfo};
use common::requests::{BalanceResponse, CreditCheckResponse, ErrorBody};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

const BOUNDARY: &str = "ghibli-test-boundary";

/// Engine that accepts everything and never finishes.
struct StuckEngine;

#[async_trait]
impl ProcessingBackend for StuckEngine {
    fn name(&self) -> &'static str {
        "stuck"
    }

    async fn submit(&self, request: &DispatchRequest) -> Result<RemoteTicket, BackendError> {
        Ok(RemoteTicket(request.job_id.clone()))
    }

    async fn poll(&self, _ticket: &RemoteTicket) -> Result<RemoteStatus, BackendError> {
        Ok(RemoteStatus::Queued { position: Some(1) })
    }

    async fn fetch_result(&self, _ticket: &RemoteTicket) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::Protocol("never finished".into()))
    }
}

/// Engine that cannot be reached.
struct DownEngine;

#[async_trait]
impl ProcessingBackend for DownEngine {
    fn name(&self) -> &'static str {
        "down"
    }

    async fn submit(&self, _request: &DispatchRequest) -> Result<RemoteTicket, BackendError> {
        Err(BackendError::Unavailable("connection refused".into()))
    }

    async fn poll(&self, _ticket: &RemoteTicket) -> Result<RemoteStatus, BackendError> {
        Err(BackendError::Unavailable("connection refused".into()))
    }

    async fn fetch_result(&self, _ticket: &RemoteTicket) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::Unavailable("connection refused".into()))
    }
}

struct TestServer {
    ctx: AppContext,
    _dir: tempfile::TempDir,
}

fn server(run_timeout: Duration) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        upload_dir: dir.path().join("artifacts"),
        backend_poll_interval: Duration::from_millis(10),
        backend_run_timeout: run_timeout,
        ..Settings::default()
    };
    let engines = Engines::new()
        .with(EngineRoute::Local, Arc::new(LocalEngine::new()))
        .with(EngineRoute::ComfyUi, Arc::new(StuckEngine))
        .with(EngineRoute::UpscaleApi, Arc::new(DownEngine));

    let db = Database::open_in_memory().unwrap();
    let (ctx, rx) = AppContext::new(settings, db, engines).unwrap();
    ctx.spawn_background(rx);
    TestServer { ctx, _dir: dir }
}

fn png_bytes() -> Vec<u8> {
    let img = RgbImage::from_fn(6, 4, |x, y| Rgb([(x * 30) as u8, (y * 50) as u8, 120]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a str, Vec<u8>),
}

fn multipart_body(parts: &[Part]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File(name, filename, bytes) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: image/png\r\n\r\n",
                        name, filename
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn multipart_request(parts: &[Part]) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/api/jobs")
        .insert_header((
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        ))
        .set_payload(multipart_body(parts))
}

fn submit_request(user: &str, parts: &[Part]) -> test::TestRequest {
    multipart_request(parts).insert_header((USER_HEADER, user))
}

fn get(user: Option<&str>, uri: &str) -> test::TestRequest {
    let req = test::TestRequest::get().uri(uri);
    match user {
        Some(user) => req.insert_header((USER_HEADER, user)),
        None => req,
    }
}

/// Serves the full app on an ephemeral port and returns its base URL.
fn serve(ctx: AppContext) -> (String, ServerHandle) {
    let server = HttpServer::new(move || {
        let ctx = ctx.clone();
        App::new().configure(move |cfg| ctx.configure(cfg))
    })
    .workers(1)
    .disable_signals()
    .bind(("127.0.0.1", 0))
    .unwrap();
    let addr = server.addrs()[0];
    let server = server.run();
    let handle = server.handle();
    actix_web::rt::spawn(server);
    (format!("http://{}", addr), handle)
}

/// Stand-in status endpoint with canned failures, keyed by job id.
async fn canned_status(job_id: web::Path<String>) -> HttpResponse {
    match job_id.as_str() {
        "broken" => HttpResponse::InternalServerError().finish(),
        "garbled" => HttpResponse::Ok()
            .content_type("application/json")
            .body("{not json"),
        _ => HttpResponse::NotFound().finish(),
    }
}

fn fast_policy(max_attempts: u32) -> PollPolicy {
    PollPolicy {
        poll_interval: Duration::from_millis(20),
        max_attempts,
    }
}

#[actix_web::test]
async fn grayscale_job_is_viewed_free_and_downloaded_once() {
    let srv = server(Duration::from_secs(10));
    let app = test::init_service(App::new().configure(|cfg| srv.ctx.configure(cfg))).await;

    let resp = test::call_service(
        &app,
        submit_request(
            "alice",
            &[
                Part::Text("kind", "grayscale"),
                Part::File("file", "photo.png", png_bytes()),
            ],
        )
        .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let handle: JobHandle = test::read_body_json(resp).await;

    let uri = await_completion(&srv.ctx.jobs, &handle.job_id, fast_policy(250))
        .await
        .unwrap();
    assert_eq!(uri, format!("/api/artifacts/{}", handle.job_id));

    let snapshot: JobSnapshot = test::call_and_read_body_json(
        &app,
        get(Some("alice"), &format!("/api/jobs/{}", handle.job_id)).to_request(),
    )
    .await;
    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.progress, 100);

    // Reading a finished job again always gives the same answer.
    for _ in 0..3 {
        let again: JobSnapshot = test::call_and_read_body_json(
            &app,
            get(Some("alice"), &format!("/api/jobs/{}", handle.job_id)).to_request(),
        )
        .await;
        assert_eq!(again.status, JobStatus::Completed);
        assert_eq!(again.result_uri.as_deref(), Some(uri.as_str()));
    }

    // Viewing is free.
    let resp = test::call_service(&app, get(Some("alice"), &uri).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = test::read_body(resp).await;
    assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);
    assert_eq!(srv.ctx.ledger.balance("alice").unwrap(), 50);

    // The first download is charged, the second is not.
    for _ in 0..2 {
        let download = get(Some("alice"), &format!("{}?mode=download", uri)).to_request();
        let resp = test::call_service(&app, download).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let disposition = resp
            .headers()
            .get("content-disposition")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment"));
    }
    let balance: BalanceResponse =
        test::call_and_read_body_json(&app, get(Some("alice"), "/api/credits").to_request()).await;
    assert_eq!(balance.balance, 40);

    // Other users and anonymous callers get nothing.
    let download = get(Some("bob"), &format!("{}?mode=download", uri)).to_request();
    let resp = test::call_service(&app, download).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let resp = test::call_service(&app, get(None, &uri).to_request()).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(srv.ctx.ledger.balance("bob").unwrap(), 50);
}

#[actix_web::test]
async fn blank_prompt_is_a_validation_error() {
    let srv = server(Duration::from_secs(10));
    let app = test::init_service(App::new().configure(|cfg| srv.ctx.configure(cfg))).await;

    let resp = test::call_service(
        &app,
        submit_request(
            "alice",
            &[Part::Text("kind", "text_to_image"), Part::Text("prompt", "  ")],
        )
        .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: ErrorBody = test::read_body_json(resp).await;
    assert_eq!(body.code, "VALIDATION_ERROR");
}

#[actix_web::test]
async fn unknown_kind_and_missing_identity_are_rejected() {
    let srv = server(Duration::from_secs(10));
    let app = test::init_service(App::new().configure(|cfg| srv.ctx.configure(cfg))).await;

    let req = submit_request("alice", &[Part::Text("kind", "blur")]).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = multipart_request(&[Part::Text("kind", "grayscale")]).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn unknown_job_is_not_found() {
    let srv = server(Duration::from_secs(10));
    let app = test::init_service(App::new().configure(|cfg| srv.ctx.configure(cfg))).await;

    for uri in ["/api/jobs/does-not-exist", "/api/artifacts/does-not-exist"] {
        let resp = test::call_service(&app, get(Some("alice"), uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

#[actix_web::test]
async fn engine_timeout_fails_the_job_without_charging() {
    let srv = server(Duration::from_millis(100));
    let app = test::init_service(App::new().configure(|cfg| srv.ctx.configure(cfg))).await;

    let resp = test::call_service(
        &app,
        submit_request(
            "alice",
            &[
                Part::Text("kind", "style_transfer"),
                Part::File("file", "photo.png", png_bytes()),
            ],
        )
        .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let handle: JobHandle = test::read_body_json(resp).await;

    let outcome = await_completion(&srv.ctx.jobs, &handle.job_id, fast_policy(100)).await;
    assert!(matches!(outcome, Err(CoreError::JobFailed(ref msg)) if msg == "engine timeout"));

    let resp = test::call_service(
        &app,
        get(Some("alice"), &format!("/api/artifacts/{}?mode=download", handle.job_id)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(srv.ctx.ledger.balance("alice").unwrap(), 50);
}

#[actix_web::test]
async fn poller_gives_up_without_touching_the_job() {
    let srv = server(Duration::from_secs(30));
    let app = test::init_service(App::new().configure(|cfg| srv.ctx.configure(cfg))).await;

    let resp = test::call_service(
        &app,
        submit_request(
            "alice",
            &[
                Part::Text("kind", "style_transfer"),
                Part::File("file", "photo.png", png_bytes()),
            ],
        )
        .to_request(),
    )
    .await;
    let handle: JobHandle = test::read_body_json(resp).await;

    let outcome = await_completion(&srv.ctx.jobs, &handle.job_id, fast_policy(3)).await;
    assert!(matches!(outcome, Err(CoreError::PollTimeout { attempts: 3 })));

    let snapshot = srv.ctx.jobs.get(&handle.job_id).await.unwrap();
    assert!(!snapshot.status.is_terminal());
}

#[actix_web::test]
async fn upscale_falls_back_when_the_api_is_down() {
    let srv = server(Duration::from_secs(10));
    let app = test::init_service(App::new().configure(|cfg| srv.ctx.configure(cfg))).await;

    let resp = test::call_service(
        &app,
        submit_request(
            "alice",
            &[
                Part::Text("kind", "upscale"),
                Part::Text("parameters", r#"{"scale_factor": 2}"#),
                Part::File("file", "photo.png", png_bytes()),
            ],
        )
        .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let handle: JobHandle = test::read_body_json(resp).await;

    let uri = await_completion(&srv.ctx.jobs, &handle.job_id, fast_policy(250))
        .await
        .unwrap();
    let resp = test::call_service(&app, get(Some("alice"), &uri).to_request()).await;
    let bytes = test::read_body(resp).await;
    let img = image::load_from_memory(&bytes).unwrap();
    assert_eq!((img.width(), img.height()), (12, 8));

    let snapshot = srv.ctx.jobs.get(&handle.job_id).await.unwrap();
    assert!(snapshot.message.contains("fallback"));
}

#[actix_web::test]
async fn processors_health_and_credit_check() {
    let srv = server(Duration::from_secs(10));
    let app = test::init_service(App::new().configure(|cfg| srv.ctx.configure(cfg))).await;

    let kinds: Vec<ProcessingKindInfo> =
        test::call_and_read_body_json(&app, get(None, "/api/processors").to_request()).await;
    assert_eq!(kinds.len(), 6);

    let resp = test::call_service(&app, get(None, "/api/health").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::post()
        .uri("/api/credits/check")
        .insert_header((USER_HEADER, "alice"))
        .set_json(serde_json::json!({"cost": 60}))
        .to_request();
    let check: CreditCheckResponse = test::call_and_read_body_json(&app, req).await;
    assert!(!check.sufficient);
    assert_eq!(check.current_balance, 50);
}

#[actix_web::test]
async fn http_progress_source_follows_a_live_job() {
    let srv = server(Duration::from_secs(10));
    let (base_url, server_handle) = serve(srv.ctx.clone());

    let payload = JobPayload {
        attachments: vec![Attachment {
            field: "file".into(),
            filename: Some("photo.png".into()),
            bytes: png_bytes(),
        }],
        ..JobPayload::default()
    };
    let handle = srv
        .ctx
        .submitter
        .submit("alice", JobKind::Grayscale, payload)
        .await
        .unwrap();

    let alice = HttpProgressSource::new(base_url.clone(), "alice");
    let uri = await_completion(&alice, &handle.job_id, fast_policy(250))
        .await
        .unwrap();
    assert_eq!(uri, format!("/api/artifacts/{}", handle.job_id));
    for _ in 0..2 {
        let snapshot = alice.fetch(&handle.job_id).await.unwrap();
        assert_eq!(snapshot.result_uri.as_deref(), Some(uri.as_str()));
    }

    assert!(matches!(
        alice.fetch("does-not-exist").await,
        Err(CoreError::NotFound(_))
    ));
    let bob = HttpProgressSource::new(base_url, "bob");
    assert!(matches!(
        bob.fetch(&handle.job_id).await,
        Err(CoreError::Forbidden(_))
    ));

    server_handle.stop(true).await;
}

#[actix_web::test]
async fn http_progress_source_retries_only_transient_failures() {
    let server = HttpServer::new(|| {
        App::new().route("/api/jobs/{job_id}", web::get().to(canned_status))
    })
    .workers(1)
    .disable_signals()
    .bind(("127.0.0.1", 0))
    .unwrap();
    let base_url = format!("http://{}", server.addrs()[0]);
    let server = server.run();
    let server_handle = server.handle();
    actix_web::rt::spawn(server);

    let source = HttpProgressSource::new(base_url, "alice");
    assert!(matches!(source.fetch("broken").await, Err(CoreError::Transient(_))));
    assert!(matches!(source.fetch("garbled").await, Err(CoreError::Transient(_))));
    assert!(matches!(source.fetch("gone").await, Err(CoreError::NotFound(_))));

    // Server errors are retried until the budget runs out; a 404 ends at once.
    let outcome = await_completion(&source, "broken", fast_policy(3)).await;
    assert!(matches!(outcome, Err(CoreError::PollTimeout { attempts: 3 })));
    let outcome = await_completion(&source, "gone", fast_policy(3)).await;
    assert!(matches!(outcome, Err(CoreError::NotFound(_))));

    server_handle.stop(true).await;
}
