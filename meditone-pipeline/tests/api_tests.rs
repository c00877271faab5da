//! HTTP surface tests driven through the router with `oneshot`

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use helpers::*;
use http_body_util::BodyExt;
use meditone_pipeline::db::{job_log, meditations};
use meditone_pipeline::db::job_log::{JobLogEntry, LogLevel};
use meditone_pipeline::db::meditations::FailGuard;
use meditone_pipeline::models::{PipelineState, Stage};
use meditone_pipeline::{build_router, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = build_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn intake_body() -> Value {
    json!({
        "first_name": "Ada",
        "email": "ada@example.com",
        "birth_date": "1990-04-12",
        "style": "Zen",
        "goals": "Sleep better",
        "challenges": "Racing thoughts",
        "consent": true
    })
}

#[tokio::test]
async fn test_intake_creates_request_and_queues_script() {
    let harness = HarnessBuilder::new().build().await;
    let state = AppState::new(harness.ctx.clone());

    let (status, body) = send(&state, post_json("/api/meditations", intake_body())).await;
    assert_eq!(status, StatusCode::CREATED);

    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();
    let meditation = meditations::get(&harness.ctx.pool, id).await.unwrap();
    assert_eq!(meditation.state, PipelineState::ScriptPending);
    assert_eq!(meditation.first_name, "Ada");

    let tasks = harness.ctx.queue.tasks_for(id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].stage, Stage::Script);
    assert_eq!(tasks[0].status, "queued");
}

#[tokio::test]
async fn test_intake_rejects_invalid_form() {
    let harness = HarnessBuilder::new().build().await;
    let state = AppState::new(harness.ctx.clone());

    let mut body = intake_body();
    body["consent"] = json!(false);
    body["birth_date"] = json!("12/04/1990");

    let (status, body) = send(&state, post_json("/api/meditations", body)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("terms and conditions"));
    assert!(message.contains("YYYY-MM-DD"));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM meditations")
        .fetch_one(&harness.ctx.pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn test_status_reports_pending_complete_and_failed() {
    let harness = HarnessBuilder::new().build().await;
    let state = AppState::new(harness.ctx.clone());

    let pending = harness.submit().await;
    let uri = format!("/api/meditations/{}/status", pending);
    let (status, body) = send(&state, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"ready": false, "artifact_url": null, "status": "pending", "error": null})
    );

    harness.run_all().await;
    let (_, body) = send(&state, get(&uri)).await;
    assert_eq!(body["ready"], true);
    assert_eq!(body["status"], "complete");
    assert!(body["artifact_url"]
        .as_str()
        .unwrap()
        .starts_with("https://storage.test/meditation_"));

    let failed = harness.submit().await;
    let mut tx = harness.ctx.pool.begin().await.unwrap();
    assert!(meditations::fail(
        &mut *tx,
        failed,
        FailGuard::from_state(PipelineState::ScriptPending)
    )
    .await
    .unwrap());
    job_log::record(
        &mut *tx,
        &JobLogEntry::new("script", LogLevel::Error, "script generation exhausted").meditation(failed),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let (_, body) = send(&state, get(&format!("/api/meditations/{}/status", failed))).await;
    assert_eq!(body["ready"], false);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "script generation exhausted");
}

#[tokio::test]
async fn test_status_of_unknown_request_is_404() {
    let harness = HarnessBuilder::new().build().await;
    let state = AppState::new(harness.ctx.clone());

    let (status, body) = send(
        &state,
        get(&format!("/api/meditations/{}/status", Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let response = build_router(state.clone())
        .oneshot(get("/api/meditations/not-a-uuid/status"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_requires_configured_token() {
    let harness = HarnessBuilder::new().webhook_token("s3cret").build().await;
    let state = AppState::new(harness.ctx.clone());
    let callback = json!({
        "code": 200,
        "data": {"callbackType": "first", "task_id": "unknown-task", "data": []}
    });

    let (status, body) = send(
        &state,
        post_json("/api/webhooks/music?token=wrong", callback.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let (status, _) = send(&state, post_json("/api/webhooks/music", callback.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &state,
        post_json("/api/webhooks/music?token=s3cret", callback),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true, "outcome": "unknown_task"}));
}

#[tokio::test]
async fn test_webhook_intermediate_phase_over_http() {
    let harness = HarnessBuilder::new().build().await;
    let state = AppState::new(harness.ctx.clone());
    let id = harness.advance_to_music_pending().await;

    let (status, body) = send(
        &state,
        post_json(
            "/api/webhooks/music",
            json!({
                "code": 200,
                "msg": "Text generation completed.",
                "data": {"callbackType": "text", "task_id": EXTERNAL_TASK_ID, "data": []}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "in_progress");

    let meditation = meditations::get(&harness.ctx.pool, id).await.unwrap();
    assert_eq!(meditation.music_status.as_str(), "in_progress");
}

#[tokio::test]
async fn test_health_reports_module() {
    let harness = HarnessBuilder::new().build().await;
    let state = AppState::new(harness.ctx.clone());

    let (status, body) = send(&state, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "meditone-pipeline");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}
