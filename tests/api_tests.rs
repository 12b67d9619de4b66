
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use opqueue::api::{router, ApiState};
use test_harness::{start_master, TestMaster};

fn create_test_app(master: &TestMaster) -> Router {
    router(ApiState {
        queue: master.queue.clone(),
        locks: master.locks.clone(),
    })
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn startup_op() -> Value {
    json!({"OP_ID": "OP_INSTANCE_STARTUP", "instance_name": "foo"})
}

#[tokio::test]
async fn test_submit_and_get_job() {
    let (_dir, master) = start_master(0).await;
    let app = create_test_app(&master);

    let (status, body) = send(
        &app,
        "POST",
        "/api/jobs",
        Some(json!({"ops": [startup_op()], "priority": -10})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let id = body["job_id"].as_u64().unwrap();

    let (status, body) = send(&app, "GET", &format!("/api/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["priority"], -10);
    assert_eq!(body["job"]["id"], id);
    assert_eq!(body["job"]["ops"][0]["input"]["OP_ID"], "OP_INSTANCE_STARTUP");
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let (_dir, master) = start_master(0).await;
    let app = create_test_app(&master);

    let (status, body) = send(&app, "POST", "/api/jobs", Some(json!({"ops": []}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _) = send(
        &app,
        "POST",
        "/api/jobs",
        Some(json!({"ops": [startup_op()], "priority": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/api/jobs",
        Some(json!({"ops": [{"OP_ID": "OP_NOT_AN_OPCODE"}]})),
    )
    .await;
    assert!(status.is_client_error());
    assert_eq!(master.queue.info().last_serial, 0);
}

#[tokio::test]
async fn test_drained_queue_returns_unavailable() {
    let (_dir, master) = start_master(0).await;
    let app = create_test_app(&master);

    let (status, body) = send(&app, "PUT", "/api/queue/drain", Some(json!({"drain": true}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["drained"], true);

    let (status, body) = send(&app, "POST", "/api/jobs", Some(json!({"ops": [startup_op()]}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("drained"));

    let (_, body) = send(&app, "GET", "/api/queue", None).await;
    assert_eq!(body["drained"], true);
    assert_eq!(body["live_jobs"], 0);
}

#[tokio::test]
async fn test_batch_submission_resolves_relative_dependencies() {
    let (_dir, master) = start_master(0).await;
    let app = create_test_app(&master);

    let mut dependent = startup_op();
    dependent["depends"] = json!([{"job_id": -1, "statuses": ["success"]}]);
    let (status, body) = send(
        &app,
        "POST",
        "/api/batch",
        Some(json!({"jobs": [
            {"ops": [startup_op()]},
            {"ops": []},
            {"ops": [dependent]},
        ]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let results = body.as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["success"], true);
    assert_eq!(results[1]["success"], false);
    assert_eq!(results[2]["success"], false, "-1 refers to the rejected job");
    let first = results[0]["job_id"].as_u64().unwrap();

    let (_, body) = send(
        &app,
        "POST",
        "/api/batch",
        Some(json!({"jobs": [{"ops": [startup_op()]}, {"ops": [{
            "OP_ID": "OP_INSTANCE_SHUTDOWN",
            "instance_name": "foo",
            "depends": [{"job_id": -1}],
        }]}]})),
    )
    .await;
    let second = body[0]["job_id"].as_u64().unwrap();
    let third = body[1]["job_id"].as_u64().unwrap();
    assert!(second > first);
    let job = master.queue.query_job(third).unwrap();
    assert_eq!(job.ops[0].input.depends[0].job_id, second as i64);
}

#[tokio::test]
async fn test_unknown_job_returns_not_found() {
    let (_dir, master) = start_master(0).await;
    let app = create_test_app(&master);

    let (status, body) = send(&app, "GET", "/api/jobs/42", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("42"));

    let (status, _) = send(&app, "POST", "/api/jobs/42/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_list_and_archive() {
    let (_dir, master) = start_master(0).await;
    let app = create_test_app(&master);

    let id = master
        .queue
        .submit_job(vec![serde_json::from_value(startup_op()).unwrap()])
        .unwrap();

    let (status, body) = send(&app, "POST", &format!("/api/jobs/{}/archive", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["archived"], false, "unfinished jobs are not archived");

    let (status, body) = send(&app, "POST", &format!("/api/jobs/{}/cancel", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, body) = send(&app, "GET", "/api/jobs?status=canceled", None).await;
    let jobs = body.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["id"], id);
    assert_eq!(jobs[0]["summary"][0], "INSTANCE_STARTUP(foo)");

    let (_, body) = send(&app, "GET", "/api/jobs?status=queued", None).await;
    assert!(body.as_array().unwrap().is_empty());

    let (status, body) = send(&app, "POST", "/api/queue/archive", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["archived"], 1);

    let (_, body) = send(&app, "GET", "/api/jobs", None).await;
    assert!(body.as_array().unwrap().is_empty());
    let (_, body) = send(&app, "GET", "/api/jobs?archived=true", None).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_wait_returns_when_job_finishes() {
    let (_dir, mut master) = start_master(0).await;
    let app = create_test_app(&master);

    let id = master
        .queue
        .submit_job(vec![serde_json::from_value(startup_op()).unwrap()])
        .unwrap();

    // Nothing changes while no worker runs.
    let (status, body) = send(
        &app,
        "GET",
        &format!("/api/jobs/{}/wait?prev_status=queued&timeout_secs=0", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], false);

    master.start(1);
    master.wait_finished(id, Duration::from_secs(10)).await;
    let (_, body) = send(
        &app,
        "GET",
        &format!("/api/jobs/{}/wait?prev_status=queued", id),
        None,
    )
    .await;
    assert_eq!(body["changed"], true);
    assert_eq!(body["status"], "success");
    master.stop().await;
}

#[tokio::test]
async fn test_locks_endpoint_lists_nothing_when_idle() {
    let (_dir, master) = start_master(0).await;
    let app = create_test_app(&master);

    let (status, body) = send(&app, "GET", "/api/locks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}
