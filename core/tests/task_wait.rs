mod common;

use std::time::Duration;

use common::{task_path, ScriptedTransport};
use pulp_core::{
    ApiError, HttpResponse, ReloadOutcome, Task, TaskStatePolicy, TreeWaitOptions, VanishedTaskPolicy,
    WaitOptions,
};
use serde_json::json;
use tokio::time::Instant;

fn report(task_ids: &[&str]) -> HttpResponse {
    let spawned: Vec<_> = task_ids.iter().map(|id| json!({"task_id": id})).collect();
    HttpResponse::new(202, json!({"spawned_tasks": spawned, "result": null, "error": null}).to_string())
}

/// Order in which each task was first polled.
fn first_polls(transport: &ScriptedTransport) -> Vec<String> {
    let mut seen = Vec::new();
    for path in transport.dispatched() {
        if !seen.contains(&path) {
            seen.push(path);
        }
    }
    seen
}

// --- single task ---

#[tokio::test(start_paused = true)]
async fn wait_returns_once_task_finishes() {
    let transport = ScriptedTransport::new();
    transport.task("t1", &["waiting", "running", "running", "finished"]);
    let conn = transport.connection();

    let mut task = Task::get(&conn, "t1").await.unwrap();
    assert_eq!(task.state(), "waiting");
    task.wait(&conn, &WaitOptions::default()).await.unwrap();

    assert_eq!(task.state(), "finished");
    assert_eq!(transport.dispatch_count(&task_path("t1")), 4);
}

#[tokio::test(start_paused = true)]
async fn wait_times_out_on_a_task_that_never_ends() {
    let transport = ScriptedTransport::new();
    transport.task("stuck", &["running"]);
    let conn = transport.connection();

    let mut task = Task::get(&conn, "stuck").await.unwrap();
    let started = Instant::now();
    let err = task
        .wait(&conn, &WaitOptions::with_timeout(Duration::from_secs(1)))
        .await
        .unwrap_err();

    assert!(started.elapsed() >= Duration::from_secs(1));
    match err {
        ApiError::TaskTimeout { task, timeout } => {
            assert_eq!(timeout, Duration::from_secs(1));
            assert_eq!(task.id(), "stuck");
            assert_eq!(task.state(), "running");
        }
        other => panic!("expected task timeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn wait_reports_the_error_payload_of_a_failed_task() {
    let transport = ScriptedTransport::new();
    transport.task_with(
        "t1",
        &["running", "error"],
        Some(json!({"code": "PLP0034", "description": "importer failed"})),
        &[],
    );
    let conn = transport.connection();

    let mut task = Task::get(&conn, "t1").await.unwrap();
    let err = task.wait(&conn, &WaitOptions::default()).await.unwrap_err();

    match err {
        ApiError::TaskFailure { task, error } => {
            assert_eq!(task.state(), "error");
            assert_eq!(error["code"], "PLP0034");
        }
        other => panic!("expected task failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn vanished_task_counts_as_settled_by_default() {
    let transport = ScriptedTransport::new();
    let running = json!({"task_id": "t1", "state": "running"}).to_string();
    transport.route(&task_path("t1"), vec![(200, running), (404, String::new())]);
    let conn = transport.connection();

    let mut task = Task::get(&conn, "t1").await.unwrap();
    task.wait(&conn, &WaitOptions::default()).await.unwrap();
    assert_eq!(task.state(), "running");
}

#[tokio::test(start_paused = true)]
async fn vanished_task_fails_when_asked_to() {
    let transport = ScriptedTransport::new();
    let running = json!({"task_id": "t1", "state": "running"}).to_string();
    transport.route(&task_path("t1"), vec![(200, running), (404, String::new())]);
    let conn = transport.connection();

    let mut task = Task::get(&conn, "t1").await.unwrap();
    let options = WaitOptions::default().vanished(VanishedTaskPolicy::Fail);
    let err = task.wait(&conn, &options).await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound { id } if id == "t1"));
}

#[tokio::test(start_paused = true)]
async fn vanished_task_settles_on_a_strict_connection() {
    let transport = ScriptedTransport::new();
    let running = json!({"task_id": "t1", "state": "running"}).to_string();
    transport.route(&task_path("t1"), vec![(200, running), (404, String::new())]);
    let conn = transport.strict_connection();

    let mut task = Task::get(&conn, "t1").await.unwrap();
    task.wait(&conn, &WaitOptions::default()).await.unwrap();
    assert_eq!(task.state(), "running");
    assert!(conn.is_strict());
}

#[tokio::test]
async fn strict_connection_still_rejects_other_statuses_on_reload() {
    let transport = ScriptedTransport::new();
    let running = json!({"task_id": "t1", "state": "running"}).to_string();
    transport.route(&task_path("t1"), vec![(200, running), (500, "boom".into())]);
    let conn = transport.strict_connection();

    let mut task = Task::get(&conn, "t1").await.unwrap();
    let err = task.reload(&conn).await.unwrap_err();
    assert!(matches!(err, ApiError::Validation { ref responses, .. } if responses[0].status == 500));

    let err = Task::get(&conn, "ghost").await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound { id } if id == "ghost"));
}

#[tokio::test]
async fn reload_reports_gone_and_server_errors_separately() {
    let transport = ScriptedTransport::new();
    let running = json!({"task_id": "t1", "state": "running"}).to_string();
    transport.route(
        &task_path("t1"),
        vec![(200, running.clone()), (200, running), (500, "boom".into()), (404, String::new())],
    );
    let conn = transport.connection();

    let mut task = Task::get(&conn, "t1").await.unwrap();
    assert_eq!(task.reload(&conn).await.unwrap(), ReloadOutcome::Found("running".into()));
    assert!(matches!(
        task.reload(&conn).await.unwrap_err(),
        ApiError::HttpError { status: 500, .. }
    ));
    assert_eq!(task.reload(&conn).await.unwrap(), ReloadOutcome::Gone);
}

#[tokio::test(start_paused = true)]
async fn custom_state_policy_drives_the_wait() {
    let transport = ScriptedTransport::new();
    transport.task("t1", &["queued", "queued", "done"]);
    let conn = transport.connection();
    let policy = TaskStatePolicy::new(&["queued"], &["done"], &["broken"]);

    let mut task = Task::get(&conn, "t1").await.unwrap().with_policy(policy);
    assert!(task.is_active());
    task.wait(&conn, &WaitOptions::default()).await.unwrap();
    assert!(task.is_end());
    assert!(!task.is_error());
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let transport = ScriptedTransport::new();
    let conn = transport.connection();

    let err = Task::get(&conn, "ghost").await.unwrap_err();
    assert_eq!(err.to_string(), "task not found: ghost");
}

#[tokio::test]
async fn list_returns_every_task() {
    let transport = ScriptedTransport::new();
    let body = json!([
        {"task_id": "a", "state": "running"},
        {"task_id": "b", "state": "finished"},
    ]);
    transport.route("/pulp/api/v2/tasks/", vec![(200, body.to_string())]);
    let conn = transport.connection();

    let tasks = Task::list(&conn).await.unwrap();
    let states: Vec<(&str, &str)> = tasks.iter().map(|t| (t.id(), t.state())).collect();
    assert_eq!(states, [("a", "running"), ("b", "finished")]);
}

// --- responses carrying tasks ---

#[tokio::test(start_paused = true)]
async fn wait_for_response_stops_at_the_first_failure() {
    let transport = ScriptedTransport::new();
    transport.task_with("x", &["error"], Some(json!("disk full")), &[]);
    transport.task("y", &["finished"]);
    let conn = transport.connection();
    let response = HttpResponse::new(
        200,
        json!([
            {"task_id": "x", "state": "waiting"},
            {"task_id": "y", "state": "waiting"},
        ])
        .to_string(),
    );

    let err = Task::wait_for_response(&conn, &response, Duration::from_secs(30))
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::TaskFailure { ref task, .. } if task.id() == "x"));
    assert_eq!(transport.dispatch_count(&task_path("y")), 0);
}

// --- call reports and spawned trees ---

#[tokio::test(start_paused = true)]
async fn report_with_a_single_spawned_task() {
    let transport = ScriptedTransport::new();
    transport.task("A", &["running", "finished"]);
    let conn = transport.connection();

    Task::wait_for_report(&conn, &report(&["A"]), Duration::from_secs(30))
        .await
        .unwrap();

    assert!(transport.dispatch_count(&task_path("A")) >= 2);
}

#[tokio::test(start_paused = true)]
async fn report_waits_for_every_level_of_spawned_tasks() {
    let transport = ScriptedTransport::new();
    transport.task_with("parent", &["running", "finished"], None, &["c1", "c2"]);
    transport.task("c1", &["finished"]);
    transport.task("c2", &["running", "running", "finished"]);
    let conn = transport.connection();

    Task::wait_for_report(&conn, &report(&["parent"]), Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(
        first_polls(&transport),
        [task_path("parent"), task_path("c1"), task_path("c2")]
    );
    let c2 = Task::get(&conn, "c2").await.unwrap();
    assert_eq!(c2.state(), "finished");
}

#[tokio::test(start_paused = true)]
async fn spawned_tasks_are_visited_depth_first() {
    let transport = ScriptedTransport::new();
    transport.task_with("p", &["finished"], None, &["q", "r"]);
    transport.task_with("q", &["finished"], None, &["q1"]);
    transport.task("q1", &["finished"]);
    transport.task("r", &["finished"]);
    let conn = transport.connection();

    Task::wait_for_report(&conn, &report(&["p"]), Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(
        first_polls(&transport),
        [task_path("p"), task_path("q"), task_path("q1"), task_path("r")]
    );
}

#[tokio::test(start_paused = true)]
async fn failure_in_a_spawned_task_surfaces() {
    let transport = ScriptedTransport::new();
    transport.task_with("parent", &["finished"], None, &["child"]);
    transport.task_with("child", &["running", "error"], Some(json!({"code": "PLP0001"})), &[]);
    let conn = transport.connection();

    let err = Task::wait_for_report(&conn, &report(&["parent"]), Duration::from_secs(30))
        .await
        .unwrap_err();

    match err {
        ApiError::TaskFailure { task, error } => {
            assert_eq!(task.id(), "child");
            assert_eq!(error["code"], "PLP0001");
        }
        other => panic!("expected task failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn spawn_depth_cap_is_enforced() {
    let transport = ScriptedTransport::new();
    transport.task_with("parent", &["finished"], None, &["child"]);
    transport.task("child", &["finished"]);
    let conn = transport.connection();
    let options = TreeWaitOptions {
        max_depth: Some(1),
        ..TreeWaitOptions::default()
    };

    let err = Task::wait_for_report_with(&conn, &report(&["parent"]), &options)
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::SpawnDepthExceeded { max_depth: 1 }));
    assert_eq!(transport.dispatch_count(&task_path("child")), 0);
}

#[tokio::test(start_paused = true)]
async fn vanished_spawned_task_is_skipped() {
    let transport = ScriptedTransport::new();
    transport.task("present", &["finished"]);
    let conn = transport.connection();

    Task::wait_for_report(&conn, &report(&["gone", "present"]), Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(transport.dispatch_count(&task_path("gone")), 1);
    assert!(transport.dispatch_count(&task_path("present")) >= 2);
}

#[tokio::test(start_paused = true)]
async fn vanished_spawned_task_is_skipped_on_a_strict_connection() {
    let transport = ScriptedTransport::new();
    transport.task("present", &["running", "finished"]);
    let conn = transport.strict_connection();

    Task::wait_for_report(&conn, &report(&["gone", "present"]), Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(transport.dispatch_count(&task_path("gone")), 1);
}

#[tokio::test(start_paused = true)]
async fn wait_for_reports_aborts_on_the_first_failing_report() {
    let transport = ScriptedTransport::new();
    transport.task_with("x", &["error"], Some(json!("nope")), &[]);
    transport.task("y", &["finished"]);
    let conn = transport.connection();

    let err = Task::wait_for_reports(&conn, &[report(&["x"]), report(&["y"])], Duration::from_secs(30))
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::TaskFailure { .. }));
    assert_eq!(transport.dispatch_count(&task_path("y")), 0);
}

#[tokio::test(start_paused = true)]
async fn empty_report_needs_no_polling() {
    let transport = ScriptedTransport::new();
    let conn = transport.connection();

    Task::wait_for_report(&conn, &report(&[]), Duration::from_secs(30))
        .await
        .unwrap();

    assert!(transport.dispatched().is_empty());
}
