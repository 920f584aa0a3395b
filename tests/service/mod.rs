use jobgate::config::Settings;
use jobgate::orchestrator::JobOrchestrator;
use jobgate::registry::RunRegistry;
use jobgate::service::Service;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn service(root: &Path, allow_exec: bool) -> Service {
    let settings = Settings {
        max_concurrent: 1,
        default_timeout: Duration::from_secs(5),
        output_dir: root.join("output"),
        upload_dir: root.join("uploads"),
        allow_exec,
        ..Settings::default()
    };
    fs::create_dir_all(&settings.upload_dir).expect("mkdir uploads");
    Service::new(JobOrchestrator::new(
        Arc::new(settings),
        Arc::new(RunRegistry::new()),
    ))
}

async fn call(service: &Service, request: Value) -> Value {
    service.handle_line(&request.to_string()).await
}

#[tokio::test]
async fn malformed_line_is_invalid_request() {
    let dir = tempdir().expect("tempdir");
    let service = service(dir.path(), false);

    let response = service.handle_line("{not json").await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "invalid_request");
    assert!(response.get("id").is_none());
}

#[tokio::test]
async fn missing_or_unknown_op_is_invalid_request() {
    let dir = tempdir().expect("tempdir");
    let service = service(dir.path(), false);

    let response = call(&service, json!({"id": 1})).await;
    assert_eq!(response["id"], 1);
    assert_eq!(response["error"]["code"], "invalid_request");

    let response = call(&service, json!({"id": "x", "op": "reboot"})).await;
    assert_eq!(response["id"], "x");
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn exec_is_refused_unless_enabled() {
    let dir = tempdir().expect("tempdir");
    let service = service(dir.path(), false);

    let response = call(&service, json!({"op": "exec", "argv": ["echo", "hi"]})).await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "invalid_request");
    assert!(service.orchestrator().registry().is_empty());
}

#[tokio::test]
async fn exec_round_trip_through_queries() {
    let dir = tempdir().expect("tempdir");
    let service = service(dir.path(), true);

    let response = call(
        &service,
        json!({"id": 7, "op": "exec", "argv": ["/bin/sh", "-c", "echo hello; echo oops >&2"]}),
    )
    .await;
    assert_eq!(response["id"], 7);
    assert_eq!(response["ok"], true);

    let result = &response["result"];
    assert_eq!(result["status"], "completed");
    assert_eq!(result["kind"], "exec");
    assert_eq!(result["exit_code"], 0);
    assert_eq!(result["stdout"], "hello\n");
    assert_eq!(result["stderr"], "oops\n");
    assert_eq!(result["artifacts"], json!([]));
    let run_id = result["run_id"].as_str().expect("run id").to_string();

    let fetched = call(&service, json!({"op": "get_run", "run_id": run_id})).await;
    assert_eq!(fetched["ok"], true);
    assert_eq!(fetched["result"]["run_id"], run_id.as_str());
    assert!(fetched["result"].get("stdout").is_none());
    assert!(fetched["result"]["artifacts"].is_array());

    let fetched = call(
        &service,
        json!({
            "op": "get_run",
            "run_id": run_id,
            "include_stdout": true,
            "include_artifacts": false,
        }),
    )
    .await;
    assert_eq!(fetched["result"]["stdout"], "hello\n");
    assert!(fetched["result"].get("artifacts").is_none());

    let listed = call(&service, json!({"op": "list_runs", "kind": "exec"})).await;
    assert_eq!(listed["result"]["count"], 1);
    assert_eq!(listed["result"]["runs"][0]["run_id"], run_id.as_str());

    let listed = call(&service, json!({"op": "list_runs", "status": "failed"})).await;
    assert_eq!(listed["result"]["count"], 0);
}

#[tokio::test]
async fn failed_run_is_still_an_ok_response() {
    let dir = tempdir().expect("tempdir");
    let service = service(dir.path(), true);

    let response = call(
        &service,
        json!({"op": "exec", "argv": ["/bin/sh", "-c", "echo broken >&2; exit 2"]}),
    )
    .await;
    assert_eq!(response["ok"], true);
    assert_eq!(response["result"]["status"], "failed");
    assert_eq!(response["result"]["exit_code"], 2);
    assert_eq!(response["result"]["error"], "broken");
}

#[tokio::test]
async fn validation_failures_create_no_run() {
    let dir = tempdir().expect("tempdir");
    let service = service(dir.path(), false);

    let response = call(&service, json!({"op": "scan", "target": "/etc/passwd"})).await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "path_not_allowed");

    let response = call(
        &service,
        json!({"op": "reverse", "filepath": dir.path().join("uploads").join("missing.so")}),
    )
    .await;
    assert_eq!(response["error"]["code"], "path_not_found");
    assert!(service.orchestrator().registry().is_empty());
}

#[tokio::test]
async fn unknown_run_and_bad_status() {
    let dir = tempdir().expect("tempdir");
    let service = service(dir.path(), false);

    let response = call(&service, json!({"op": "get_run", "run_id": "nope"})).await;
    assert_eq!(response["error"]["code"], "not_found");

    let response = call(&service, json!({"op": "list_runs", "status": "sleeping"})).await;
    assert_eq!(response["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn list_active_runs_reports_ceiling() {
    let dir = tempdir().expect("tempdir");
    let service = service(dir.path(), false);

    let response = call(&service, json!({"op": "list_active_runs"})).await;
    assert_eq!(response["ok"], true);
    assert_eq!(response["result"]["count"], 0);
    assert_eq!(response["result"]["active_runs"], json!([]));
    assert_eq!(response["result"]["max_concurrent"], 1);
}

#[tokio::test]
async fn in_flight_run_is_listed_as_running() {
    let dir = tempdir().expect("tempdir");
    let service = service(dir.path(), true);
    let marker = dir.path().join("started");

    let worker = service.clone();
    let script = format!("touch '{}'; sleep 1", marker.display());
    let submission = tokio::spawn(async move {
        call(&worker, json!({"op": "exec", "argv": ["/bin/sh", "-c", script]})).await
    });

    for _ in 0..200 {
        if marker.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(marker.exists(), "job never started");

    let active = call(&service, json!({"op": "list_active_runs"})).await;
    assert_eq!(active["result"]["count"], 1);
    let entry = &active["result"]["active_runs"][0];
    assert_eq!(entry["status"], "running");
    let run_id = entry["run_id"].as_str().expect("run id").to_string();

    let fetched = call(&service, json!({"op": "get_run", "run_id": run_id})).await;
    assert_eq!(fetched["result"]["status"], "running");

    let finished = submission.await.expect("join");
    assert_eq!(finished["result"]["status"], "completed");

    let active = call(&service, json!({"op": "list_active_runs"})).await;
    assert_eq!(active["result"]["count"], 0);
    let fetched = call(&service, json!({"op": "get_run", "run_id": run_id})).await;
    assert_eq!(fetched["result"]["status"], "completed");
}

#[tokio::test]
async fn serve_answers_every_line_with_its_id() {
    let dir = tempdir().expect("tempdir");
    let service = Arc::new(service(dir.path(), true));

    let input = [
        json!({"id": 1, "op": "exec", "argv": ["echo", "one"]}).to_string(),
        String::new(),
        json!({"id": 2, "op": "list_active_runs"}).to_string(),
        "garbage".to_string(),
    ]
    .join("\n");

    let mut output = Vec::new();
    Arc::clone(&service)
        .serve(input.as_bytes(), &mut output)
        .await
        .expect("serve");

    let responses: Vec<Value> = String::from_utf8(output)
        .expect("utf8")
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    assert_eq!(responses.len(), 3);

    let by_id: HashMap<String, &Value> = responses
        .iter()
        .map(|r| (r.get("id").map(|id| id.to_string()).unwrap_or_default(), r))
        .collect();
    assert_eq!(by_id["1"]["result"]["stdout"], "one\n");
    assert_eq!(by_id["2"]["result"]["max_concurrent"], 1);
    assert_eq!(by_id[""]["error"]["code"], "invalid_request");
}
