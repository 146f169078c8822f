use std::io::Write;
use std::net::TcpListener;
use std::time::Duration;

use reqwest::Client;
use tempfile::{NamedTempFile, TempDir};
use tokio::time::{sleep, timeout};

/// Find an available port
fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A config with every path inside `dir`, plus `extra` sections.
fn config_in(dir: &TempDir, port: u16, extra: &str) -> NamedTempFile {
    let content = format!(
        r#"
[server]
host = "127.0.0.1"
port = {port}

[database]
path = "{db}"

[storage]
root = "{objects}"
{extra}
"#,
        db = dir.path().join("crawlforge.db").display(),
        objects = dir.path().join("objects").display(),
    );

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// Spawn the server and return a handle
fn spawn_server(config_path: &std::path::Path) -> tokio::process::Child {
    tokio::process::Command::new(env!("CARGO_BIN_EXE_crawlforge"))
        .env("CRAWLFORGE_CONFIG", config_path)
        .env("RUST_LOG", "error")
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to spawn server")
}

/// Wait for server to be ready
async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    let client = Client::new();
    for _ in 0..max_attempts {
        if client
            .get(format!("http://127.0.0.1:{}/api/v1/health", port))
            .send()
            .await
            .is_ok()
        {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn get_json(port: u16, path: &str) -> serde_json::Value {
    let response = Client::new()
        .get(format!("http://127.0.0.1:{}{}", port, path))
        .send()
        .await
        .expect("Failed to send request");
    assert!(response.status().is_success());
    response.json().await.expect("Failed to parse JSON")
}

async fn exit_status_for(config_path: &std::path::Path) -> std::process::ExitStatus {
    timeout(
        Duration::from_secs(5),
        tokio::process::Command::new(env!("CARGO_BIN_EXE_crawlforge"))
            .env("CRAWLFORGE_CONFIG", config_path)
            .env("RUST_LOG", "error")
            .output(),
    )
    .await
    .expect("Command timed out")
    .expect("Failed to execute command")
    .status
}

#[tokio::test]
async fn test_health_and_config_endpoints() {
    let dir = TempDir::new().unwrap();
    let port = get_available_port();
    let config = config_in(&dir, port, "");

    let mut server = spawn_server(config.path());
    assert!(wait_for_server(port, 40).await, "Server did not start in time");

    let health = get_json(port, "/api/v1/health").await;
    assert_eq!(health["status"], "ok");

    let config_json = get_json(port, "/api/v1/config").await;
    assert_eq!(config_json["server"]["port"], port);
    assert_eq!(config_json["worker"]["endpoint_configured"], false);

    server.kill().await.ok();
}

#[tokio::test]
async fn test_orchestrator_unavailable_without_worker_endpoint() {
    let dir = TempDir::new().unwrap();
    let port = get_available_port();
    let config = config_in(&dir, port, "");

    let mut server = spawn_server(config.path());
    assert!(wait_for_server(port, 40).await, "Server did not start in time");

    let status = get_json(port, "/api/v1/status").await;
    assert_eq!(status["available"], false);

    server.kill().await.ok();
}

#[tokio::test]
async fn test_orchestrator_runs_with_worker_endpoint() {
    let dir = TempDir::new().unwrap();
    let port = get_available_port();
    let config = config_in(
        &dir,
        port,
        r#"
[worker]
endpoint = "http://127.0.0.1:9"
pool_size = 2

[budget]
max_concurrent_chunks = 2
"#,
    );

    let mut server = spawn_server(config.path());
    assert!(wait_for_server(port, 40).await, "Server did not start in time");

    let status = get_json(port, "/api/v1/status").await;
    assert_eq!(status["available"], true);
    assert_eq!(status["status"]["running"], true);
    assert_eq!(status["status"]["broker"], "local_pool");
    assert_eq!(status["status"]["resources"]["active_chunks"]["known"], 0);
    assert_eq!(status["pool"]["pool_size"], 2);

    let metrics = Client::new()
        .get(format!("http://127.0.0.1:{}/metrics", port))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("crawlforge_orchestrator_running 1"));

    server.kill().await.ok();
}

#[tokio::test]
async fn test_missing_config_file_exits_with_error() {
    let status = exit_status_for(std::path::Path::new("/nonexistent/config.toml")).await;
    assert!(!status.success());
}

#[tokio::test]
async fn test_scratch_budget_smaller_than_one_chunk_exits_with_error() {
    let dir = TempDir::new().unwrap();
    let config = config_in(
        &dir,
        get_available_port(),
        r#"
[budget]
max_scratch_bytes = 1024
chunk_item_count = 500
estimated_bytes_per_item = 1024
"#,
    );

    let status = exit_status_for(config.path()).await;
    assert!(!status.success());
}
