use chrono::Utc;
use scalefeed_broadcaster::{HubConfig, LiveHub};
use scalefeed_daemon::ipc::handle_connection;
use scalefeed_daemon::{ControlContext, ControlServer, Pipeline};
use scalefeed_ingest::{GateConfig, LinkConfig, LinkManager, SerialOpener};
use scalefeed_store::{LivePayload, Measurement, MemoryRecordStore, RecordStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Notify;

fn context() -> ControlContext {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let hub = LiveHub::new(HubConfig::default(), Some(Arc::clone(&store)));
    let pipeline = Pipeline::new(hub, store, GateConfig::default(), None).unwrap();

    ControlContext {
        pipeline,
        link: Arc::new(LinkManager::new(SerialOpener, LinkConfig::default())),
        shutdown: Arc::new(Notify::new()),
    }
}

async fn send(context: &ControlContext, command: &str) -> String {
    let (mut client, server) = duplex(64 * 1024);
    client.write_all(command.as_bytes()).await.unwrap();
    handle_connection(server, context).await.unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    response.trim_end().to_string()
}

#[tokio::test]
async fn test_status_reports_link_and_store() {
    let context = context();
    let response = send(&context, "status\n").await;
    let status: serde_json::Value = serde_json::from_str(&response).unwrap();

    assert_eq!(status["linkState"], "closed");
    assert_eq!(status["linkEnabled"], false);
    assert_eq!(status["openAttempts"], 0);
    assert_eq!(status["subscribers"], 0);
    assert_eq!(status["storedRecords"], 0);
    assert!(status["latest"]["weight"].is_null());
}

#[tokio::test]
async fn test_latest_returns_current_payload() {
    let context = context();
    assert!(serde_json::from_str::<LivePayload>(&send(&context, "latest\n").await)
        .unwrap()
        .is_empty());

    context
        .pipeline
        .process(Measurement {
            weight: 6.5,
            volume: 700.0,
            price: 210.0,
            fee_type: Some('E'),
            timestamp: Utc::now(),
        })
        .unwrap()
        .await
        .unwrap();

    let latest: LivePayload = serde_json::from_str(&send(&context, "latest\n").await).unwrap();
    assert_eq!(latest.weight, Some(6.5));
    assert_eq!(latest.fee_type.as_deref(), Some("E"));
    assert_eq!(latest.id, Some(1));

    let status: serde_json::Value = serde_json::from_str(&send(&context, "status\n").await).unwrap();
    assert_eq!(status["storedRecords"], 1);
}

#[tokio::test]
async fn test_publish_updates_live_payload() {
    let context = context();
    let response = send(
        &context,
        "publish {\"id\":31,\"weight\":9.0,\"volume\":1000.0,\"price\":400.0,\"feeType\":\"B\",\"timestamp\":\"2024-06-01T08:30:00Z\"}\n",
    )
    .await;

    let published: LivePayload = serde_json::from_str(&response).unwrap();
    assert_eq!(published.id, Some(31));
    assert_eq!(context.pipeline.latest().id, Some(31));
    assert_eq!(context.pipeline.latest().weight, Some(9.0));
}

#[tokio::test]
async fn test_errors_answered_in_band() {
    let context = context();

    let response = send(&context, "toggle\n").await;
    assert!(response.starts_with("Error: Unknown command"), "{}", response);

    let response = send(&context, "publish {not json}\n").await;
    assert!(response.starts_with("Error: Invalid record"), "{}", response);
}

#[tokio::test]
async fn test_quit_requests_shutdown() {
    let context = context();
    assert_eq!(send(&context, "quit\n").await, "Shutting down");

    tokio::time::timeout(Duration::from_secs(1), context.shutdown.notified())
        .await
        .expect("shutdown requested");
}

#[tokio::test]
async fn test_control_server_over_unix_socket() {
    let temp_dir = tempdir().unwrap();
    let socket_path = temp_dir.path().join("control.sock");

    let server = ControlServer::bind(&socket_path, context()).unwrap();
    assert_eq!(server.socket_path(), socket_path.as_path());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let task = tokio::spawn(server.run());

    for _ in 0..2 {
        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        stream.write_all(b"latest\n").await.unwrap();
        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        let latest: LivePayload = serde_json::from_str(response.trim_end()).unwrap();
        assert!(latest.is_empty());
    }

    task.abort();
}
