//! End-to-end node lifecycle against a mocked panel and a real inbound

use async_trait::async_trait;
use serde_json::{json, Value};
use std::net::TcpListener as StdTcpListener;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vmess_node::config::{CertConfig, PanelConfig, ServiceConfig};
use vmess_node::panel::HttpPanelClient;
use vmess_node::proxy::hooks::{StatsCollector, TransportStream};
use vmess_node::proxy::{InboundHandler, ProxyController, Session};
use vmess_node::{NodeError, NodeService, Service};

const NODE_ID: u32 = 3;
const TOKEN: &str = "secret";

/// Reads a uuid line, answers "ok"/"denied", then echoes and counts bytes
struct EchoInbound;

#[async_trait]
impl InboundHandler for EchoInbound {
    async fn handle(&self, stream: TransportStream, session: Session) -> anyhow::Result<()> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let Some(guard) = session.login(line.trim()) else {
            reader.get_mut().write_all(b"denied\n").await?;
            return Ok(());
        };
        reader.get_mut().write_all(b"ok\n").await?;

        let mut buf = [0u8; 512];
        loop {
            tokio::select! {
                n = reader.read(&mut buf) => {
                    let n = n?;
                    if n == 0 {
                        return Ok(());
                    }
                    session.stats.record_upload(guard.user_id(), n as u64);
                    reader.get_mut().write_all(&buf[..n]).await?;
                    session.stats.record_download(guard.user_id(), n as u64);
                }
                _ = guard.token().cancelled() => return Ok(()),
            }
        }
    }
}

fn write_self_signed(dir: &Path) -> CertConfig {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_file = dir.join("server.crt");
    let key_file = dir.join("server.key");
    std::fs::write(&cert_file, certified.cert.pem()).unwrap();
    std::fs::write(&key_file, certified.key_pair.serialize_pem()).unwrap();
    CertConfig {
        cert_file,
        key_file,
    }
}

fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn users_body(users: &[(i64, &str)]) -> Value {
    json!({
        "users": users
            .iter()
            .map(|(id, uuid)| json!({"id": id, "uuid": uuid}))
            .collect::<Vec<_>>()
    })
}

async fn mount_config(server: &MockServer, port: u16) {
    Mock::given(method("GET"))
        .and(path("/api/v1/server/UniProxy/config"))
        .and(query_param("node_id", NODE_ID.to_string()))
        .and(query_param("node_type", "vmess"))
        .and(header("authorization", format!("Bearer {}", TOKEN).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "server_port": port,
            "network": "tcp",
            "tls": 0
        })))
        .mount(server)
        .await;
}

async fn mount_push(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/v1/server/UniProxy/push"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": true})))
        .mount(server)
        .await;
}

fn service(server: &MockServer, dir: &TempDir, interval: Duration) -> NodeService {
    let panel = PanelConfig::new(server.uri(), TOKEN, NODE_ID).with_timeout(Duration::from_secs(2));
    let config = ServiceConfig {
        sync_interval: interval,
        close_timeout: Duration::from_secs(5),
        cert: write_self_signed(dir.path()),
        ..Default::default()
    };
    let proxy = ProxyController::new(config.listener, Arc::new(EchoInbound));
    NodeService::new(
        NODE_ID,
        config,
        Arc::new(HttpPanelClient::new(panel).unwrap()),
        Arc::new(proxy),
    )
}

async fn login(port: u16, uuid: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(format!("{}\n", uuid).as_bytes()).await.unwrap();
    let mut reply = [0u8; 16];
    let n = stream.read(&mut reply).await.unwrap();
    (stream, String::from_utf8_lossy(&reply[..n]).trim().to_string())
}

async fn pushed_traffic(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path().ends_with("/push"))
        .flat_map(|r| r.body_json::<Vec<Value>>().unwrap())
        .collect()
}

#[tokio::test]
async fn test_users_applied_and_traffic_reported_on_close() {
    let server = MockServer::start().await;
    let port = free_port();
    mount_config(&server, port).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/server/UniProxy/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(users_body(&[(1, "uuid-a"), (2, "uuid-b")])))
        .mount(&server)
        .await;
    mount_push(&server).await;

    let dir = TempDir::new().unwrap();
    let mut node = service(&server, &dir, Duration::from_secs(3600));
    node.start().await.unwrap();

    let (mut stream, reply) = login(port, "uuid-a").await;
    assert_eq!(reply, "ok");
    stream.write_all(b"hello").await.unwrap();
    let mut echo = [0u8; 5];
    stream.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"hello");

    let (_denied, reply) = login(port, "uuid-unknown").await;
    assert_eq!(reply, "denied");

    node.close().await.unwrap();

    let pushed = pushed_traffic(&server).await;
    assert_eq!(pushed, vec![json!({"user_id": 1, "u": 5, "d": 5, "n": 1})]);

    // Listener is released
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_user_set_follows_panel_between_cycles() {
    let server = MockServer::start().await;
    let port = free_port();
    mount_config(&server, port).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/server/UniProxy/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(users_body(&[(1, "uuid-a"), (2, "uuid-b")])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/server/UniProxy/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(users_body(&[(2, "uuid-b"), (3, "uuid-c")])))
        .mount(&server)
        .await;
    mount_push(&server).await;

    let dir = TempDir::new().unwrap();
    let mut node = service(&server, &dir, Duration::from_millis(300));
    node.start().await.unwrap();

    // Traffic from user 1 before it disappears from the panel
    let (mut stream, reply) = login(port, "uuid-a").await;
    assert_eq!(reply, "ok");
    stream.write_all(b"abc").await.unwrap();
    let mut echo = [0u8; 3];
    stream.read_exact(&mut echo).await.unwrap();

    let mut replaced = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if login(port, "uuid-c").await.1 == "ok" {
            replaced = true;
            break;
        }
    }
    assert!(replaced, "user 3 was never applied");
    assert_eq!(login(port, "uuid-a").await.1, "denied");
    assert_eq!(login(port, "uuid-b").await.1, "ok");

    // The removed user's connection was kicked
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    node.close().await.unwrap();

    let pushed = pushed_traffic(&server).await;
    let upload: u64 = pushed
        .iter()
        .filter(|t| t["user_id"] == 1)
        .map(|t| t["u"].as_u64().unwrap())
        .sum();
    assert_eq!(upload, 3);
}

#[tokio::test]
async fn test_unavailable_panel_is_fatal_at_start() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/server/UniProxy/config"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut node = service(&server, &dir, Duration::from_secs(60));

    let err = node.start().await.unwrap_err();
    assert!(matches!(err, NodeError::ConfigUnavailable(_)));
    assert!(err.is_fatal());
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_port_in_use_is_fatal_at_start() {
    let server = MockServer::start().await;
    let taken = StdTcpListener::bind("0.0.0.0:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    mount_config(&server, port).await;

    let dir = TempDir::new().unwrap();
    let mut node = service(&server, &dir, Duration::from_secs(60));

    let err = node.start().await.unwrap_err();
    assert!(matches!(err, NodeError::Bind { .. }));
    node.close().await.unwrap();
}
