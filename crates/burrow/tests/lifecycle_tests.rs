//! Server lifecycle tests against a real listener.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{Router, routing::get};
use burrow::server::Listener;
use burrow::{Phase, Server, ServerConfig, ServerError, Shutdown, exit_code};
use burrow_sandbox::{NoopSandbox, Permissions, Promise, Sandbox, SandboxError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, oneshot};

mod common;
use common::{field, http_get, served_dir, test_logging, wait_for_serving};

fn config(dir: &Path, address: &str, timeout: Duration) -> ServerConfig {
    ServerConfig::new(address, dir, timeout).unwrap()
}

/// Sandbox that fails when locking the visibility list.
#[derive(Clone, Default)]
struct LockFails {
    calls: Arc<Mutex<Vec<&'static str>>>,
}

impl Sandbox for LockFails {
    fn restrict_visibility(&self, _: &Path, _: Permissions) -> Result<(), SandboxError> {
        self.calls.lock().unwrap().push("unveil");
        Ok(())
    }

    fn lock_visibility(&self) -> Result<(), SandboxError> {
        self.calls.lock().unwrap().push("unveil block");
        Err(SandboxError::UnveilBlock(std::io::Error::from(
            std::io::ErrorKind::PermissionDenied,
        )))
    }

    fn restrict_syscalls(&self, _: &[Promise]) -> Result<(), SandboxError> {
        self.calls.lock().unwrap().push("pledge");
        Ok(())
    }
}

/// Listener whose accept always fails.
struct Broken;

impl Listener for Broken {
    type Io = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        Err(io::Error::other("listener broken"))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 9)))
    }
}

#[tokio::test]
async fn test_immediate_signal_stops_gracefully() {
    let temp = served_dir();
    let (logging, logs) = test_logging();
    let server = Server::new(
        config(temp.path(), "127.0.0.1:0", Duration::from_millis(50)),
        logging,
    );
    let phase = server.subscribe();

    let started = Instant::now();
    let result = server.run(NoopSandbox, std::future::ready(())).await;

    assert_eq!(result.as_ref().unwrap(), &Shutdown::Graceful);
    assert_eq!(exit_code(&result), 0);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(*phase.borrow(), Phase::Stopped);

    assert!(logs.entries("request received").is_empty());
    assert!(logs.entries("response completed").is_empty());
    assert_eq!(logs.entries("sandbox negotiated").len(), 1);
    assert_eq!(logs.entries("starting").len(), 1);
    assert_eq!(logs.entries("stopped").len(), 1);
}

#[tokio::test]
async fn test_serves_files_and_logs_remote_address() {
    let temp = served_dir();
    let (logging, logs) = test_logging();
    let server = Server::new(
        config(temp.path(), "127.0.0.1:0", Duration::from_secs(1)),
        logging,
    );
    let phase = server.subscribe();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run(NoopSandbox, async move {
        let _ = stop_rx.await;
    }));

    let addr = wait_for_serving(phase).await.expect("server should be serving");
    let response = http_get(addr, "/hello.txt").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with("hello world"));

    let response = http_get(addr, "/missing.txt").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");

    stop_tx.send(()).unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), Shutdown::Graceful);

    let received = logs.entries("request received");
    assert_eq!(received.len(), 2);
    let remote = field(&received[0], "remote").unwrap();
    assert!(remote.starts_with("127.0.0.1:"), "{remote}");

    let statuses: Vec<_> = logs
        .entries("response completed")
        .iter()
        .map(|line| field(line, "status").unwrap().to_string())
        .collect();
    assert_eq!(statuses, vec!["200", "404"]);
}

#[tokio::test]
async fn test_shutdown_timeout_abandons_slow_request() {
    let temp = served_dir();
    let entered = Arc::new(Notify::new());
    let app = {
        let entered = entered.clone();
        Router::new().route(
            "/slow",
            get(move || {
                let entered = entered.clone();
                async move {
                    entered.notify_one();
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    "done"
                }
            }),
        )
    };

    let (logging, logs) = test_logging();
    let server = Server::with_app(
        config(temp.path(), "127.0.0.1:0", Duration::from_millis(10)),
        logging,
        app,
    );
    let phase = server.subscribe();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run(NoopSandbox, async move {
        let _ = stop_rx.await;
    }));

    let addr = wait_for_serving(phase).await.unwrap();
    let client = tokio::spawn(async move { http_get(addr, "/slow").await });
    entered.notified().await;

    let started = Instant::now();
    stop_tx.send(()).unwrap();
    let result = handle.await.unwrap();

    assert_eq!(result.as_ref().unwrap(), &Shutdown::Ungraceful);
    assert_eq!(exit_code(&result), 0);
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "shutdown took {:?}",
        started.elapsed()
    );

    // well past the handler's sleep
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(logs.entries("request received").len(), 1);
    assert!(logs.entries("response completed").is_empty());
    assert_eq!(logs.entries("shutdown ungraceful").len(), 1);

    let response = client.await.unwrap().unwrap_or_default();
    assert!(!response.contains("200 OK"), "{response}");
}

#[tokio::test]
async fn test_bare_port_listens_on_all_interfaces() {
    let temp = served_dir();
    let (logging, logs) = test_logging();
    let server = Server::new(config(temp.path(), ":0", Duration::from_secs(1)), logging);
    let phase = server.subscribe();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run(NoopSandbox, async move {
        let _ = stop_rx.await;
    }));

    let addr = wait_for_serving(phase).await.expect("server should be serving");
    assert!(addr.ip().is_unspecified(), "{addr}");
    assert_ne!(addr.port(), 0);

    let loopback = SocketAddr::from(([127, 0, 0, 1], addr.port()));
    let response = http_get(loopback, "/hello.txt").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");

    stop_tx.send(()).unwrap();
    let result = handle.await.unwrap();
    assert_eq!(result.as_ref().unwrap(), &Shutdown::Graceful);
    assert_eq!(exit_code(&result), 0);
    assert_eq!(logs.entries("response completed").len(), 1);
}

#[tokio::test]
async fn test_slow_headers_are_disconnected() {
    let temp = served_dir();
    let (logging, logs) = test_logging();
    let mut config = config(temp.path(), "127.0.0.1:0", Duration::from_secs(1));
    config.header_timeout = Duration::from_millis(100);
    let server = Server::new(config, logging);
    let phase = server.subscribe();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run(NoopSandbox, async move {
        let _ = stop_rx.await;
    }));

    let addr = wait_for_serving(phase).await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /hello.txt HTTP/1.1\r\nHost: local")
        .await
        .unwrap();

    let mut response = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut response))
        .await
        .expect("connection should be closed by the server");
    if read.is_ok() {
        let response = String::from_utf8_lossy(&response);
        assert!(!response.contains("200 OK"), "{response}");
    }
    assert!(logs.entries("request received").is_empty());

    stop_tx.send(()).unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), Shutdown::Graceful);
}

#[tokio::test]
async fn test_accept_failure_is_server_failure() {
    let temp = served_dir();
    let (logging, logs) = test_logging();
    let server = Server::new(
        config(temp.path(), "127.0.0.1:0", Duration::from_millis(50)),
        logging,
    );
    let phase = server.subscribe();

    let result = server
        .run_on(
            NoopSandbox,
            |_address: String| async { Ok::<_, io::Error>(Broken) },
            std::future::pending(),
        )
        .await;

    let err = result.as_ref().unwrap_err();
    assert!(matches!(err, ServerError::Serve(_)));
    assert!(err.to_string().contains("listener broken"), "{err}");
    assert_eq!(exit_code(&result), 3);
    assert_eq!(*phase.borrow(), Phase::Failed);
    assert_eq!(logs.entries("starting").len(), 1);
    assert!(logs.entries("stopped").is_empty());
}

#[tokio::test]
async fn test_lock_failure_never_opens_listener() {
    let temp = served_dir();
    let reserved = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let (logging, logs) = test_logging();
    let server = Server::new(
        config(temp.path(), &addr.to_string(), Duration::from_millis(50)),
        logging,
    );
    let phase = server.subscribe();
    let sandbox = LockFails::default();

    let result = server.run(sandbox.clone(), std::future::pending()).await;

    let err = result.as_ref().unwrap_err();
    assert!(matches!(
        err,
        ServerError::Sandbox(SandboxError::UnveilBlock(_))
    ));
    assert_eq!(exit_code(&result), 2);
    assert_eq!(*phase.borrow(), Phase::Failed);
    assert_eq!(*sandbox.calls.lock().unwrap(), vec!["unveil", "unveil block"]);

    assert!(logs.entries("starting").is_empty());
    assert!(std::net::TcpStream::connect(addr).is_err());
}

#[tokio::test]
async fn test_address_in_use_is_startup_failure() {
    let temp = served_dir();
    let occupied = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = occupied.local_addr().unwrap();

    let (logging, _logs) = test_logging();
    let server = Server::new(
        config(temp.path(), &addr.to_string(), Duration::from_millis(50)),
        logging,
    );

    let result = server.run(NoopSandbox, std::future::pending()).await;

    assert!(matches!(result, Err(ServerError::Bind { .. })));
    assert_eq!(exit_code(&result), 3);
    drop(occupied);
}

#[tokio::test]
async fn test_removed_directory_is_config_failure() {
    let temp = served_dir();
    let config = config(temp.path(), "127.0.0.1:0", Duration::from_millis(50));
    drop(temp);

    let (logging, _logs) = test_logging();
    let server = Server::new(config, logging);
    let phase = server.subscribe();

    let result = server.run(NoopSandbox, std::future::pending()).await;

    assert!(matches!(result, Err(ServerError::Config(_))));
    assert_eq!(exit_code(&result), 1);
    assert_eq!(*phase.borrow(), Phase::Failed);
}
