//! Test utilities and common setup.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use burrow::{LogSettings, Logging, Phase};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// In-memory log sink.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Lines whose message is `message`.
    pub fn entries(&self, message: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|line| line.contains(message))
            .collect()
    }
}

/// Logging context writing plain text to a [`LogCapture`], ignoring `RUST_LOG`.
pub fn test_logging() -> (Logging, LogCapture) {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let settings = LogSettings::default();
    let filter = EnvFilter::new(settings.default_directives());
    let logging = Logging::with_filter(&settings, filter, move || writer.clone());
    (logging, capture)
}

/// Value of `key=value` in a text log line.
pub fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("{key}=");
    line.split_whitespace()
        .find_map(|token| token.strip_prefix(needle.as_str()))
}

/// Served directory with a couple of files.
pub fn served_dir() -> TempDir {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("hello.txt"), "hello world").unwrap();
    std::fs::write(temp.path().join("other.txt"), "other").unwrap();
    temp
}

/// Wait until the server is serving and return its address, or `None` if it
/// failed first.
pub async fn wait_for_serving(mut phase: watch::Receiver<Phase>) -> Option<SocketAddr> {
    let state = *phase
        .wait_for(|p| matches!(p, Phase::Serving(_) | Phase::Failed))
        .await
        .unwrap();
    match state {
        Phase::Serving(addr) => Some(addr),
        _ => None,
    }
}

/// Send a bare HTTP/1.1 GET and return the raw response.
pub async fn http_get(addr: SocketAddr, path: &str) -> io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}
