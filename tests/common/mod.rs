//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

use wtvp_server::config::parse_config;
use wtvp_server::net::Listener;
use wtvp_server::{SessionRegistry, Shutdown, WtvpServer};

pub const TICKET: &str = "VGVzdFRpY2tldA==";
pub const CHALLENGE: &str = "AAECAwQFBgcICQoLDA0ODw==";

/// A server bound to an ephemeral port, serving a temporary vault.
pub struct TestServer {
    pub addr: SocketAddr,
    pub server: WtvpServer,
    pub shutdown: Shutdown,
    pub dir: tempfile::TempDir,
}

impl TestServer {
    /// Start with `extra` appended to a config that points at a fresh vault.
    pub async fn start(extra: &str) -> Self {
        Self::start_with_framing("idle", extra).await
    }

    /// Like `start`, with an explicit frame boundary strategy.
    pub async fn start_with_framing(strategy: &str, extra: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let vault = dir.path().join("vault");
        let logs = dir.path().join("logs");

        write(&vault.join("wtv-home/home.html"), b"<html>home</html>");
        write(
            &vault.join("wtv-1800/preregister.txt"),
            b"200 OK\nwtv-open-isp-disabled: false\nContent-Type: text/html\n\n<html>welcome</html>",
        );

        let text = format!(
            r#"
            [framing]
            strategy = "{}"
            idle_dispatch_ms = 200

            [vault]
            root = "{}"
            log_dir = "{}"

            {}
            "#,
            strategy,
            vault.display().to_string().replace('\\', "/"),
            logs.display().to_string().replace('\\', "/"),
            extra
        );
        let config = parse_config(&text).unwrap();

        let server = WtvpServer::new(config, SessionRegistry::new(None));
        let listener = Listener::bind("127.0.0.1", 0, Arc::new(Semaphore::new(16)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = Shutdown::new();
        {
            let server = server.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.serve(vec![listener], &shutdown).await });
        }

        Self {
            addr,
            server,
            shutdown,
            dir,
        }
    }

    pub async fn connect(&self) -> WtvpClient {
        WtvpClient {
            stream: TcpStream::connect(self.addr).await.unwrap(),
        }
    }

    pub fn logs(&self) -> std::path::PathBuf {
        self.dir.path().join("logs")
    }
}

fn write(path: &Path, content: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// A response as read off the wire; the body may still be ciphertext.
#[derive(Debug)]
pub struct RawResponse {
    pub head: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn status(&self) -> &str {
        self.head.lines().next().unwrap_or_default().trim_end_matches('\r')
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(": ")?;
            (key.eq_ignore_ascii_case(name)).then_some(value.trim_end_matches('\r'))
        })
    }
}

/// Raw TCP client speaking WTVP.
pub struct WtvpClient {
    pub stream: TcpStream,
}

impl WtvpClient {
    pub async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Read one response framed by its `Content-Length`.
    pub async fn read_response(&mut self) -> RawResponse {
        tokio::time::timeout(Duration::from_secs(5), self.read_inner())
            .await
            .expect("no response within 5s")
    }

    async fn read_inner(&mut self) -> RawResponse {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];

        let head_end = loop {
            if let Some(pos) = buf.windows(2).position(|w| w == b"\n\n") {
                break pos + 2;
            }
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before a response arrived");
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        let length: usize = head
            .lines()
            .find_map(|line| {
                let (key, value) = line.split_once(": ")?;
                key.eq_ignore_ascii_case("Content-Length")
                    .then(|| value.trim().parse().ok())
                    .flatten()
            })
            .unwrap_or(0);

        while buf.len() < head_end + length {
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed mid-body");
            buf.extend_from_slice(&chunk[..n]);
        }

        RawResponse {
            head,
            body: buf[head_end..head_end + length].to_vec(),
        }
    }

    /// True once the server has closed (or reset) the connection.
    pub async fn is_closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        match tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut byte)).await {
            Ok(Ok(0)) | Ok(Err(_)) => true,
            Ok(Ok(_)) | Err(_) => false,
        }
    }
}
