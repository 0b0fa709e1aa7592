//! TCP client for one request/response exchange with the engine.
//!
//! A `TcpClient` owns at most one live socket. The command session creates a
//! fresh client per attempt, so requests never share a connection.

use super::frame::{read_file_frame, read_frame, write_file_frame, write_frame};
use crate::error::{OslError, Result};
use crate::timeout::Deadline;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Framed TCP client.
#[derive(Debug, Default)]
pub struct TcpClient {
    stream: Option<TcpStream>,
}

impl TcpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a socket is currently held.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Connect to `host:port`.
    ///
    /// Every address the host resolves to is tried in turn with whatever is
    /// left of `timeout`.
    pub async fn connect(&mut self, host: &str, port: u16, timeout: Option<Duration>) -> Result<()> {
        if self.stream.is_some() {
            return Err(OslError::AlreadyConnected);
        }
        let deadline = Deadline::new(timeout);
        let candidates: Vec<SocketAddr> = deadline
            .run(tokio::net::lookup_host((host, port)))
            .await?
            .collect();

        for addr in candidates {
            deadline.remaining()?;
            match deadline.run(TcpStream::connect(addr)).await {
                Ok(stream) => {
                    debug!("Connected to {}", addr);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => debug!("Connection attempt to {} failed: {}", addr, e),
            }
        }

        Err(OslError::ConnectionRefused {
            host: host.to_string(),
            port,
        })
    }

    /// Drop the socket, if any.
    pub fn disconnect(&mut self) {
        self.stream = None;
    }

    pub async fn send_message(&mut self, message: &str, timeout: Option<Duration>) -> Result<()> {
        let deadline = Deadline::new(timeout);
        let stream = self.stream_mut("send message")?;
        write_frame(stream, message.as_bytes(), &deadline).await
    }

    /// Send the content of `path` as one frame, streamed in chunks.
    pub async fn send_file(&mut self, path: &Path, timeout: Option<Duration>) -> Result<()> {
        if !path.is_file() {
            return Err(OslError::FileNotFound(path.to_path_buf()));
        }
        let deadline = Deadline::new(timeout);
        let stream = self.stream_mut("send file")?;
        write_file_frame(stream, path, &deadline).await
    }

    /// Receive one frame and decode it as UTF-8 text.
    pub async fn receive_message(&mut self, timeout: Option<Duration>) -> Result<String> {
        let deadline = Deadline::new(timeout);
        let stream = self.stream_mut("receive message")?;
        let payload = read_frame(stream, &deadline).await?;
        String::from_utf8(payload)
            .map_err(|e| OslError::MalformedResponse(format!("response is not valid UTF-8: {}", e)))
    }

    /// Receive one frame into `path`, verifying the final file size.
    pub async fn receive_file(&mut self, path: &Path, timeout: Option<Duration>) -> Result<u64> {
        let deadline = Deadline::new(timeout);
        let stream = self.stream_mut("receive file")?;
        read_file_frame(stream, path, &deadline).await
    }

    fn stream_mut(&mut self, operation: &'static str) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or(OslError::NotConnected { operation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::{encode_header, read_frame as server_read};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn local_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let mut client = TcpClient::new();
        let result = client.send_message("{}", None).await;
        assert!(matches!(result, Err(OslError::NotConnected { .. })));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (listener, port) = local_listener().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let mut client = TcpClient::new();
        client
            .connect("127.0.0.1", port, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        let _peer = accept.await.unwrap();
        let second = client
            .connect("127.0.0.1", port, Some(Duration::from_secs(2)))
            .await;
        assert!(matches!(second, Err(OslError::AlreadyConnected)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let (listener, port) = local_listener().await;
        drop(listener);
        let mut client = TcpClient::new();
        let result = client
            .connect("127.0.0.1", port, Some(Duration::from_secs(2)))
            .await;
        assert!(matches!(result, Err(OslError::ConnectionRefused { .. })));
    }

    #[tokio::test]
    async fn test_message_exchange() {
        let (listener, port) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = server_read(&mut socket, &Deadline::unbounded()).await.unwrap();
            assert_eq!(request, b"{\"What\":\"SERVER_IS_ALIVE\"}");
            write_frame(&mut socket, b"{\"status\":\"success\"}", &Deadline::unbounded())
                .await
                .unwrap();
        });

        let mut client = TcpClient::new();
        client
            .connect("127.0.0.1", port, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        client
            .send_message("{\"What\":\"SERVER_IS_ALIVE\"}", Some(Duration::from_secs(2)))
            .await
            .unwrap();
        let response = client
            .receive_message(Some(Duration::from_secs(2)))
            .await
            .unwrap();
        server.await.unwrap();
        assert_eq!(response, "{\"status\":\"success\"}");
    }

    #[tokio::test]
    async fn test_mismatched_lengths_rejected() {
        let (listener, port) = local_listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = encode_header(4);
            header[15] = 5;
            socket.write_all(&header).await.unwrap();
            socket.write_all(b"abcd").await.unwrap();
        });

        let mut client = TcpClient::new();
        client.connect("127.0.0.1", port, None).await.unwrap();
        let result = client.receive_message(Some(Duration::from_secs(2))).await;
        assert!(matches!(result, Err(OslError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn test_receive_times_out_on_silent_peer() {
        let (listener, port) = local_listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let mut client = TcpClient::new();
        client.connect("127.0.0.1", port, None).await.unwrap();
        let result = client
            .receive_message(Some(Duration::from_millis(300)))
            .await;
        assert!(matches!(result, Err(OslError::Timeout(_))));
        server.abort();
    }

    #[tokio::test]
    async fn test_file_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("design.json");
        let target = dir.path().join("echo.json");
        std::fs::write(&source, vec![b'7'; 3000]).unwrap();

        let (listener, port) = local_listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let payload = server_read(&mut socket, &Deadline::unbounded()).await.unwrap();
            write_frame(&mut socket, &payload, &Deadline::unbounded())
                .await
                .unwrap();
        });

        let mut client = TcpClient::new();
        client.connect("127.0.0.1", port, None).await.unwrap();
        client.send_file(&source, None).await.unwrap();
        let size = client.receive_file(&target, None).await.unwrap();
        assert_eq!(size, 3000);
        assert_eq!(std::fs::read(&target).unwrap(), vec![b'7'; 3000]);
    }

    #[tokio::test]
    async fn test_send_missing_file() {
        let mut client = TcpClient::new();
        let result = client
            .send_file(Path::new("/nonexistent/optilink/file.bin"), None)
            .await;
        assert!(matches!(result, Err(OslError::FileNotFound(_))));
    }
}
