//! Notification sinks: newline-delimited JSON over TCP, and a log-only fallback.

use analyzer_core::capabilities::{NotificationSink, SinkConnection};
use analyzer_core::{AnalyzerError, AnalyzerResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistent TCP connection carrying one JSON record per line.
#[derive(Debug, Clone)]
pub struct TcpJsonSink {
    addr: String,
}

impl TcpJsonSink {
    /// Sink connecting to `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl NotificationSink for TcpJsonSink {
    async fn connect(&self) -> AnalyzerResult<Box<dyn SinkConnection>> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| AnalyzerError::Sink(format!("connect to {} timed out", self.addr)))?
            .map_err(|e| AnalyzerError::Sink(format!("connect to {} failed: {e}", self.addr)))?;
        stream.set_nodelay(true)?;
        info!(addr = %self.addr, "notification sink connected");
        Ok(Box::new(TcpJsonConnection { stream }))
    }
}

struct TcpJsonConnection {
    stream: TcpStream,
}

#[async_trait]
impl SinkConnection for TcpJsonConnection {
    async fn send(&mut self, record: &serde_json::Value) -> AnalyzerResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.stream
            .write_all(&line)
            .await
            .map_err(|e| AnalyzerError::Sink(format!("send failed: {e}")))?;
        self.stream
            .flush()
            .await
            .map_err(|e| AnalyzerError::Sink(format!("flush failed: {e}")))
    }
}

/// Sink used when no endpoint is configured; records go to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn connect(&self) -> AnalyzerResult<Box<dyn SinkConnection>> {
        debug!("log sink connected");
        Ok(Box::new(LogSink))
    }
}

#[async_trait]
impl SinkConnection for LogSink {
    async fn send(&mut self, record: &serde_json::Value) -> AnalyzerResult<()> {
        info!(
            alarm_id = %record["alarm_id"],
            stream_id = %record["stream_id"],
            "alarm: {record}"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_records_arrive_as_json_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            let mut received = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                received.push(serde_json::from_str::<serde_json::Value>(&line).unwrap());
            }
            received
        });

        let sink = TcpJsonSink::new(addr.to_string());
        let mut conn = sink.connect().await.unwrap();
        conn.send(&serde_json::json!({ "type": "alarm", "alarm_id": "a1" }))
            .await
            .unwrap();
        conn.send(&serde_json::json!({ "type": "alarm", "alarm_id": "a2" }))
            .await
            .unwrap();
        drop(conn);

        let received = server.await.unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[1]["alarm_id"], "a2");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(TcpJsonSink::new(addr.to_string()).connect().await.is_err());
    }
}
