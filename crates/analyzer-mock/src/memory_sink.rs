//! In-memory notification sink.

use analyzer_core::capabilities::{NotificationSink, SinkConnection};
use analyzer_core::{AnalyzerError, AnalyzerResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct SinkState {
    records: Mutex<Vec<serde_json::Value>>,
    connects: AtomicU32,
    refuse_connects: AtomicU32,
    fail_sends: AtomicU32,
}

/// [`NotificationSink`] that keeps every delivered record.
///
/// Connection refusals and send failures are consumed one at a time, so a test can
/// script "two refused connects, then one failed send" and watch the worker recover.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<SinkState>,
}

impl MemorySink {
    /// Sink that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next_connects(&self, count: u32) {
        self.state.refuse_connects.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` sends; a failed send drops the record.
    pub fn fail_next_sends(&self, count: u32) {
        self.state.fail_sends.store(count, Ordering::SeqCst);
    }

    /// Records delivered so far.
    pub fn records(&self) -> Vec<serde_json::Value> {
        self.state.records.lock().clone()
    }

    /// Connection attempts so far.
    pub fn connects(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn connect(&self) -> AnalyzerResult<Box<dyn SinkConnection>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.state.refuse_connects) {
            return Err(AnalyzerError::Sink("connection refused".into()));
        }
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryConnection {
    state: Arc<SinkState>,
}

#[async_trait]
impl SinkConnection for MemoryConnection {
    async fn send(&mut self, record: &serde_json::Value) -> AnalyzerResult<()> {
        if take_one(&self.state.fail_sends) {
            return Err(AnalyzerError::Sink("connection reset".into()));
        }
        self.state.records.lock().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failures() {
        let sink = MemorySink::new();
        sink.refuse_next_connects(1);
        sink.fail_next_sends(1);

        assert!(sink.connect().await.is_err());
        let mut conn = sink.connect().await.unwrap();
        let record = serde_json::json!({ "type": "alarm" });
        assert!(conn.send(&record).await.is_err());
        conn.send(&record).await.unwrap();

        assert_eq!(sink.records(), vec![record]);
        assert_eq!(sink.connects(), 2);
    }
}
