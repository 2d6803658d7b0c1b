//! Alarm worker: drains the alarm queue into the notification sink.

use super::Heartbeat;
use crate::context::PipelineContext;
use analyzer_core::capabilities::SinkConnection;
use analyzer_core::health::ErrorSeverity;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Health-monitor name of the alarm worker.
pub const ALARM_MODULE: &str = "alarm_handler";

/// What an alarm run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlarmReport {
    /// Records delivered.
    pub delivered: u64,
    /// Records given up on after a failed retry.
    pub dropped: u64,
    /// Successful connections.
    pub connections: u32,
}

/// Process-wide alarm dispatcher.
pub struct AlarmWorker {
    ctx: PipelineContext,
}

impl AlarmWorker {
    /// Dispatcher over the context's alarm queue and sink.
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Run until stopped.
    ///
    /// A connection is held before anything is taken off the queue, so alarms wait in
    /// the queue while the sink is unreachable. A record whose send fails is retried
    /// once on the next connection.
    pub async fn run(self, cancel: CancellationToken) -> AlarmReport {
        let config = self.ctx.config.alarm.clone();
        let alarms = self.ctx.queues.alarms();
        let mut report = AlarmReport::default();
        let mut connection: Option<Box<dyn SinkConnection>> = None;
        let mut pending: Option<serde_json::Value> = None;
        let mut heartbeat = Heartbeat::new(
            self.ctx.health.clone(),
            ALARM_MODULE,
            self.ctx.config.supervisor.heartbeat_interval,
        );

        info!("alarm worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let connected = connection.is_some();
            heartbeat
                .beat(|| {
                    let link = if connected { "connected" } else { "disconnected" };
                    format!("{link}, {} delivered, {} dropped", report.delivered, report.dropped)
                })
                .await;

            if connection.is_none() {
                let connected = tokio::select! {
                    _ = cancel.cancelled() => break,
                    connected = self.ctx.sink.connect() => connected,
                };
                match connected {
                    Ok(conn) => {
                        report.connections += 1;
                        connection = Some(conn);
                    }
                    Err(e) => {
                        warn!(error = %e, retry_in = ?config.reconnect_interval, "notification sink unavailable");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(config.reconnect_interval) => {}
                        }
                    }
                }
                continue;
            }
            let Some(conn) = connection.as_mut() else {
                continue;
            };

            let (record, retry) = match pending.take() {
                Some(record) => (record, true),
                None => {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = alarms.pop(config.pop_timeout) => event,
                    };
                    match event {
                        Some(event) => (event.to_notification(), false),
                        None => continue,
                    }
                }
            };

            match conn.send(&record).await {
                Ok(()) => {
                    report.delivered += 1;
                    info!(alarm_id = %record["alarm_id"], "alarm delivered");
                }
                Err(e) => {
                    warn!(alarm_id = %record["alarm_id"], error = %e, "alarm send failed, reconnecting");
                    connection = None;
                    if retry {
                        report.dropped += 1;
                        error!(alarm_id = %record["alarm_id"], "alarm dropped after retry");
                        let message = format!("alarm {} dropped", record["alarm_id"]);
                        self.ctx
                            .health
                            .report_error(ALARM_MODULE, ErrorSeverity::Error, message)
                            .await;
                    } else {
                        pending = Some(record);
                    }
                }
            }
        }

        info!(delivered = report.delivered, "alarm worker stopped");
        report
    }
}
