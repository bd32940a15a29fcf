//! Security audit logger.
//!
//! `record` never blocks and never fails the caller. Events travel over a
//! bounded channel to one writer task that batches them into an `AuditSink`.
//! Anything that cannot reach the sink (full buffer, closed writer, sink
//! failure) is escalated to the process log with the full serialized event.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::models::{SecurityEvent, Severity};

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write_batch(&self, events: &[SecurityEvent]) -> Result<(), anyhow::Error>;
}

/// Emits each event as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write_batch(&self, events: &[SecurityEvent]) -> Result<(), anyhow::Error> {
        for event in events {
            let subject = event.subject_id.as_deref().unwrap_or("-");
            let tenant = event.tenant_id.map(|t| t.to_string()).unwrap_or_default();
            if event.severity >= Severity::High {
                tracing::warn!(
                    target: "security_audit",
                    event_type = event.event_type.as_str(),
                    severity = ?event.severity,
                    subject_id = %subject,
                    tenant_id = %tenant,
                    request_id = %event.request_id,
                    detail = %event.detail,
                    "Security event"
                );
            } else {
                tracing::info!(
                    target: "security_audit",
                    event_type = event.event_type.as_str(),
                    severity = ?event.severity,
                    subject_id = %subject,
                    tenant_id = %tenant,
                    request_id = %event.request_id,
                    detail = %event.detail,
                    "Security event"
                );
            }
        }
        Ok(())
    }
}

/// Collects events in memory. Can be switched to fail every write.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<SecurityEvent>>,
    failing: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write_batch(&self, events: &[SecurityEvent]) -> Result<(), anyhow::Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Audit sink rejected write"));
        }
        self.events
            .lock()
            .map_err(|e| anyhow::anyhow!("Audit sink mutex poisoned: {}", e))?
            .extend_from_slice(events);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AuditConfig {
    pub buffer_capacity: usize,
    pub batch_size: usize,
    pub write_timeout: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 4096,
            batch_size: 64,
            write_timeout: Duration::from_secs(2),
        }
    }
}

enum AuditCommand {
    Record(Box<SecurityEvent>),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct SecurityAuditService {
    tx: mpsc::Sender<AuditCommand>,
}

impl SecurityAuditService {
    /// Starts the writer task. It ends once every handle has been dropped
    /// and the buffer is drained.
    pub fn spawn(sink: Arc<dyn AuditSink>, config: AuditConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.buffer_capacity.max(1));
        let handle = tokio::spawn(run_writer(rx, sink, config));
        (Self { tx }, handle)
    }

    /// Fire-and-forget.
    pub fn record(&self, event: SecurityEvent) {
        if let Err(e) = self.tx.try_send(AuditCommand::Record(Box::new(event))) {
            let reason = match &e {
                mpsc::error::TrySendError::Full(_) => "buffer_full",
                mpsc::error::TrySendError::Closed(_) => "writer_closed",
            };
            if let AuditCommand::Record(event) = e.into_inner() {
                escalate(&event, reason);
            }
        }
    }

    /// Resolves once every event recorded before this call has been handed
    /// to the sink.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

fn escalate(event: &SecurityEvent, reason: &'static str) {
    metrics::counter!("identity_audit_dropped_total", "reason" => reason).increment(1);
    match serde_json::to_string(event) {
        Ok(json) => tracing::error!(reason, event = %json, "Security event could not be persisted"),
        Err(e) => tracing::error!(
            reason,
            event_id = %event.event_id,
            error = %e,
            "Security event could not be persisted"
        ),
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<AuditCommand>,
    sink: Arc<dyn AuditSink>,
    config: AuditConfig,
) {
    let batch_size = config.batch_size.max(1);
    let mut commands = Vec::with_capacity(batch_size);
    let mut batch: Vec<SecurityEvent> = Vec::with_capacity(batch_size);

    while rx.recv_many(&mut commands, batch_size).await > 0 {
        let mut waiters = Vec::new();
        for command in commands.drain(..) {
            match command {
                AuditCommand::Record(event) => batch.push(*event),
                AuditCommand::Flush(done) => {
                    // FIFO: everything queued before the flush is in `batch`.
                    write(&*sink, &mut batch, config.write_timeout).await;
                    waiters.push(done);
                }
            }
        }
        write(&*sink, &mut batch, config.write_timeout).await;
        for done in waiters {
            let _ = done.send(());
        }
    }

    tracing::debug!("Security audit writer stopped");
}

async fn write(sink: &dyn AuditSink, batch: &mut Vec<SecurityEvent>, limit: Duration) {
    if batch.is_empty() {
        return;
    }
    let failure = match tokio::time::timeout(limit, sink.write_batch(batch.as_slice())).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some("write timed out".to_string()),
    };
    if let Some(error) = failure {
        tracing::error!(error = %error, count = batch.len(), "Failed to write security audit batch");
        for event in batch.iter() {
            escalate(event, "sink_failed");
        }
    }
    batch.clear();
}
