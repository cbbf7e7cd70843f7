//! Audit logger that batches experiment audit events and writes them to
//! ClickHouse. Submission is a non-blocking channel send; a full channel
//! drops the event and bumps a counter.

use clickhouse::Row;
use experiment_core::config::ClickHouseConfig;
use experiment_core::event_bus::{AuditEvent, AuditSink};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 100_000;
const AUDIT_TABLE: &str = "experiment_audit_events";

/// Audit sink with a background batch writer.
pub struct AuditLogger {
    sender: mpsc::Sender<AuditEvent>,
    node_id: String,
}

impl AuditLogger {
    /// Create the logger and spawn the ClickHouse writer.
    pub async fn new(config: &ClickHouseConfig, node_id: String) -> anyhow::Result<Self> {
        let writer = BatchWriter::new(config).await?;
        let batch_size = config.batch_size.max(1);
        let flush_interval = std::time::Duration::from_millis(config.flush_interval_ms.max(1));

        let (logger, receiver) = Self::with_channel(node_id, CHANNEL_CAPACITY);
        tokio::spawn(async move {
            writer.run(receiver, batch_size, flush_interval).await;
        });

        info!(table = AUDIT_TABLE, "Audit logger initialized with ClickHouse backend");
        Ok(logger)
    }

    /// Logger over a caller-owned channel. Events are stamped with `node_id`
    /// and delivered to the returned receiver.
    pub fn with_channel(node_id: String, capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender, node_id }, receiver)
    }
}

impl AuditSink for AuditLogger {
    fn emit(&self, mut event: AuditEvent) {
        event.node_id = self.node_id.clone();
        let event_type = event.event_type.as_str();
        if let Err(e) = self.sender.try_send(event) {
            metrics::counter!("audit.dropped").increment(1);
            warn!(event_type, "Audit event dropped: {}", e);
        } else {
            metrics::counter!("audit.queued").increment(1);
        }
    }
}

/// One row of `experiment_audit_events`, written as RowBinary. Caller-supplied
/// strings never pass through SQL text.
#[derive(Debug, Row, Serialize)]
struct AuditRow {
    #[serde(with = "clickhouse::serde::uuid")]
    event_id: Uuid,
    event_type: &'static str,
    #[serde(with = "clickhouse::serde::uuid")]
    experiment_id: Uuid,
    #[serde(with = "clickhouse::serde::uuid::option")]
    variant_id: Option<Uuid>,
    #[serde(with = "clickhouse::serde::uuid::option")]
    assignment_id: Option<Uuid>,
    identity_key: Option<String>,
    detail: String,
    node_id: String,
    /// DateTime64(3) ticks.
    timestamp: i64,
}

impl From<&AuditEvent> for AuditRow {
    fn from(e: &AuditEvent) -> Self {
        Self {
            event_id: e.event_id,
            event_type: e.event_type.as_str(),
            experiment_id: e.experiment_id,
            variant_id: e.variant_id,
            assignment_id: e.assignment_id,
            identity_key: e.identity_key.clone(),
            detail: e.detail.to_string(),
            node_id: e.node_id.clone(),
            timestamp: e.timestamp.timestamp_millis(),
        }
    }
}

struct BatchWriter {
    client: clickhouse::Client,
}

impl BatchWriter {
    async fn new(config: &ClickHouseConfig) -> anyhow::Result<Self> {
        let writer = Self::unchecked(config);
        Self::ensure_schema(&writer.client).await?;
        Ok(writer)
    }

    fn unchecked(config: &ClickHouseConfig) -> Self {
        let client = clickhouse::Client::default()
            .with_url(&config.url)
            .with_database(&config.database);
        Self { client }
    }

    async fn ensure_schema(client: &clickhouse::Client) -> anyhow::Result<()> {
        client
            .query(
                "CREATE TABLE IF NOT EXISTS experiment_audit_events (
                    event_id UUID,
                    event_type LowCardinality(String),
                    experiment_id UUID,
                    variant_id Nullable(UUID),
                    assignment_id Nullable(UUID),
                    identity_key Nullable(String),
                    detail String,
                    node_id String,
                    timestamp DateTime64(3)
                ) ENGINE = MergeTree()
                ORDER BY (experiment_id, timestamp, event_type)
                PARTITION BY toYYYYMM(timestamp)",
            )
            .execute()
            .await?;

        info!("ClickHouse audit schema verified");
        Ok(())
    }

    async fn run(
        self,
        mut receiver: mpsc::Receiver<AuditEvent>,
        batch_size: usize,
        flush_interval: std::time::Duration,
    ) {
        let mut buffer: Vec<AuditEvent> = Vec::with_capacity(batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                received = receiver.recv() => match received {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= batch_size {
                            self.flush(&mut buffer).await;
                        }
                    }
                    None => {
                        if !buffer.is_empty() {
                            self.flush(&mut buffer).await;
                        }
                        info!("Audit channel closed, writer exiting");
                        return;
                    }
                },
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer).await;
                    }
                }
            }
        }
    }

    /// Write and clear `buffer`. Returns whether the batch reached ClickHouse.
    async fn flush(&self, buffer: &mut Vec<AuditEvent>) -> bool {
        let count = buffer.len();
        debug!(count, "Flushing audit batch to ClickHouse");

        let rows: Vec<AuditRow> = buffer.drain(..).map(|e| AuditRow::from(&e)).collect();
        if rows.is_empty() {
            return true;
        }

        match self.insert_rows(&rows).await {
            Ok(()) => {
                metrics::counter!("audit.flushed").increment(count as u64);
                debug!(count, "Audit batch flushed");
                true
            }
            Err(e) => {
                metrics::counter!("audit.flush_errors").increment(1);
                error!(error = %e, count, "Failed to flush audit batch");
                false
            }
        }
    }

    async fn insert_rows(&self, rows: &[AuditRow]) -> clickhouse::error::Result<()> {
        let mut insert = self.client.insert::<AuditRow>(AUDIT_TABLE)?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use experiment_core::event_bus::AuditEventType;

    #[tokio::test]
    async fn test_emit_stamps_node_id() {
        let (logger, mut rx) = AuditLogger::with_channel("node-7".into(), 4);
        let exp = Uuid::new_v4();
        logger.emit(AuditEvent::new(AuditEventType::ExperimentStarted, exp));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.node_id, "node-7");
        assert_eq!(event.experiment_id, exp);
        assert_eq!(event.event_type, AuditEventType::ExperimentStarted);
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let (logger, mut rx) = AuditLogger::with_channel("n".into(), 1);
        let exp = Uuid::new_v4();
        logger.emit(AuditEvent::new(AuditEventType::VariantAssigned, exp));
        logger.emit(AuditEvent::new(AuditEventType::ObservationRecorded, exp));

        assert_eq!(rx.recv().await.unwrap().event_type, AuditEventType::VariantAssigned);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_row_from_event() {
        let variant = Uuid::new_v4();
        let event = AuditEvent::new(AuditEventType::VariantAssigned, Uuid::new_v4())
            .with_variant(variant)
            .with_identity("user-42")
            .with_detail(serde_json::json!({"enrolled": true}));
        let row = AuditRow::from(&event);

        assert_eq!(row.event_type, "variant_assigned");
        assert_eq!(row.variant_id, Some(variant));
        assert_eq!(row.identity_key.as_deref(), Some("user-42"));
        assert_eq!(row.detail, r#"{"enrolled":true}"#);
        assert!(row.assignment_id.is_none());
        assert_eq!(row.timestamp, event.timestamp.timestamp_millis());
    }

    #[tokio::test]
    async fn test_flush_with_query_characters_in_identity() {
        // Nothing listens on port 1; the insert must fail cleanly.
        let config = ClickHouseConfig {
            url: "http://127.0.0.1:1".into(),
            ..ClickHouseConfig::default()
        };
        let writer = BatchWriter::unchecked(&config);
        let exp = Uuid::new_v4();
        let mut buffer = vec![
            AuditEvent::new(AuditEventType::VariantAssigned, exp)
                .with_identity("https://shop.example/cart?sid=42")
                .with_detail(serde_json::json!({"note": "?fields ? {x}"})),
            AuditEvent::new(AuditEventType::ObservationRecorded, exp).with_identity("?"),
        ];

        assert!(!writer.flush(&mut buffer).await);
        assert!(buffer.is_empty());
    }
}
