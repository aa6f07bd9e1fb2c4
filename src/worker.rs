//! RabbitMQ consumer: one worker per priority queue
//!
//! A worker owns its broker channel, its bulk loader and the loader's caches;
//! nothing is shared with peer workers except the database. Deliveries are
//! processed one at a time (prefetch defaults to 1). A failed delivery whose
//! error is transient goes back to the same queue via a republish carrying an
//! incremented `x-retry-count` header; everything else is rejected without
//! requeue.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use sqlx::MySqlPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::loader::BulkLoader;
use crate::parser;
use crate::retry::{error_chain, is_retryable};
use crate::types::ImportTask;

/// Broker-level redelivery cap per message; beyond it the message is poison.
const MAX_RETRIES: i64 = 10;

/// Header carrying the in-band retry counter across republishes.
const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Storage prefix used by the upload endpoint's container.
const LEGACY_STORAGE_PREFIX: &str = "/var/www/html/storage";

pub struct Worker {
    connection: Connection,
    channel: Channel,
    loader: BulkLoader,
    queue_name: String,
    storage_path: PathBuf,
    worker_id: String,
}

impl Worker {
    /// Open a broker connection and declare the bound queue. Declaration is
    /// passive-compatible: same durability and `x-max-priority` as the
    /// publisher side, so an existing queue matches.
    pub async fn connect(config: &Config, pool: MySqlPool, queue_name: &str) -> Result<Self> {
        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .context("failed to connect to RabbitMQ")?;

        let channel = connection
            .create_channel()
            .await
            .context("failed to open channel")?;

        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .context("failed to set prefetch count")?;

        let mut arguments = FieldTable::default();
        if let Some(max_priority) = queue_max_priority(queue_name) {
            arguments.insert("x-max-priority".into(), AMQPValue::LongInt(i32::from(max_priority)));
        }
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .with_context(|| format!("failed to declare queue {queue_name}"))?;

        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        let worker_id = format!("worker-{queue_name}-{hostname}");

        Ok(Self {
            connection,
            channel,
            loader: BulkLoader::new(pool),
            queue_name: queue_name.to_string(),
            storage_path: PathBuf::from(&config.storage_path),
            worker_id,
        })
    }

    /// Consume until shutdown. The in-flight delivery always completes; its
    /// ack or nack is the last broker interaction before the channel closes.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut consumer = match self
            .channel
            .basic_consume(
                &self.queue_name,
                &self.worker_id,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                let message = err.to_string();
                if message.contains("RESOURCE_LOCKED") || message.contains("exclusive") {
                    info!(
                        "[{}] queue {} is already owned by another consumer, exiting",
                        self.worker_id, self.queue_name
                    );
                    return self.close().await;
                }
                return Err(anyhow!(err).context("failed to register consumer"));
            }
        };

        info!("[{}] consuming from queue {}", self.worker_id, self.queue_name);

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(err)) => {
                        error!("[{}] failed to receive delivery: {err}", self.worker_id);
                        continue;
                    }
                    None => break,
                },
            };

            self.handle_delivery(delivery).await;
        }

        self.close().await
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let retry_count = retry_count(delivery.properties.headers());

        match self.process_delivery(&delivery).await {
            Ok(()) => {
                if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                    error!("[{}] failed to ack delivery: {err}", self.worker_id);
                }
            }
            Err(err) => {
                let chain = error_chain(&err);
                if is_retryable(&chain) && retry_count < MAX_RETRIES {
                    self.republish(&delivery, retry_count + 1).await;
                } else {
                    error!("[{}] {}: {chain}", self.worker_id, task_file_name(&delivery));
                    let nack = BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    };
                    if let Err(err) = delivery.nack(nack).await {
                        error!("[{}] failed to nack delivery: {err}", self.worker_id);
                    }
                }
            }
        }
    }

    /// Decode, locate, parse, load, then remove the source file.
    async fn process_delivery(&self, delivery: &Delivery) -> Result<()> {
        let task: ImportTask =
            serde_json::from_slice(&delivery.data).context("failed to decode import task")?;

        let size_mb = task.file_size as f64 / 1024.0 / 1024.0;
        info!(
            "[{}] task: {:.4} MB, file: {}, starting...",
            self.worker_id, size_mb, task.file_name
        );

        let path = resolve_file_path(&self.storage_path, &task.file_path)
            .ok_or_else(|| anyhow!("{}: file not found", task.file_name))?;

        let records = parser::parse_file(&path).with_context(|| task.file_name.clone())?;
        if records.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        self.loader
            .insert(&records)
            .await
            .with_context(|| task.file_name.clone())?;
        let summary = self.loader.summary();

        info!(
            "[{}] done: {:.2}s, rows: {}, file: {}, companies: {}, cities: {}, categories: {}, subcategories: {}",
            self.worker_id,
            started.elapsed().as_secs_f64(),
            records.len(),
            task.file_name,
            summary.company,
            summary.city,
            summary.category,
            summary.subcategory,
        );

        if let Err(err) = std::fs::remove_file(&path) {
            warn!("[{}] failed to remove {}: {err}", self.worker_id, path.display());
        }

        Ok(())
    }

    /// Push the original body back onto the same queue with an incremented
    /// retry counter, then ack the original delivery. A failed republish
    /// falls back to a broker-side requeue.
    async fn republish(&self, delivery: &Delivery, next_count: i64) {
        // Back off linearly with the retry counter before requeueing.
        tokio::time::sleep(Duration::from_secs(next_count as u64)).await;

        let mut headers = delivery.properties.headers().clone().unwrap_or_default();
        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongLongInt(next_count));

        let mut properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_headers(headers)
            .with_timestamp(chrono::Utc::now().timestamp() as u64);
        if let Some(priority) = *delivery.properties.priority() {
            properties = properties.with_priority(priority);
        }
        if let Some(message_id) = delivery.properties.message_id() {
            properties = properties.with_message_id(message_id.clone());
        }

        let published = match self
            .channel
            .basic_publish(
                "", // default exchange routes straight to the queue
                &self.queue_name,
                BasicPublishOptions::default(),
                &delivery.data,
                properties,
            )
            .await
        {
            Ok(confirm) => confirm.await.is_ok(),
            Err(_) => false,
        };

        if published {
            if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                error!("[{}] failed to ack republished delivery: {err}", self.worker_id);
            }
        } else {
            warn!(
                "[{}] republish failed, falling back to broker requeue (attempt {next_count})",
                self.worker_id
            );
            let nack = BasicNackOptions {
                requeue: true,
                ..Default::default()
            };
            if let Err(err) = delivery.nack(nack).await {
                error!("[{}] failed to requeue delivery: {err}", self.worker_id);
            }
        }
    }

    /// Channel first, then connection.
    async fn close(self) -> Result<()> {
        self.channel
            .close(200, "worker shutting down")
            .await
            .context("failed to close channel")?;
        self.connection
            .close(200, "worker shutting down")
            .await
            .context("failed to close connection")?;
        Ok(())
    }
}

/// `x-max-priority` for the known import queues.
fn queue_max_priority(queue_name: &str) -> Option<u8> {
    match queue_name {
        "csv_import_high" => Some(10),
        "csv_import_normal" => Some(5),
        "csv_import_large" => Some(1),
        _ => None,
    }
}

/// Read `x-retry-count` from delivery headers. Absent, oddly typed or
/// negative counters read as zero — the value feeds a sleep and the retry
/// cap, so it must never go below zero.
fn retry_count(headers: &Option<FieldTable>) -> i64 {
    let Some(headers) = headers else {
        return 0;
    };
    let count = match headers.inner().get(&ShortString::from(RETRY_COUNT_HEADER)) {
        Some(AMQPValue::ShortShortInt(v)) => i64::from(*v),
        Some(AMQPValue::ShortShortUInt(v)) => i64::from(*v),
        Some(AMQPValue::ShortInt(v)) => i64::from(*v),
        Some(AMQPValue::ShortUInt(v)) => i64::from(*v),
        Some(AMQPValue::LongInt(v)) => i64::from(*v),
        Some(AMQPValue::LongUInt(v)) => i64::from(*v),
        Some(AMQPValue::LongLongInt(v)) => *v,
        _ => 0,
    };
    count.max(0)
}

/// Locate a task's file. The literal path wins; otherwise the upload
/// container's storage prefix is rewritten to the local storage root, and a
/// relative path is looked up under `<storage>/csv/` by basename.
fn resolve_file_path(storage_path: &Path, file_path: &str) -> Option<PathBuf> {
    let path = PathBuf::from(file_path);
    if path.exists() {
        return Some(path);
    }

    let mut candidate = file_path.to_string();
    if candidate.contains(LEGACY_STORAGE_PREFIX) {
        candidate = candidate.replacen(LEGACY_STORAGE_PREFIX, &storage_path.to_string_lossy(), 1);
    }

    let mut path = PathBuf::from(&candidate);
    if path.is_relative() {
        path = storage_path.join("csv").join(path.file_name()?);
    }

    path.exists().then_some(path)
}

/// Best-effort identifier for log lines about a failed delivery.
fn task_file_name(delivery: &Delivery) -> String {
    if let Ok(task) = serde_json::from_slice::<ImportTask>(&delivery.data) {
        return task.file_name;
    }
    delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_queues_map_to_their_priorities() {
        assert_eq!(queue_max_priority("csv_import_high"), Some(10));
        assert_eq!(queue_max_priority("csv_import_normal"), Some(5));
        assert_eq!(queue_max_priority("csv_import_large"), Some(1));
        assert_eq!(queue_max_priority("csv_import_other"), None);
    }

    #[test]
    fn retry_count_reads_integer_header_variants() {
        for value in [
            AMQPValue::ShortShortInt(3),
            AMQPValue::ShortInt(3),
            AMQPValue::LongInt(3),
            AMQPValue::LongLongInt(3),
        ] {
            let mut headers = FieldTable::default();
            headers.insert(RETRY_COUNT_HEADER.into(), value);
            assert_eq!(retry_count(&Some(headers)), 3);
        }
    }

    #[test]
    fn retry_count_defaults_to_zero() {
        assert_eq!(retry_count(&None), 0);
        assert_eq!(retry_count(&Some(FieldTable::default())), 0);

        let mut headers = FieldTable::default();
        headers.insert(
            RETRY_COUNT_HEADER.into(),
            AMQPValue::LongString("not a number".into()),
        );
        assert_eq!(retry_count(&Some(headers)), 0);
    }

    #[test]
    fn negative_retry_counts_clamp_to_zero() {
        for value in [AMQPValue::ShortShortInt(-1), AMQPValue::LongInt(-7), AMQPValue::LongLongInt(i64::MIN)] {
            let mut headers = FieldTable::default();
            headers.insert(RETRY_COUNT_HEADER.into(), value);
            assert_eq!(retry_count(&Some(headers)), 0);
        }
    }

    #[test]
    fn existing_paths_resolve_directly() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.csv");
        std::fs::write(&file, "data").unwrap();

        let resolved = resolve_file_path(Path::new("/app/storage"), file.to_str().unwrap());
        assert_eq!(resolved, Some(file));
    }

    #[test]
    fn upload_container_prefix_is_rewritten() {
        let storage = tempfile::tempdir().unwrap();
        let csv_dir = storage.path().join("csv");
        std::fs::create_dir_all(&csv_dir).unwrap();
        let file = csv_dir.join("x.csv");
        std::fs::write(&file, "data").unwrap();

        let resolved = resolve_file_path(storage.path(), "/var/www/html/storage/csv/x.csv");
        assert_eq!(resolved, Some(file));
    }

    #[test]
    fn relative_paths_fall_back_to_the_csv_directory() {
        let storage = tempfile::tempdir().unwrap();
        let csv_dir = storage.path().join("csv");
        std::fs::create_dir_all(&csv_dir).unwrap();
        let file = csv_dir.join("companies.csv");
        std::fs::write(&file, "data").unwrap();

        let resolved = resolve_file_path(storage.path(), "uploads/companies.csv");
        assert_eq!(resolved, Some(file));
    }

    #[test]
    fn unresolvable_paths_yield_none() {
        let storage = tempfile::tempdir().unwrap();
        assert_eq!(resolve_file_path(storage.path(), "/nope/missing.csv"), None);
        assert_eq!(resolve_file_path(storage.path(), "missing.csv"), None);
    }

    #[test]
    fn poison_bodies_classify_as_non_retryable() {
        let err = serde_json::from_slice::<ImportTask>(b"not json")
            .context("failed to decode import task")
            .unwrap_err();
        assert!(!is_retryable(&error_chain(&err)));
    }
}
