use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use tsload_common::batch::BatchAccumulator;
use tsload_common::record::Record;

use crate::error::LoadError;
use crate::metrics_consts::{BATCH_SIZE, FORCED_SMALL_BATCH};
use crate::processor::Processor;

/// Counters shared by every worker of a run and read by the progress reporter.
#[derive(Debug, Default)]
pub struct LoadStats {
    rows: AtomicU64,
    metrics: AtomicU64,
}

impl LoadStats {
    pub fn record(&self, metrics: u64, rows: u64) {
        self.metrics.fetch_add(metrics, Ordering::Relaxed);
        self.rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> u64 {
        self.metrics.load(Ordering::Relaxed)
    }
}

/// A worker draining one channel of records into batches, and batches into a `Processor`.
pub struct LoadWorker {
    /// Index of this worker, also the partition it receives when records are hashed.
    id: usize,
    receiver: mpsc::Receiver<Record>,
    processor: Processor,
    /// Flush once this many records are buffered.
    batch_size: usize,
    /// Flush whatever is buffered when no full batch arrived within this interval.
    flush_interval: time::Duration,
    will_load: bool,
    hashed_workers: bool,
    stats: Arc<LoadStats>,
}

impl LoadWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        receiver: mpsc::Receiver<Record>,
        processor: Processor,
        batch_size: usize,
        flush_interval: time::Duration,
        will_load: bool,
        hashed_workers: bool,
        stats: Arc<LoadStats>,
    ) -> Self {
        Self {
            id,
            receiver,
            processor,
            batch_size: batch_size.max(1),
            flush_interval,
            will_load,
            hashed_workers,
            stats,
        }
    }

    /// Run until the sending side is gone and every buffered record has been written.
    /// The connection is released whether or not the run succeeded.
    pub async fn run(mut self) -> Result<(), LoadError> {
        self.processor
            .init(self.id, self.will_load, self.hashed_workers)
            .await?;

        let result = self.consume().await;
        let closed = self.processor.close(self.will_load).await;

        result?;
        closed
    }

    async fn consume(&mut self) -> Result<(), LoadError> {
        let mut accumulator = BatchAccumulator::new();
        let mut received = Vec::with_capacity(self.batch_size);
        let mut exhausted = false;

        while !exhausted {
            let deadline = tokio::time::Instant::now() + self.flush_interval;

            while accumulator.len() < self.batch_size {
                let remaining = self.batch_size - accumulator.len();
                // Race the channel against the flush deadline, so a slow producer still
                // gets its records written.
                tokio::select! {
                    got = self.receiver.recv_many(&mut received, remaining) => {
                        if got == 0 {
                            exhausted = true;
                            break;
                        }
                        for record in received.drain(..) {
                            accumulator.add(record);
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        if !accumulator.is_empty() {
                            metrics::counter!(FORCED_SMALL_BATCH).increment(1);
                        }
                        break;
                    }
                }
            }

            if accumulator.is_empty() {
                continue;
            }

            let batch = accumulator.flush();
            metrics::histogram!(BATCH_SIZE).record(batch.rows() as f64);
            debug!("worker {} flushing {} records", self.id, batch.rows());

            let (metrics, rows) = self.processor.process(batch, self.will_load).await?;
            self.stats.record(metrics, rows);
        }

        if !accumulator.is_empty() {
            warn!("worker {} exited with unflushed records", self.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::creator::SchemaCoordinator;
    use chrono::Utc;
    use tsload_common::schema::{FieldDefinition, Schema, TableSchema};
    use tsload_common::store::Store;
    use tsload_common::tag_cache::TagCaches;
    use tsload_common::test_utils::{MemoryConnector, MemoryHandle, MemoryStore};
    use tsload_common::value::ValueType;

    async fn worker(
        batch_size: usize,
        flush_interval: time::Duration,
    ) -> (LoadWorker, mpsc::Sender<Record>, MemoryHandle, Arc<LoadStats>) {
        let schema = Arc::new(
            Schema::new(
                vec![FieldDefinition::new("name", ValueType::String)],
                vec![TableSchema::new(
                    "readings",
                    vec![FieldDefinition::new("velocity", ValueType::Float64)],
                )],
            )
            .unwrap(),
        );
        let options = Config::init_with_defaults().unwrap().loading;
        let connector = MemoryConnector::new();
        let handle = connector.handle();

        let mut store = MemoryStore::new(handle.clone());
        SchemaCoordinator::new(&schema, &options)
            .ensure_schema(&mut store)
            .await
            .unwrap();
        store.close().await.unwrap();

        let processor = Processor::new(
            schema,
            options,
            Arc::new(connector),
            Arc::new(TagCaches::new()),
        );
        let (sender, receiver) = mpsc::channel(batch_size);
        let stats = Arc::new(LoadStats::default());
        let worker = LoadWorker::new(
            0,
            receiver,
            processor,
            batch_size,
            flush_interval,
            true,
            false,
            stats.clone(),
        );
        (worker, sender, handle, stats)
    }

    fn record(name: &str) -> Record {
        Record::new("readings", vec![name.to_owned()], vec!["1".to_owned()], Utc::now())
    }

    #[tokio::test]
    async fn test_drains_channel_in_full_batches() {
        let (worker, sender, handle, stats) = worker(2, time::Duration::from_secs(60)).await;
        let running = tokio::spawn(worker.run());

        for i in 0..5 {
            sender.send(record(&format!("truck{}", i))).await.unwrap();
        }
        drop(sender);
        running.await.unwrap().unwrap();

        assert_eq!(stats.rows(), 5);
        assert_eq!(stats.metrics(), 5);
        assert_eq!(handle.rows("readings").len(), 5);
        // Two full batches and the remainder, each writing tags then readings.
        assert_eq!(handle.bulk_writes(), 6);
        assert_eq!(handle.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_flushes_small_batch_after_interval() {
        let (worker, sender, handle, stats) = worker(100, time::Duration::from_millis(20)).await;
        let running = tokio::spawn(worker.run());

        sender.send(record("truck1")).await.unwrap();
        tokio::time::sleep(time::Duration::from_millis(200)).await;

        assert_eq!(stats.rows(), 1);
        assert_eq!(handle.rows("readings").len(), 1);

        drop(sender);
        running.await.unwrap().unwrap();
    }
}
