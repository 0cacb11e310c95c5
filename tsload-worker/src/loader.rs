//! Drives a whole load: setup, one scanner feeding N workers, progress reporting.
use std::sync::Arc;
use std::time;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tsload_common::indexer::{point_indexer, PointIndexer};
use tsload_common::record::{fingerprint, Record};
use tsload_common::schema::{Schema, TagStorage, TAGS_TABLE};
use tsload_common::store::Connector;
use tsload_common::tag_cache::TagCaches;

use crate::config::Config;
use crate::creator::SchemaCoordinator;
use crate::error::LoadError;
use crate::metrics_consts::{RECORDS_READ, WORKER_BLOCKED};
use crate::processor::Processor;
use crate::source::DataSource;
use crate::worker::{LoadStats, LoadWorker};

/// What a finished load did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSummary {
    pub rows: u64,
    pub metrics: u64,
    pub elapsed: time::Duration,
}

impl LoadSummary {
    pub fn rows_per_sec(&self) -> f64 {
        rate(self.rows, self.elapsed)
    }

    pub fn metrics_per_sec(&self) -> f64 {
        rate(self.metrics, self.elapsed)
    }

    pub fn log(&self) {
        info!(
            "loaded {} metrics in {:.3}sec ({:.2} metrics/sec)",
            self.metrics,
            self.elapsed.as_secs_f64(),
            self.metrics_per_sec()
        );
        info!(
            "loaded {} rows in {:.3}sec ({:.2} rows/sec)",
            self.rows,
            self.elapsed.as_secs_f64(),
            self.rows_per_sec()
        );
    }
}

fn rate(count: u64, elapsed: time::Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

pub struct Loader {
    config: Config,
    connector: Arc<dyn Connector>,
}

impl Loader {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    fn workers(&self) -> usize {
        let workers = self.config.workers.max(1);
        // Every worker holds a connection, and setup needs one more.
        let limit = usize::try_from(self.config.max_pg_connections)
            .unwrap_or(usize::MAX)
            .saturating_sub(1)
            .max(1);
        if workers > limit {
            warn!(
                "capping {} workers to {} to stay within max_pg_connections",
                workers, limit
            );
            return limit;
        }
        workers
    }

    /// Create the database and tables as configured and build the tag caches for the run.
    async fn prepare(&self, schema: &Schema) -> Result<TagCaches, LoadError> {
        let coordinator = SchemaCoordinator::new(schema, &self.config.loading);

        if self.config.do_create_db {
            let mut admin = self.connector.connect_admin().await?;
            let ensured = coordinator
                .ensure_database(
                    admin.as_mut(),
                    self.config.db_name.as_str(),
                    self.config.drop_existing_database,
                )
                .await;
            admin.close().await?;
            ensured?;
        }

        let mut store = self.connector.connect().await?;
        let ensured = coordinator.ensure_schema(store.as_mut()).await;

        let caches = TagCaches::new();
        let seeded = match ensured {
            Ok(()) if self.config.loading.tag_storage == TagStorage::SideTable
                && !self.config.loading.create_schema =>
            {
                store.load_tags(&schema.tag_names()).await.map_err(LoadError::from)
            }
            Ok(()) => Ok(vec![]),
            Err(err) => Err(err),
        };
        store.close().await?;

        let entries = seeded?
            .into_iter()
            .map(|(id, texts)| Ok((persisted_fingerprint(schema, &texts)?, id)))
            .collect::<Result<Vec<(String, i64)>, LoadError>>()?;
        if !entries.is_empty() {
            info!("seeded tag cache with {} persisted tag sets", entries.len());
        }
        caches.seed(entries);

        Ok(caches)
    }

    /// Load everything `source` yields.
    pub async fn run<S>(&self, mut source: S) -> Result<LoadSummary, LoadError>
    where
        S: DataSource + 'static,
    {
        let schema = Arc::new(source.headers()?.into_schema()?);
        let will_load = self.config.do_load;
        let caches = if will_load {
            self.prepare(&schema).await?
        } else {
            info!("dry run: records are read and batched but not written");
            TagCaches::new()
        };
        let caches = Arc::new(caches);

        let workers = self.workers();
        let stats = Arc::new(LoadStats::default());
        let started = time::Instant::now();

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let (sender, receiver) = mpsc::channel(self.config.batch_size.max(1));
            senders.push(sender);

            let processor = Processor::new(
                schema.clone(),
                self.config.loading.clone(),
                self.connector.clone(),
                caches.clone(),
            );
            let worker = LoadWorker::new(
                id,
                receiver,
                processor,
                self.config.batch_size,
                self.config.flush_interval.0,
                will_load,
                self.config.hashed_workers,
                stats.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
        }

        let router = Router {
            indexer: self
                .config
                .hashed_workers
                .then(|| point_indexer(workers)),
            senders,
        };
        let limit = self.config.limit;
        let scanner = tokio::task::spawn_blocking(move || scan(source, router, limit));

        let reporter = self.spawn_reporter(stats.clone(), started);

        let worker_result = join_workers(handles).await;
        let scan_result = match scanner.await {
            Ok(result) => result,
            Err(_) => Err(LoadError::ScannerPanicked),
        };
        if let Some(reporter) = reporter {
            reporter.abort();
        }

        // A failing worker stops the scanner, so its error is the interesting one.
        worker_result?;
        let read = scan_result?;

        let summary = LoadSummary {
            rows: stats.rows(),
            metrics: stats.metrics(),
            elapsed: started.elapsed(),
        };
        if summary.rows != read {
            warn!("read {} records but {} were processed", read, summary.rows);
        }
        Ok(summary)
    }

    fn spawn_reporter(
        &self,
        stats: Arc<LoadStats>,
        started: time::Instant,
    ) -> Option<JoinHandle<()>> {
        let period = self.config.reporting_period.0;
        if period.is_zero() {
            return None;
        }

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            let mut previous = (0, 0, time::Instant::now());

            loop {
                interval.tick().await;
                let (rows, metrics, now) = (stats.rows(), stats.metrics(), time::Instant::now());
                let window = now.duration_since(previous.2);
                info!(
                    "{:.0}s elapsed: {} rows ({:.2} rows/sec), {} metrics ({:.2} metrics/sec)",
                    started.elapsed().as_secs_f64(),
                    rows,
                    rate(rows - previous.0, window),
                    metrics,
                    rate(metrics - previous.1, window),
                );
                previous = (rows, metrics, now);
            }
        }))
    }
}

/// Sends each record to the worker that owns it.
struct Router {
    /// Only set when records are routed by entity.
    indexer: Option<Box<dyn PointIndexer>>,
    senders: Vec<mpsc::Sender<Record>>,
}

impl Router {
    /// Hashed runs keep every entity on one worker; otherwise records go round robin.
    fn route(&self, record: &Record, sequence: u64) -> usize {
        match &self.indexer {
            Some(indexer) => indexer.index_of(record),
            None => usize::try_from(sequence).unwrap_or_default() % self.senders.len(),
        }
    }
}

/// Read records on a blocking thread and hand them to the workers. Blocks whenever the
/// target worker's channel is full. Returns the number of records read.
fn scan<S: DataSource>(mut source: S, router: Router, limit: u64) -> Result<u64, LoadError> {
    let mut read = 0;

    while limit == 0 || read < limit {
        let Some(record) = source.next_record()? else {
            break;
        };
        let target = router.route(&record, read);
        let sender = &router.senders[target];

        let delivered = match sender.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                metrics::counter!(WORKER_BLOCKED, "worker" => target.to_string()).increment(1);
                sender.blocking_send(record).is_ok()
            }
            Err(TrySendError::Closed(_)) => false,
        };
        if !delivered {
            warn!("worker {} stopped receiving records", target);
            break;
        }

        read += 1;
        metrics::counter!(RECORDS_READ).increment(1);
    }

    if limit > 0 && read == limit {
        info!("stopped reading after the configured limit of {} records", limit);
    }
    Ok(read)
}

/// Wait for every worker. The first failure aborts the others.
async fn join_workers(handles: Vec<JoinHandle<Result<(), LoadError>>>) -> Result<(), LoadError> {
    let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
    let mut running: FuturesUnordered<_> = handles
        .into_iter()
        .enumerate()
        .map(|(id, handle)| async move { (id, handle.await) })
        .collect();

    while let Some((id, joined)) = running.next().await {
        let failure = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err,
            Err(_) => LoadError::WorkerPanicked(id),
        };

        error!("worker {} failed, aborting the load: {}", id, failure);
        for abort in &aborts {
            abort.abort();
        }
        return Err(failure);
    }

    Ok(())
}

/// Fingerprint of a tag set read back from the store as text, parsed with the declared
/// tag types so it matches the fingerprint of the live records that produced it.
fn persisted_fingerprint(schema: &Schema, texts: &[String]) -> Result<String, LoadError> {
    let values = schema
        .tags()
        .iter()
        .enumerate()
        .map(|(i, tag)| {
            let raw = texts.get(i).map(String::as_str).unwrap_or_default();
            tag.value_type
                .parse(raw)
                .map_err(|_| LoadError::FieldParse {
                    table: TAGS_TABLE.to_owned(),
                    column: tag.name.clone(),
                    value: raw.to_owned(),
                    value_type: tag.value_type,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(fingerprint(&values))
}
