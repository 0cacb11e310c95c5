use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};
use tsload_common::batch::Batch;
use tsload_common::record::{fingerprint, Record};
use tsload_common::schema::{Schema, TableSchema, TagStorage, TAGS_TABLE};
use tsload_common::store::{quote_ident, Connector, Row, Statement, Store, StoreError};
use tsload_common::tag_cache::{TagCache, TagCaches};
use tsload_common::value::Value;

use crate::config::LoadingConfig;
use crate::error::LoadError;
use crate::metrics_consts::{
    BATCH_WRITE_TIME, METRICS_WRITTEN, ROWS_WRITTEN, TAGS_ASSIGNED, TAG_CACHE_HITS, WRITE_FAILED,
};

/// Converts batches into rows and writes them through one worker's store connection.
pub struct Processor {
    schema: Arc<Schema>,
    options: LoadingConfig,
    connector: Arc<dyn Connector>,
    caches: Arc<TagCaches>,
    worker_id: usize,
    store: Option<Box<dyn Store>>,
    cache: Option<Arc<TagCache>>,
}

/// Rows converted from one table group, ready to be written.
struct Converted {
    rows: Vec<Row>,
    new_tags: Vec<Row>,
    metrics: u64,
}

impl Processor {
    pub fn new(
        schema: Arc<Schema>,
        options: LoadingConfig,
        connector: Arc<dyn Connector>,
        caches: Arc<TagCaches>,
    ) -> Self {
        Self {
            schema,
            options,
            connector,
            caches,
            worker_id: 0,
            store: None,
            cache: None,
        }
    }

    /// Open this worker's connection and pick its tag cache. Does nothing on a dry run.
    pub async fn init(
        &mut self,
        worker_id: usize,
        will_load: bool,
        hashed_workers: bool,
    ) -> Result<(), LoadError> {
        self.worker_id = worker_id;
        if !will_load {
            return Ok(());
        }

        self.store = Some(self.connector.connect().await?);
        self.cache = Some(self.caches.for_worker(hashed_workers));
        Ok(())
    }

    /// Write every table group of `batch`. Returns `(metrics, rows)`: the number of field
    /// values written and the number of records in the batch.
    pub async fn process(&mut self, batch: Batch, will_load: bool) -> Result<(u64, u64), LoadError> {
        let mut metrics = 0;
        let mut rows = 0;

        for (table, records) in batch.into_tables() {
            rows += records.len() as u64;
            if !will_load {
                continue;
            }

            match self.write_table(&table, &records).await {
                Ok(written) => metrics += written,
                Err(err) => {
                    metrics::counter!(WRITE_FAILED).increment(1);
                    error!(
                        "worker {} failed to write {} rows to {}: {}",
                        self.worker_id,
                        records.len(),
                        table,
                        err
                    );
                    return Err(err);
                }
            }
        }

        Ok((metrics, rows))
    }

    /// Release the connection. Safe to call after a dry-run `init`, or twice.
    pub async fn close(&mut self, will_load: bool) -> Result<(), LoadError> {
        self.cache = None;
        if let Some(mut store) = self.store.take() {
            store.close().await?;
        }
        debug!("worker {} closed, will_load={}", self.worker_id, will_load);
        Ok(())
    }

    async fn write_table(&mut self, table: &str, records: &[Record]) -> Result<u64, LoadError> {
        let schema = self.schema.clone();
        let table_schema = schema
            .table(table)
            .ok_or_else(|| LoadError::UnknownTable(table.to_owned()))?;
        let cache = self.cache.clone().ok_or(StoreError::Closed)?;

        let Converted {
            rows,
            new_tags,
            metrics,
        } = self.convert(table_schema, records, &cache)?;
        let submitted = rows.len();
        let columns = schema.columns_for(table_schema, self.options.tag_storage);
        let tag_columns = schema.tags_table_columns();

        let started = Instant::now();
        let store = self.store.as_mut().ok_or(StoreError::Closed)?;

        if self.options.use_bulk_path {
            // Tags go first so a reader never sees a tags_id without its row.
            if !new_tags.is_empty() {
                bulk_write(store.as_mut(), TAGS_TABLE, &tag_columns, &new_tags).await?;
            }
            bulk_write(store.as_mut(), table, &columns, &rows).await?;
        } else {
            let expected = (new_tags.len() + rows.len()) as u64;
            let mut statements = Vec::with_capacity(2);
            if !new_tags.is_empty() {
                statements.push(insert_statement(
                    TAGS_TABLE,
                    &tag_columns,
                    new_tags,
                    self.options.max_parameters,
                )?);
            }
            statements.push(insert_statement(
                table,
                &columns,
                rows,
                self.options.max_parameters,
            )?);

            let accepted = store.execute(&statements).await?;
            if accepted != expected {
                return Err(LoadError::RowCountMismatch {
                    table: table.to_owned(),
                    expected,
                    accepted,
                });
            }
        }

        let took = started.elapsed();
        metrics::counter!(ROWS_WRITTEN, "table" => table.to_owned()).increment(submitted as u64);
        metrics::counter!(METRICS_WRITTEN).increment(metrics);
        metrics::histogram!(BATCH_WRITE_TIME).record(took.as_millis() as f64);

        if self.options.log_batches {
            let rate = submitted as f64 / took.as_secs_f64().max(f64::EPSILON);
            info!(
                "worker {} wrote {} rows to {} in {:?} ({:.2} rows/sec)",
                self.worker_id, submitted, table, took, rate
            );
        }

        Ok(metrics)
    }

    fn convert(
        &self,
        table: &TableSchema,
        records: &[Record],
        cache: &TagCache,
    ) -> Result<Converted, LoadError> {
        let mut converted = Converted {
            rows: Vec::with_capacity(records.len()),
            new_tags: Vec::new(),
            metrics: 0,
        };
        let mut hits = 0;

        for record in records {
            if record.fields.len() != table.fields.len() {
                return Err(LoadError::FieldCount {
                    table: table.name.clone(),
                    expected: table.fields.len(),
                    got: record.fields.len(),
                });
            }

            let mut row = Vec::with_capacity(2 + self.schema.tags().len() + table.fields.len());
            row.push(Value::Timestamp(record.timestamp));

            let tags = self.tag_values(table, record)?;
            match self.options.tag_storage {
                TagStorage::SideTable => {
                    let (id, created) = cache.resolve_or_assign(&fingerprint(&tags));
                    if created {
                        let mut tag_row = Vec::with_capacity(1 + tags.len());
                        tag_row.push(Value::Int64(id));
                        tag_row.extend(tags);
                        converted.new_tags.push(tag_row);
                    } else {
                        hits += 1;
                    }
                    row.push(Value::Int64(id));
                }
                TagStorage::Denormalized => row.extend(tags),
            }

            for (field, raw) in table.fields.iter().zip(&record.fields) {
                let value = field
                    .value_type
                    .parse(raw)
                    .map_err(|_| LoadError::FieldParse {
                        table: table.name.clone(),
                        column: field.name.clone(),
                        value: raw.clone(),
                        value_type: field.value_type,
                    })?;
                row.push(value);
            }

            converted.metrics += record.fields.len() as u64;
            converted.rows.push(row);
        }

        metrics::counter!(TAGS_ASSIGNED).increment(converted.new_tags.len() as u64);
        metrics::counter!(TAG_CACHE_HITS).increment(hits);

        Ok(converted)
    }

    /// Typed tag values in schema order. Tags missing from the record are NULL, extra
    /// ones are ignored.
    fn tag_values(&self, table: &TableSchema, record: &Record) -> Result<Vec<Value>, LoadError> {
        self.schema
            .tags()
            .iter()
            .enumerate()
            .map(|(i, tag)| {
                let raw = record.tags.get(i).map(String::as_str).unwrap_or_default();
                tag.value_type
                    .parse(raw)
                    .map_err(|_| LoadError::FieldParse {
                        table: table.name.clone(),
                        column: tag.name.clone(),
                        value: raw.to_owned(),
                        value_type: tag.value_type,
                    })
            })
            .collect()
    }
}

/// Bulk write `rows` and make sure the store took all of them.
async fn bulk_write(
    store: &mut dyn Store,
    table: &str,
    columns: &[String],
    rows: &[Row],
) -> Result<(), LoadError> {
    let expected = rows.len() as u64;
    let accepted = store.bulk_write(table, columns, rows).await?;

    if accepted != expected {
        return Err(LoadError::RowCountMismatch {
            table: table.to_owned(),
            expected,
            accepted,
        });
    }
    Ok(())
}

/// Build a multi-row `INSERT` with one `$n` placeholder per cell.
/// Fails without building anything when the statement would need more than
/// `max_parameters` placeholders.
pub fn insert_statement(
    table: &str,
    columns: &[String],
    rows: Vec<Row>,
    max_parameters: usize,
) -> Result<Statement, LoadError> {
    let width = columns.len();
    if rows.len() * width > max_parameters {
        return Err(LoadError::ParameterLimit {
            table: table.to_owned(),
            rows: rows.len(),
            columns: width,
            max: max_parameters,
            max_rows: max_parameters / width.max(1),
        });
    }

    let mut sql = format!(
        "INSERT INTO {}({}) VALUES ",
        quote_ident(table),
        columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(",")
    );

    let mut param = 0;
    for i in 0..rows.len() {
        if i > 0 {
            sql.push(',');
        }
        sql.push('(');
        for j in 0..width {
            if j > 0 {
                sql.push(',');
            }
            param += 1;
            sql.push('$');
            sql.push_str(&param.to_string());
        }
        sql.push(')');
    }

    Ok(Statement {
        sql,
        params: rows.into_iter().flatten().collect(),
    })
}
