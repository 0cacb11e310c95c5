use std::time;

use thiserror::Error;
use tsload_common::schema::SchemaError;
use tsload_common::store::StoreError;
use tsload_common::value::{ParseValueError, ValueType};

/// Enumeration of errors related to reading records out of a data source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("line {line}: {error}")]
    InvalidType { line: usize, error: ParseValueError },
    #[error("input ended before the header was complete")]
    MissingHeader,
}

/// Enumeration of errors that end a load. None of them are retried.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("a store error occurred: {0}")]
    Store(#[from] StoreError),
    #[error("a source error occurred: {0}")]
    Source(#[from] SourceError),
    #[error("invalid schema: {0}")]
    Schema(#[from] SchemaError),
    #[error("record targets table {0}, which the source did not declare")]
    UnknownTable(String),
    #[error("table {table}: cannot parse {value:?} as {value_type} for column {column}")]
    FieldParse {
        table: String,
        column: String,
        value: String,
        value_type: ValueType,
    },
    #[error("table {table}: expected {expected} field values but the record has {got}")]
    FieldCount {
        table: String,
        expected: usize,
        got: usize,
    },
    #[error("table {table}: store accepted {accepted} of {expected} rows")]
    RowCountMismatch {
        table: String,
        expected: u64,
        accepted: u64,
    },
    #[error(
        "table {table}: {rows} rows of {columns} columns need more than {max} parameters, \
         lower the batch size to at most {max_rows}"
    )]
    ParameterLimit {
        table: String,
        rows: usize,
        columns: usize,
        max: usize,
        max_rows: usize,
    },
    #[error("table {table} did not appear after waiting {waited:?}")]
    TableWaitTimeout { table: String, waited: time::Duration },
    #[error("failed to create table {table}: {error}")]
    SchemaCreation { table: String, error: StoreError },
    #[error("worker {0} panicked or was cancelled")]
    WorkerPanicked(usize),
    #[error("the record scanner panicked")]
    ScannerPanicked,
}
