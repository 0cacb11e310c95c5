use async_trait::async_trait;
use thiserror::Error;

use crate::value::{Value, ValueType};

/// PostgreSQL caps the number of bind parameters in one statement at 65535.
pub const MAX_PARAMETERS: usize = u16::MAX as usize;

/// Enumeration of errors for operations against a target store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{url} is not a valid connection url: {error}")]
    InvalidUrl { url: String, error: url::ParseError },
    #[error("failed to encode rows as csv: {0}")]
    CsvError(#[from] csv::Error),
    #[error("table {0} does not exist")]
    TableNotFound(String),
    #[error("the store connection is closed")]
    Closed,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One row of cells, ordered like the column list it is written with.
pub type Row = Vec<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Timestamp,
    Value(ValueType),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDefinition {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_owned(),
            column_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    pub name: String,
    pub descending: bool,
}

impl IndexColumn {
    pub fn asc(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            descending: false,
        }
    }

    pub fn desc(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            descending: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    /// Stores pick a name when none is given.
    pub name: Option<String>,
    pub columns: Vec<IndexColumn>,
    pub unique: bool,
}

impl IndexDefinition {
    pub fn on(columns: Vec<IndexColumn>) -> Self {
        Self {
            name: None,
            columns,
            unique: false,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Everything a store needs to create a table and its indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub primary_key: Option<String>,
    pub indexes: Vec<IndexDefinition>,
}

/// A statement with positional parameters (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Quote an identifier the way standard SQL does.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// The capabilities the loader needs from a target store.
#[async_trait]
pub trait Store: Send {
    async fn database_exists(&mut self, name: &str) -> StoreResult<bool>;

    async fn create_database(&mut self, name: &str) -> StoreResult<()>;

    async fn drop_database(&mut self, name: &str) -> StoreResult<()>;

    async fn table_exists(&mut self, name: &str) -> StoreResult<bool>;

    async fn drop_table(&mut self, name: &str) -> StoreResult<()>;

    /// Create a table together with all of its indexes.
    async fn create_table(&mut self, table: &TableDefinition) -> StoreResult<()>;

    /// Stream `rows` into `table` as one bulk operation.
    /// Returns the number of rows the store reports as accepted.
    async fn bulk_write(&mut self, table: &str, columns: &[String], rows: &[Row])
        -> StoreResult<u64>;

    /// Run all statements inside a single transaction.
    /// Returns the total number of rows affected.
    async fn execute(&mut self, statements: &[Statement]) -> StoreResult<u64>;

    /// Read back persisted tag identities as `(id, tag values)`, tag values ordered like
    /// `tag_columns`. NULL tag values come back as empty strings.
    async fn load_tags(&mut self, tag_columns: &[String]) -> StoreResult<Vec<(i64, Vec<String>)>>;

    /// Release the underlying connection. Further calls fail with `StoreError::Closed`.
    async fn close(&mut self) -> StoreResult<()>;
}

/// Opens store connections. Each worker gets its own.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the database being loaded.
    async fn connect(&self) -> StoreResult<Box<dyn Store>>;

    /// Connect to the administrative database used to drop and create the target database.
    async fn connect_admin(&self) -> StoreResult<Box<dyn Store>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("time"), "\"time\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
