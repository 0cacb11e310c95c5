//! An in-memory `Store` for exercising the loader without a database.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::record::fingerprint;
use crate::store::{Connector, Row, Statement, Store, StoreError, StoreResult, TableDefinition};
use crate::value::Value;

#[derive(Debug, Default)]
struct MemoryTable {
    definition: Option<TableDefinition>,
    columns: Vec<String>,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct MemoryState {
    databases: HashSet<String>,
    tables: HashMap<String, MemoryTable>,
    connections: usize,
    open_connections: usize,
    bulk_writes: usize,
    executes: usize,
    table_exists_checks: usize,
    created_tables: Vec<String>,
    dropped_tables: Vec<String>,
    short_write_by: u64,
}

/// Shared handle on everything written to the in-memory store. Every `MemoryStore` opened
/// by the same `MemoryConnector` sees the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryHandle {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryHandle {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a table out-of-band, as another loader process would.
    pub fn create_table(&self, table: TableDefinition) {
        let mut state = self.lock();
        state.tables.insert(
            table.name.clone(),
            MemoryTable {
                columns: table.columns.iter().map(|c| c.name.clone()).collect(),
                definition: Some(table),
                rows: vec![],
            },
        );
    }

    pub fn create_database(&self, name: &str) {
        self.lock().databases.insert(name.to_owned());
    }

    /// Make every subsequent bulk write report `by` rows fewer than it received, and
    /// keep none of them.
    pub fn short_bulk_writes_by(&self, by: u64) {
        self.lock().short_write_by = by;
    }

    pub fn table(&self, name: &str) -> Option<TableDefinition> {
        self.lock()
            .tables
            .get(name)
            .and_then(|t| t.definition.clone())
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Column order the rows of `table` were last written with.
    pub fn columns(&self, table: &str) -> Vec<String> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default()
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.lock().databases.contains(name)
    }

    pub fn created_tables(&self) -> Vec<String> {
        self.lock().created_tables.clone()
    }

    pub fn dropped_tables(&self) -> Vec<String> {
        self.lock().dropped_tables.clone()
    }

    pub fn bulk_writes(&self) -> usize {
        self.lock().bulk_writes
    }

    pub fn executes(&self) -> usize {
        self.lock().executes
    }

    pub fn table_exists_checks(&self) -> usize {
        self.lock().table_exists_checks
    }

    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open_connections
    }
}

pub struct MemoryStore {
    handle: MemoryHandle,
    open: bool,
}

impl MemoryStore {
    pub fn new(handle: MemoryHandle) -> Self {
        {
            let mut state = handle.lock();
            state.connections += 1;
            state.open_connections += 1;
        }
        Self { handle, open: true }
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        if !self.open {
            return Err(StoreError::Closed);
        }
        Ok(self.handle.lock())
    }
}

/// Pull the table and column list out of `INSERT INTO table(a,b,...) VALUES ...`.
fn parse_insert(sql: &str) -> Option<(String, Vec<String>)> {
    let rest = sql.strip_prefix("INSERT INTO ")?;
    let open = rest.find('(')?;
    let close = rest.find(')')?;
    let table = rest[..open].trim().trim_matches('"').to_owned();
    let columns = rest[open + 1..close]
        .split(',')
        .map(|c| c.trim().trim_matches('"').to_owned())
        .collect();
    Some((table, columns))
}

#[async_trait]
impl Store for MemoryStore {
    async fn database_exists(&mut self, name: &str) -> StoreResult<bool> {
        Ok(self.state()?.databases.contains(name))
    }

    async fn create_database(&mut self, name: &str) -> StoreResult<()> {
        self.state()?.databases.insert(name.to_owned());
        Ok(())
    }

    async fn drop_database(&mut self, name: &str) -> StoreResult<()> {
        self.state()?.databases.remove(name);
        Ok(())
    }

    async fn table_exists(&mut self, name: &str) -> StoreResult<bool> {
        let mut state = self.state()?;
        state.table_exists_checks += 1;
        Ok(state.tables.contains_key(name))
    }

    async fn drop_table(&mut self, name: &str) -> StoreResult<()> {
        let mut state = self.state()?;
        state.tables.remove(name);
        state.dropped_tables.push(name.to_owned());
        Ok(())
    }

    async fn create_table(&mut self, table: &TableDefinition) -> StoreResult<()> {
        self.state()?.created_tables.push(table.name.clone());
        self.handle.create_table(table.clone());
        Ok(())
    }

    async fn bulk_write(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Row],
    ) -> StoreResult<u64> {
        let mut state = self.state()?;
        state.bulk_writes += 1;
        let short_by = state.short_write_by;

        let stored = state
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_owned()))?;

        let submitted = rows.len() as u64;
        if short_by > 0 {
            return Ok(submitted.saturating_sub(short_by));
        }

        stored.columns = columns.to_vec();
        stored.rows.extend_from_slice(rows);
        Ok(submitted)
    }

    async fn execute(&mut self, statements: &[Statement]) -> StoreResult<u64> {
        let mut state = self.state()?;
        state.executes += 1;

        // Stage everything first so a failing statement leaves no rows behind.
        let mut staged: Vec<(String, Vec<String>, Vec<Row>)> = Vec::with_capacity(statements.len());
        for statement in statements {
            let (table, columns) = parse_insert(&statement.sql)
                .ok_or_else(|| StoreError::TableNotFound(statement.sql.clone()))?;
            if !state.tables.contains_key(&table) {
                return Err(StoreError::TableNotFound(table));
            }
            let rows = statement
                .params
                .chunks(columns.len().max(1))
                .map(<[Value]>::to_vec)
                .collect();
            staged.push((table, columns, rows));
        }

        let mut affected = 0;
        for (table, columns, rows) in staged {
            if let Some(stored) = state.tables.get_mut(&table) {
                affected += rows.len() as u64;
                stored.columns = columns;
                stored.rows.extend(rows);
            }
        }
        Ok(affected)
    }

    async fn load_tags(&mut self, tag_columns: &[String]) -> StoreResult<Vec<(i64, Vec<String>)>> {
        let state = self.state()?;
        let Some(tags) = state.tables.get("tags") else {
            return Ok(vec![]);
        };

        let positions: Vec<Option<usize>> = tag_columns
            .iter()
            .map(|c| tags.columns.iter().position(|stored| stored == c))
            .collect();
        let id_position = tags.columns.iter().position(|c| c == "id");

        Ok(tags
            .rows
            .iter()
            .filter_map(|row| {
                let id = match id_position.and_then(|i| row.get(i)) {
                    Some(Value::Int64(id)) => *id,
                    _ => return None,
                };
                let values = positions
                    .iter()
                    .map(|p| p.and_then(|i| row.get(i)).map(Value::to_string).unwrap_or_default())
                    .collect();
                Some((id, values))
            })
            .collect())
    }

    async fn close(&mut self) -> StoreResult<()> {
        if self.open {
            self.open = false;
            self.handle.lock().open_connections -= 1;
        }
        Ok(())
    }
}

/// Opens `MemoryStore`s that share one `MemoryHandle`.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    handle: MemoryHandle,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> MemoryHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> StoreResult<Box<dyn Store>> {
        Ok(Box::new(MemoryStore::new(self.handle.clone())))
    }

    async fn connect_admin(&self) -> StoreResult<Box<dyn Store>> {
        Ok(Box::new(MemoryStore::new(self.handle.clone())))
    }
}

/// Fingerprints of every row persisted in the in-memory `tags` table, keyed by id.
pub fn persisted_tags(handle: &MemoryHandle, tag_columns: &[String]) -> HashMap<i64, String> {
    let columns = handle.columns("tags");
    let positions: Vec<usize> = tag_columns
        .iter()
        .filter_map(|c| columns.iter().position(|stored| stored == c))
        .collect();

    handle
        .rows("tags")
        .into_iter()
        .filter_map(|row| {
            let id = match row.first() {
                Some(Value::Int64(id)) => *id,
                _ => return None,
            };
            let tags: Vec<Value> = positions.iter().map(|i| row[*i].clone()).collect();
            Some((id, fingerprint(&tags)))
        })
        .collect()
}
