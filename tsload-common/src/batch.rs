use std::collections::HashMap;

use crate::record::Record;

/// Records grouped by destination table, waiting to be written.
#[derive(Debug, Default)]
pub struct Batch {
    tables: HashMap<String, Vec<Record>>,
    rows: usize,
}

impl Batch {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn table(&self, name: &str) -> Option<&[Record]> {
        self.tables.get(name).map(Vec::as_slice)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Consume the batch, yielding each table with its records.
    pub fn into_tables(self) -> impl Iterator<Item = (String, Vec<Record>)> {
        self.tables.into_iter()
    }
}

/// Buffers records for one worker until the worker decides to flush.
/// No size limit is enforced here: the worker loop owns the batching policy.
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    current: Batch,
}

impl BatchAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: Record) {
        self.current.rows += 1;
        match self.current.tables.get_mut(&record.table) {
            Some(records) => records.push(record),
            None => {
                self.current.tables.insert(record.table.clone(), vec![record]);
            }
        }
    }

    /// Hand over everything buffered so far and start again from empty.
    pub fn flush(&mut self) -> Batch {
        std::mem::take(&mut self.current)
    }

    pub fn len(&self) -> usize {
        self.current.rows
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}
