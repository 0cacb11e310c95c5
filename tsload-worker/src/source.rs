//! Data sources feeding the loader with a schema header followed by records.
use std::fs::File;
use std::io::{self, BufRead, BufReader};

use chrono::{TimeZone, Utc};
use tsload_common::record::Record;
use tsload_common::schema::{FieldDefinition, Schema, SchemaError, TableSchema};
use tsload_common::value::ValueType;

use crate::error::SourceError;

const TAGS_PREFIX: &str = "tags";

/// The schema declaration found at the start of an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    pub tags: Vec<FieldDefinition>,
    pub tables: Vec<TableSchema>,
}

impl Headers {
    pub fn into_schema(self) -> Result<Schema, SchemaError> {
        Schema::new(self.tags, self.tables)
    }
}

/// Where records come from. Sources are read from a blocking thread.
pub trait DataSource: Send {
    /// The schema header. Must be callable before and after `next_record`.
    fn headers(&mut self) -> Result<Headers, SourceError>;

    /// The next record, or `None` once the input is exhausted.
    fn next_record(&mut self) -> Result<Option<Record>, SourceError>;
}

/// Reads the line oriented serialized format:
///
/// ```text
/// tags,name string,driver string
/// readings,velocity,fuel_state float32
///
/// tags,name=truck_1,driver=bob
/// readings,1451606400000000000,12.5,0.7
/// ```
pub struct FileDataSource<R> {
    reader: R,
    line: usize,
    buf: String,
    headers: Option<Headers>,
}

impl FileDataSource<Box<dyn BufRead + Send>> {
    /// Open a file, or stdin when `path` is `-`.
    pub fn open(path: &str) -> Result<Self, SourceError> {
        let reader: Box<dyn BufRead + Send> = if path == "-" {
            Box::new(BufReader::new(io::stdin()))
        } else {
            Box::new(BufReader::new(File::open(path)?))
        };
        Ok(Self::new(reader))
    }
}

impl<R: BufRead + Send> FileDataSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            buf: String::new(),
            headers: None,
        }
    }

    /// Read one line into the buffer without its line terminator. Returns false at EOF.
    fn read_line(&mut self) -> Result<bool, SourceError> {
        self.buf.clear();
        if self.reader.read_line(&mut self.buf)? == 0 {
            return Ok(false);
        }
        self.line += 1;
        let trimmed = self.buf.trim_end_matches(['\n', '\r']).len();
        self.buf.truncate(trimmed);
        Ok(true)
    }

    fn malformed(&self, reason: impl Into<String>) -> SourceError {
        SourceError::Malformed {
            line: self.line,
            reason: reason.into(),
        }
    }

    fn read_headers(&mut self) -> Result<Headers, SourceError> {
        // Skip leading blank lines.
        loop {
            if !self.read_line()? {
                return Err(SourceError::MissingHeader);
            }
            if !self.buf.trim().is_empty() {
                break;
            }
        }

        let mut parts = self.buf.split(',');
        if parts.next() != Some(TAGS_PREFIX) {
            return Err(self.malformed("header must start with a tags declaration"));
        }
        let tags = parts
            .map(|decl| parse_declaration(decl, ValueType::String))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| self.declaration_error(error))?;

        let mut tables = Vec::new();
        while self.read_line()? && !self.buf.trim().is_empty() {
            let mut parts = self.buf.split(',');
            let name = parts.next().unwrap_or_default().trim().to_owned();
            if name.is_empty() {
                return Err(self.malformed("table declaration has no name"));
            }
            let fields = parts
                .map(|decl| parse_declaration(decl, ValueType::Float64))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|error| self.declaration_error(error))?;
            tables.push(TableSchema::new(&name, fields));
        }

        Ok(Headers { tags, tables })
    }

    fn declaration_error(&self, error: DeclarationError) -> SourceError {
        match error {
            DeclarationError::Empty => self.malformed("empty column declaration"),
            DeclarationError::Type(error) => SourceError::InvalidType {
                line: self.line,
                error,
            },
        }
    }

    fn read_record(&mut self) -> Result<Option<Record>, SourceError> {
        loop {
            if !self.read_line()? {
                return Ok(None);
            }
            if !self.buf.trim().is_empty() {
                break;
            }
        }

        let tags = {
            let mut parts = self.buf.split(',');
            if parts.next() != Some(TAGS_PREFIX) {
                return Err(self.malformed("expected a tags line"));
            }
            let mut tags = Vec::new();
            for pair in parts {
                match pair.split_once('=') {
                    Some((_, value)) => tags.push(value.to_owned()),
                    None => return Err(self.malformed(format!("tag {pair:?} is not key=value"))),
                }
            }
            tags
        };

        if !self.read_line()? {
            return Err(self.malformed("tags line is not followed by a fields line"));
        }

        let mut parts = self.buf.split(',');
        let table = parts.next().unwrap_or_default().to_owned();
        let nanos: i64 = match parts.next().map(str::parse) {
            Some(Ok(nanos)) => nanos,
            _ => return Err(self.malformed("missing or invalid nanosecond timestamp")),
        };
        let fields = parts.map(str::to_owned).collect();

        Ok(Some(Record::new(
            &table,
            tags,
            fields,
            Utc.timestamp_nanos(nanos),
        )))
    }
}

impl<R: BufRead + Send> DataSource for FileDataSource<R> {
    fn headers(&mut self) -> Result<Headers, SourceError> {
        if let Some(headers) = &self.headers {
            return Ok(headers.clone());
        }
        let headers = self.read_headers()?;
        self.headers = Some(headers.clone());
        Ok(headers)
    }

    fn next_record(&mut self) -> Result<Option<Record>, SourceError> {
        if self.headers.is_none() {
            self.headers()?;
        }
        self.read_record()
    }
}

enum DeclarationError {
    Empty,
    Type(tsload_common::value::ParseValueError),
}

/// Parse `name` or `name type`.
fn parse_declaration(decl: &str, default: ValueType) -> Result<FieldDefinition, DeclarationError> {
    let mut words = decl.split_whitespace();
    let name = words.next().ok_or(DeclarationError::Empty)?;
    let value_type = match words.next() {
        Some(type_name) => type_name.parse().map_err(DeclarationError::Type)?,
        None => default,
    };
    Ok(FieldDefinition::new(name, value_type))
}

/// A source over records already in memory.
pub struct MemoryDataSource {
    headers: Headers,
    records: std::vec::IntoIter<Record>,
}

impl MemoryDataSource {
    pub fn new(headers: Headers, records: Vec<Record>) -> Self {
        Self {
            headers,
            records: records.into_iter(),
        }
    }
}

impl DataSource for MemoryDataSource {
    fn headers(&mut self) -> Result<Headers, SourceError> {
        Ok(self.headers.clone())
    }

    fn next_record(&mut self) -> Result<Option<Record>, SourceError> {
        Ok(self.records.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const INPUT: &str = "tags,name string,driver string
readings,velocity,fuel_state float32
diagnostics,load int64

tags,name=truck_1,driver=bob
readings,1451606400000000000,12.5,0.7
tags,name=truck_2,driver=
diagnostics,1451606410000000000,3
";

    fn source(input: &str) -> FileDataSource<Cursor<Vec<u8>>> {
        FileDataSource::new(Cursor::new(input.as_bytes().to_vec()))
    }

    #[test]
    fn test_parses_headers() {
        let headers = source(INPUT).headers().unwrap();

        assert_eq!(
            headers.tags,
            vec![
                FieldDefinition::new("name", ValueType::String),
                FieldDefinition::new("driver", ValueType::String),
            ]
        );
        assert_eq!(headers.tables.len(), 2);
        assert_eq!(
            headers.tables[0],
            TableSchema::new(
                "readings",
                vec![
                    FieldDefinition::new("velocity", ValueType::Float64),
                    FieldDefinition::new("fuel_state", ValueType::Float32),
                ]
            )
        );
        assert_eq!(headers.tables[1].fields[0].value_type, ValueType::Int64);
    }

    #[test]
    fn test_reads_records_in_order() {
        let mut source = source(INPUT);

        let first = source.next_record().unwrap().unwrap();
        assert_eq!(first.table, "readings");
        assert_eq!(first.tags, vec!["truck_1", "bob"]);
        assert_eq!(first.fields, vec!["12.5", "0.7"]);
        assert_eq!(first.timestamp.timestamp(), 1451606400);

        let second = source.next_record().unwrap().unwrap();
        assert_eq!(second.table, "diagnostics");
        assert_eq!(second.tags, vec!["truck_2", ""]);
        assert_eq!(second.fields, vec!["3"]);

        assert!(source.next_record().unwrap().is_none());
        // Headers stay available after reading records.
        assert_eq!(source.headers().unwrap().tables.len(), 2);
    }

    #[test]
    fn test_rejects_unknown_type() {
        let err = source("tags,name uuid\n\n").headers().unwrap_err();

        assert!(matches!(err, SourceError::InvalidType { line: 1, .. }));
    }

    #[test]
    fn test_rejects_bad_timestamp() {
        let err = source("tags,name\nreadings,velocity\n\ntags,name=a\nreadings,yesterday,1\n")
            .next_record()
            .unwrap_err();

        assert!(matches!(err, SourceError::Malformed { line: 5, .. }));
    }

    #[test]
    fn test_rejects_missing_header() {
        let err = source("\n\n").headers().unwrap_err();

        assert!(matches!(err, SourceError::MissingHeader));
    }
}
