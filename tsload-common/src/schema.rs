use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

use crate::value::ValueType;

pub const TIME_COLUMN: &str = "time";
pub const TAGS_TABLE: &str = "tags";
pub const TAGS_ID_COLUMN: &str = "tags_id";
pub const TAGS_TABLE_ID_COLUMN: &str = "id";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema declares no tags")]
    NoTags,
    #[error("table {0} is declared more than once")]
    DuplicateTable(String),
    #[error("table name {0} is reserved")]
    ReservedTable(String),
    #[error("{0} is not a valid TagStorage")]
    ParseTagStorageError(String),
}

/// Where tag values live relative to the metrics tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagStorage {
    /// Tags are normalized into a `tags` table and referenced by `tags_id`.
    SideTable,
    /// Tag values are written inline in every metrics row.
    Denormalized,
}

impl FromStr for TagStorage {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "side-table" => Ok(TagStorage::SideTable),
            "denormalized" => Ok(TagStorage::Denormalized),
            invalid => Err(SchemaError::ParseTagStorageError(invalid.to_owned())),
        }
    }
}

/// A named, typed column as declared by a source header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    pub name: String,
    pub value_type: ValueType,
}

impl FieldDefinition {
    pub fn new(name: &str, value_type: ValueType) -> Self {
        Self {
            name: name.to_owned(),
            value_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
}

impl TableSchema {
    pub fn new(name: &str, fields: Vec<FieldDefinition>) -> Self {
        Self {
            name: name.to_owned(),
            fields,
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

/// Tag and table layout for a whole run. Built once from the source headers and
/// shared read-only by every worker afterwards.
#[derive(Debug, Clone)]
pub struct Schema {
    tags: Vec<FieldDefinition>,
    tables: Vec<TableSchema>,
    by_name: HashMap<String, usize>,
}

impl Schema {
    pub fn new(tags: Vec<FieldDefinition>, tables: Vec<TableSchema>) -> Result<Self, SchemaError> {
        if tags.is_empty() {
            return Err(SchemaError::NoTags);
        }

        let mut by_name = HashMap::with_capacity(tables.len());
        for (i, table) in tables.iter().enumerate() {
            if table.name == TAGS_TABLE {
                return Err(SchemaError::ReservedTable(table.name.clone()));
            }
            if by_name.insert(table.name.clone(), i).is_some() {
                return Err(SchemaError::DuplicateTable(table.name.clone()));
            }
        }

        Ok(Self {
            tags,
            tables,
            by_name,
        })
    }

    pub fn tags(&self) -> &[FieldDefinition] {
        &self.tags
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.tags.iter().map(|t| t.name.clone()).collect()
    }

    /// The first declared tag, used as the partition key.
    pub fn primary_tag(&self) -> &FieldDefinition {
        &self.tags[0]
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.by_name.get(name).map(|i| &self.tables[*i])
    }

    /// Column order used for every row written to `table`.
    pub fn columns_for(&self, table: &TableSchema, storage: TagStorage) -> Vec<String> {
        let mut columns = Vec::with_capacity(1 + self.tags.len() + table.fields.len());
        columns.push(TIME_COLUMN.to_owned());
        match storage {
            TagStorage::SideTable => columns.push(TAGS_ID_COLUMN.to_owned()),
            TagStorage::Denormalized => columns.extend(self.tags.iter().map(|t| t.name.clone())),
        }
        columns.extend(table.fields.iter().map(|f| f.name.clone()));
        columns
    }

    /// Column order of the `tags` side table.
    pub fn tags_table_columns(&self) -> Vec<String> {
        let mut columns = Vec::with_capacity(1 + self.tags.len());
        columns.push(TAGS_TABLE_ID_COLUMN.to_owned());
        columns.extend(self.tags.iter().map(|t| t.name.clone()));
        columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(
            vec![
                FieldDefinition::new("name", ValueType::String),
                FieldDefinition::new("driver", ValueType::String),
            ],
            vec![TableSchema::new(
                "readings",
                vec![
                    FieldDefinition::new("velocity", ValueType::Float64),
                    FieldDefinition::new("fuel", ValueType::Float32),
                ],
            )],
        )
        .unwrap()
    }

    #[test]
    fn test_columns_for_side_table() {
        let schema = schema();
        let table = schema.table("readings").unwrap();

        assert_eq!(
            schema.columns_for(table, TagStorage::SideTable),
            vec!["time", "tags_id", "velocity", "fuel"]
        );
        assert_eq!(schema.tags_table_columns(), vec!["id", "name", "driver"]);
    }

    #[test]
    fn test_columns_for_denormalized() {
        let schema = schema();
        let table = schema.table("readings").unwrap();

        assert_eq!(
            schema.columns_for(table, TagStorage::Denormalized),
            vec!["time", "name", "driver", "velocity", "fuel"]
        );
    }

    #[test]
    fn test_schema_validation() {
        assert_eq!(
            Schema::new(vec![], vec![]).unwrap_err(),
            SchemaError::NoTags
        );

        let tags = vec![FieldDefinition::new("name", ValueType::String)];
        let duplicated = vec![
            TableSchema::new("cpu", vec![]),
            TableSchema::new("cpu", vec![]),
        ];
        assert_eq!(
            Schema::new(tags.clone(), duplicated).unwrap_err(),
            SchemaError::DuplicateTable("cpu".to_owned())
        );
        assert_eq!(
            Schema::new(tags, vec![TableSchema::new("tags", vec![])]).unwrap_err(),
            SchemaError::ReservedTable("tags".to_owned())
        );
    }

    #[test]
    fn test_tag_storage_from_str() {
        assert_eq!("side-table".parse(), Ok(TagStorage::SideTable));
        assert_eq!("denormalized".parse(), Ok(TagStorage::Denormalized));
        assert!("json".parse::<TagStorage>().is_err());
    }
}
