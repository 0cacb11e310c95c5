//! Database and table setup ahead of a load.
use tracing::{debug, info, warn};
use tsload_common::schema::{
    Schema, TableSchema, TagStorage, TAGS_ID_COLUMN, TAGS_TABLE, TAGS_TABLE_ID_COLUMN, TIME_COLUMN,
};
use tsload_common::store::{
    ColumnDefinition, ColumnType, IndexColumn, IndexDefinition, Store, TableDefinition,
};
use tsload_common::value::ValueType;

use crate::config::{FieldIndexKind, IndexStrategy, LoadingConfig};
use crate::error::LoadError;

/// Creates or waits for everything a load writes into.
pub struct SchemaCoordinator<'a> {
    schema: &'a Schema,
    options: &'a LoadingConfig,
}

impl<'a> SchemaCoordinator<'a> {
    pub fn new(schema: &'a Schema, options: &'a LoadingConfig) -> Self {
        Self { schema, options }
    }

    /// Make sure the target database exists, dropping a previous one first when asked to.
    /// `admin` must be connected to a database other than `name`.
    pub async fn ensure_database(
        &self,
        admin: &mut dyn Store,
        name: &str,
        drop_existing: bool,
    ) -> Result<(), LoadError> {
        if drop_existing && admin.database_exists(name).await? {
            info!("dropping existing database {}", name);
            admin.drop_database(name).await?;
        }

        if !admin.database_exists(name).await? {
            info!("creating database {}", name);
            admin.create_database(name).await?;
        }

        Ok(())
    }

    /// Create every table of the schema, or wait for another loader to create them.
    pub async fn ensure_schema(&self, store: &mut dyn Store) -> Result<(), LoadError> {
        if !self.options.create_schema {
            for table in self.schema.tables() {
                self.wait_for_table(store, &table.name).await?;
            }
            if self.options.tag_storage == TagStorage::SideTable {
                self.wait_for_table(store, TAGS_TABLE).await?;
            }
            return Ok(());
        }

        if self.options.tag_storage == TagStorage::SideTable {
            self.recreate(store, &self.tags_table_definition()).await?;
        }
        for table in self.schema.tables() {
            self.recreate(store, &self.table_definition(table)).await?;
        }

        Ok(())
    }

    async fn recreate(
        &self,
        store: &mut dyn Store,
        definition: &TableDefinition,
    ) -> Result<(), LoadError> {
        let schema_error = |error| LoadError::SchemaCreation {
            table: definition.name.clone(),
            error,
        };

        if store
            .table_exists(&definition.name)
            .await
            .map_err(schema_error)?
        {
            store
                .drop_table(&definition.name)
                .await
                .map_err(schema_error)?;
        }

        debug!(
            "creating table {} with {} indexes",
            definition.name,
            definition.indexes.len()
        );
        store.create_table(definition).await.map_err(schema_error)
    }

    /// Poll until `table` exists. Every failed check is followed by one interval of sleep,
    /// so giving up takes the whole configured timeout.
    pub async fn wait_for_table(&self, store: &mut dyn Store, table: &str) -> Result<(), LoadError> {
        let interval = self.options.table_wait_interval.0;
        let timeout = self.options.table_wait_timeout.0;
        let attempts = (timeout.as_millis() / interval.as_millis().max(1)).max(1);

        for attempt in 1..=attempts {
            if store.table_exists(table).await? {
                return Ok(());
            }
            if attempt == 1 {
                info!("waiting for table {} to be created", table);
            }
            tokio::time::sleep(interval).await;
        }

        warn!("table {} was not created in time", table);
        Err(LoadError::TableWaitTimeout {
            table: table.to_owned(),
            waited: interval * u32::try_from(attempts).unwrap_or(u32::MAX),
        })
    }

    /// Column used to partition data by entity.
    fn partition_column(&self) -> &str {
        match self.options.tag_storage {
            TagStorage::SideTable => TAGS_ID_COLUMN,
            TagStorage::Denormalized => self.schema.primary_tag().name.as_str(),
        }
    }

    pub fn table_definition(&self, table: &TableSchema) -> TableDefinition {
        let mut columns = vec![ColumnDefinition::new(TIME_COLUMN, ColumnType::Timestamp)];
        match self.options.tag_storage {
            TagStorage::SideTable => columns.push(ColumnDefinition::new(
                TAGS_ID_COLUMN,
                ColumnType::Value(ValueType::Int64),
            )),
            TagStorage::Denormalized => columns.extend(
                self.schema
                    .tags()
                    .iter()
                    .map(|t| ColumnDefinition::new(&t.name, ColumnType::Value(t.value_type))),
            ),
        }
        columns.extend(
            table
                .fields
                .iter()
                .map(|f| ColumnDefinition::new(&f.name, ColumnType::Value(f.value_type))),
        );

        let partition = self.partition_column();
        let mut indexes = match self.options.index_strategy {
            IndexStrategy::None => vec![],
            IndexStrategy::Time => vec![IndexDefinition::on(vec![IndexColumn::desc(TIME_COLUMN)])],
            IndexStrategy::Partition => vec![IndexDefinition::on(vec![
                IndexColumn::asc(partition),
                IndexColumn::desc(TIME_COLUMN),
            ])],
            IndexStrategy::TimePartition => vec![IndexDefinition::on(vec![
                IndexColumn::desc(TIME_COLUMN),
                IndexColumn::asc(partition),
            ])],
        };

        let indexed_fields = match usize::try_from(self.options.field_index_count) {
            Ok(count) => count.min(table.fields.len()),
            Err(_) => table.fields.len(),
        };
        for field in &table.fields[..indexed_fields] {
            for kind in &self.options.field_index.0 {
                let columns = match kind {
                    FieldIndexKind::ValueTime => {
                        vec![IndexColumn::asc(&field.name), IndexColumn::desc(TIME_COLUMN)]
                    }
                    FieldIndexKind::TimeValue => {
                        vec![IndexColumn::desc(TIME_COLUMN), IndexColumn::asc(&field.name)]
                    }
                };
                indexes.push(IndexDefinition::on(columns));
            }
        }

        if self.options.tag_storage == TagStorage::Denormalized {
            indexes.push(
                IndexDefinition::on(
                    self.schema
                        .tags()
                        .iter()
                        .map(|t| IndexColumn::asc(&t.name))
                        .collect(),
                )
                .named(&format!("{}_tags_idx", table.name)),
            );
        }

        TableDefinition {
            name: table.name.clone(),
            columns,
            primary_key: None,
            indexes,
        }
    }

    /// The `tags` side table: one row per distinct tag set.
    pub fn tags_table_definition(&self) -> TableDefinition {
        let mut columns = vec![ColumnDefinition::new(
            TAGS_TABLE_ID_COLUMN,
            ColumnType::Value(ValueType::Int64),
        )];
        columns.extend(
            self.schema
                .tags()
                .iter()
                .map(|t| ColumnDefinition::new(&t.name, ColumnType::Value(t.value_type))),
        );

        let primary = &self.schema.primary_tag().name;
        TableDefinition {
            name: TAGS_TABLE.to_owned(),
            columns,
            primary_key: Some(TAGS_TABLE_ID_COLUMN.to_owned()),
            indexes: vec![
                IndexDefinition::on(
                    self.schema
                        .tags()
                        .iter()
                        .map(|t| IndexColumn::asc(&t.name))
                        .collect(),
                )
                .named("tags_uniq_idx")
                .unique(),
                IndexDefinition::on(vec![IndexColumn::asc(primary)])
                    .named(&format!("tags_{}_idx", primary)),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time;

    use super::*;
    use crate::config::{Config, FieldIndexes};
    use tsload_common::schema::FieldDefinition;
    use tsload_common::test_utils::{MemoryHandle, MemoryStore};

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
                    FieldDefinition::new("fuel_state", ValueType::Float32),
                ],
            )],
        )
        .unwrap()
    }

    fn options() -> LoadingConfig {
        Config::init_with_defaults().unwrap().loading
    }

    #[test]
    fn test_side_table_definition() {
        let schema = schema();
        let options = options();
        let coordinator = SchemaCoordinator::new(&schema, &options);

        let table = coordinator.table_definition(&schema.tables()[0]);
        let columns: Vec<_> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(columns, vec!["time", "tags_id", "velocity", "fuel_state"]);
        assert_eq!(table.indexes.len(), 1);
        assert_eq!(table.indexes[0].column_names(), vec!["time"]);

        let tags = coordinator.tags_table_definition();
        assert_eq!(tags.primary_key.as_deref(), Some("id"));
        assert!(tags.indexes[0].unique);
        assert_eq!(tags.indexes[0].column_names(), vec!["name", "driver"]);
    }

    #[test]
    fn test_denormalized_definition_with_field_indexes() {
        let schema = schema();
        let mut options = options();
        options.tag_storage = TagStorage::Denormalized;
        options.index_strategy = IndexStrategy::Partition;
        options.field_index = FieldIndexes(vec![FieldIndexKind::ValueTime, FieldIndexKind::TimeValue]);
        options.field_index_count = -1;
        let coordinator = SchemaCoordinator::new(&schema, &options);

        let table = coordinator.table_definition(&schema.tables()[0]);
        let columns: Vec<_> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(columns, vec!["time", "name", "driver", "velocity", "fuel_state"]);

        let indexes: Vec<_> = table.indexes.iter().map(|i| i.column_names()).collect();
        assert_eq!(
            indexes,
            vec![
                vec!["name", "time"],
                vec!["velocity", "time"],
                vec!["time", "velocity"],
                vec!["fuel_state", "time"],
                vec!["time", "fuel_state"],
                vec!["name", "driver"],
            ]
        );
        assert_eq!(table.indexes[5].name.as_deref(), Some("readings_tags_idx"));
    }

    #[tokio::test]
    async fn test_ensure_schema_recreates_tables() {
        let schema = schema();
        let options = options();
        let coordinator = SchemaCoordinator::new(&schema, &options);
        let handle = MemoryHandle::default();
        let mut store = MemoryStore::new(handle.clone());

        coordinator.ensure_schema(&mut store).await.unwrap();
        coordinator.ensure_schema(&mut store).await.unwrap();

        assert_eq!(
            handle.created_tables(),
            vec!["tags", "readings", "tags", "readings"]
        );
        assert_eq!(handle.dropped_tables(), vec!["tags", "readings"]);
    }

    #[tokio::test]
    async fn test_ensure_database_drops_existing() {
        let schema = schema();
        let options = options();
        let coordinator = SchemaCoordinator::new(&schema, &options);
        let handle = MemoryHandle::default();
        handle.create_database("benchmark");
        let mut admin = MemoryStore::new(handle.clone());

        coordinator
            .ensure_database(&mut admin, "benchmark", true)
            .await
            .unwrap();
        assert!(handle.has_database("benchmark"));

        coordinator
            .ensure_database(&mut admin, "other", false)
            .await
            .unwrap();
        assert!(handle.has_database("other"));
    }

    #[tokio::test]
    async fn test_wait_for_table_times_out() {
        let schema = schema();
        let mut options = options();
        options.create_schema = false;
        options.table_wait_interval = crate::config::EnvMsDuration(time::Duration::from_millis(5));
        options.table_wait_timeout = crate::config::EnvMsDuration(time::Duration::from_millis(20));
        let coordinator = SchemaCoordinator::new(&schema, &options);
        let handle = MemoryHandle::default();
        let mut store = MemoryStore::new(handle.clone());

        let err = coordinator
            .wait_for_table(&mut store, "readings")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LoadError::TableWaitTimeout { ref table, waited }
                if table == "readings" && waited == time::Duration::from_millis(20)
        ));
        assert_eq!(handle.table_exists_checks(), 4);
    }
}
