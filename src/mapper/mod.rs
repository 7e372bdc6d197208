//! The data-mapping layer.
//!
//! [`Mapper`] is the entry point: it owns the connection pool, the naming and
//! missing-column settings, and the per-type descriptor cache, and exposes the
//! typed operations that repositories call.
pub mod binder;
pub mod executor;
pub mod materializer;
pub mod metadata;
pub mod naming;
pub mod query;
pub mod sync;
pub mod value;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub use executor::{Connection, Database, PooledConnection, Transaction};
pub use materializer::{MissingColumnPolicy, Row};
pub use metadata::{
    Args, Entity, EntityBuilder, EntityDescriptor, InsertRole, PropertyValues, TypeMetadata,
    UpdateRole,
};
pub use naming::NamingConvention;
pub use query::{Command, Joiner, ParentIdentifiers, QueryBuilder};
pub use value::{ColumnType, FromValue, IntoValue, SqlType, Value};

use crate::error::{ConversionError, MapResult};
use executor::Handle;
use metadata::MetadataCache;

/// Builds a `Vec<Value>` of bound parameters.
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::mapper::Value>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::mapper::IntoValue::to_value(&$value)),+]
    };
}

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("sqlite:") {
            Some(Dialect::Sqlite)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Some(Dialect::Postgres)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
        }
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub schema: Option<String>,
    pub table: Option<String>,
    pub cancel: Option<CancellationToken>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperSettings {
    pub naming: NamingConvention,
    pub missing_column: MissingColumnPolicy,
    pub cache_metadata: bool,
}

impl Default for MapperSettings {
    fn default() -> Self {
        Self {
            naming: NamingConvention::default(),
            missing_column: MissingColumnPolicy::default(),
            cache_metadata: true,
        }
    }
}

pub struct Mapper {
    db: Database,
    settings: MapperSettings,
    cache: MetadataCache,
}

impl Mapper {
    pub fn new(db: Database, settings: MapperSettings) -> Self {
        let cache = MetadataCache::new(settings.cache_metadata);
        Self {
            db,
            settings,
            cache,
        }
    }

    pub async fn connect(
        url: &str,
        max_connections: u32,
        settings: MapperSettings,
    ) -> MapResult<Self> {
        Ok(Self::new(Database::connect(url, max_connections).await?, settings))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &MapperSettings {
        &self.settings
    }

    pub fn dialect(&self) -> Dialect {
        self.db.dialect()
    }

    pub async fn begin(&self) -> MapResult<Transaction> {
        self.db.begin().await
    }

    pub fn descriptor<T: Entity>(&self) -> MapResult<Arc<EntityDescriptor>> {
        self.cache.get::<T>()
    }

    pub fn type_metadata<T: Entity>(&self, opts: &Options) -> MapResult<TypeMetadata> {
        let descriptor = self.descriptor::<T>()?;
        Ok(descriptor.type_metadata(
            opts.schema.as_deref(),
            opts.table.as_deref(),
            self.settings.naming,
        ))
    }

    fn builder<'d>(
        &self,
        descriptor: &'d EntityDescriptor,
        tx: Option<&Transaction>,
        opts: &Options,
    ) -> QueryBuilder<'d> {
        let meta = descriptor.type_metadata(
            opts.schema.as_deref(),
            opts.table.as_deref(),
            self.settings.naming,
        );
        let dialect = tx.map_or(self.db.dialect(), Transaction::dialect);
        QueryBuilder::new(descriptor, meta, self.settings.naming, dialect)
    }

    async fn run(
        &self,
        tx: Option<&mut Transaction>,
        command: Option<Command>,
        opts: &Options,
    ) -> MapResult<u64> {
        let Some(command) = command else {
            return Ok(0);
        };
        let mut handle = Handle::open(&self.db, tx).await?;
        executor::execute(handle.connection(), &command, opts.cancel.as_ref()).await
    }

    async fn rows(
        &self,
        tx: Option<&mut Transaction>,
        command: &Command,
        opts: &Options,
    ) -> MapResult<Vec<Row>> {
        let mut handle = Handle::open(&self.db, tx).await?;
        executor::fetch(handle.connection(), command, opts.cancel.as_ref()).await
    }

    async fn materialized<T: Entity>(
        &self,
        tx: Option<&mut Transaction>,
        command: &Command,
        opts: &Options,
    ) -> MapResult<Vec<T>> {
        let descriptor = self.descriptor::<T>()?;
        let rows = self.rows(tx, command, opts).await?;
        materializer::materialize_all(
            &descriptor,
            &rows,
            self.settings.naming,
            self.settings.missing_column,
        )
    }

    /// `SELECT *` from the entity's table; `clause` may be empty, a bare
    /// condition, or start with WHERE / ORDER BY / GROUP BY / LIMIT.
    #[instrument(skip_all)]
    pub async fn select<T: Entity>(
        &self,
        tx: Option<&mut Transaction>,
        clause: &str,
        params: Vec<Value>,
        opts: &Options,
    ) -> MapResult<Vec<T>> {
        let descriptor = self.descriptor::<T>()?;
        let command = self
            .builder(&descriptor, tx.as_deref(), opts)
            .select(clause, params);
        self.materialized(tx, &command, opts).await
    }

    #[instrument(skip_all)]
    pub async fn select_one<T: Entity>(
        &self,
        tx: Option<&mut Transaction>,
        clause: &str,
        params: Vec<Value>,
        opts: &Options,
    ) -> MapResult<Option<T>> {
        Ok(self
            .select(tx, clause, params, opts)
            .await?
            .into_iter()
            .next())
    }

    /// Runs caller-written SQL and materializes every row as `T`.
    #[instrument(skip_all)]
    pub async fn query<T: Entity>(
        &self,
        tx: Option<&mut Transaction>,
        sql: &str,
        params: Vec<Value>,
        opts: &Options,
    ) -> MapResult<Vec<T>> {
        self.materialized(tx, &Command::new(sql, params), opts).await
    }

    #[instrument(skip_all)]
    pub async fn query_single<T: Entity>(
        &self,
        tx: Option<&mut Transaction>,
        sql: &str,
        params: Vec<Value>,
        opts: &Options,
    ) -> MapResult<Option<T>> {
        Ok(self
            .query(tx, sql, params, opts)
            .await?
            .into_iter()
            .next())
    }

    #[instrument(skip_all)]
    pub async fn execute(
        &self,
        tx: Option<&mut Transaction>,
        sql: &str,
        params: Vec<Value>,
        opts: &Options,
    ) -> MapResult<u64> {
        self.run(tx, Some(Command::new(sql, params)), opts).await
    }

    #[instrument(skip_all)]
    pub async fn insert<T: Entity>(
        &self,
        tx: Option<&mut Transaction>,
        rows: &[T],
        opts: &Options,
    ) -> MapResult<u64> {
        let descriptor = self.descriptor::<T>()?;
        let values = write_all(rows);
        let command = self
            .builder(&descriptor, tx.as_deref(), opts)
            .insert(&values)?;
        self.run(tx, command, opts).await
    }

    /// Inserts `rows` and returns `returning` (a property name) for each one,
    /// in the order the database reports them.
    #[instrument(skip_all)]
    pub async fn insert_returning<T: Entity, R: FromValue>(
        &self,
        tx: Option<&mut Transaction>,
        rows: &[T],
        returning: &str,
        opts: &Options,
    ) -> MapResult<Vec<R>> {
        let descriptor = self.descriptor::<T>()?;
        let values = write_all(rows);
        let Some(command) = self
            .builder(&descriptor, tx.as_deref(), opts)
            .insert_returning(&values, returning)?
        else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(rows.len());
        for row in self.rows(tx, &command, opts).await? {
            let column = row.columns().first().cloned().unwrap_or_default();
            let value = row
                .into_values()
                .into_iter()
                .next()
                .ok_or_else(|| ConversionError {
                    column: Some(column.clone()),
                    expected: "a returned column".to_string(),
                    found: "an empty row".to_string(),
                })?;
            out.push(R::from_value(value).map_err(|e| e.at(column))?);
        }
        Ok(out)
    }

    /// Updates every non-identifier, updatable column, matching rows on their
    /// identifier columns combined with `joiner`.
    #[instrument(skip_all)]
    pub async fn update<T: Entity>(
        &self,
        tx: Option<&mut Transaction>,
        rows: &[T],
        joiner: Joiner,
        opts: &Options,
    ) -> MapResult<u64> {
        let descriptor = self.descriptor::<T>()?;
        let values = write_all(rows);
        let command = self
            .builder(&descriptor, tx.as_deref(), opts)
            .update(&values, joiner)?;
        self.run(tx, command, opts).await
    }

    #[instrument(skip_all)]
    pub async fn upsert<T: Entity>(
        &self,
        tx: Option<&mut Transaction>,
        rows: &[T],
        opts: &Options,
    ) -> MapResult<u64> {
        let descriptor = self.descriptor::<T>()?;
        let values = write_all(rows);
        let command = self
            .builder(&descriptor, tx.as_deref(), opts)
            .upsert(&values)?;
        self.run(tx, command, opts).await
    }

    #[instrument(skip_all)]
    pub async fn remove<T: Entity>(
        &self,
        tx: Option<&mut Transaction>,
        rows: &[T],
        joiner: Joiner,
        opts: &Options,
    ) -> MapResult<u64> {
        let descriptor = self.descriptor::<T>()?;
        let values = write_all(rows);
        let command = self
            .builder(&descriptor, tx.as_deref(), opts)
            .remove(&values, joiner)?;
        self.run(tx, command, opts).await
    }

    /// Makes the parent's rows exactly `rows`. With no rows, `parents` names
    /// the parent to clear; without either the call does nothing.
    #[instrument(skip_all)]
    pub async fn sync<T: Entity>(
        &self,
        tx: Option<&mut Transaction>,
        rows: &[T],
        parents: Option<&ParentIdentifiers>,
        opts: &Options,
    ) -> MapResult<u64> {
        let descriptor = self.descriptor::<T>()?;
        let values = write_all(rows);
        let builder = self.builder(&descriptor, tx.as_deref(), opts);
        descriptor.require_sync_roles("sync")?;
        if values.is_empty() && parents.map_or(true, ParentIdentifiers::is_empty) {
            debug!(type_name = descriptor.type_name, "sync without rows or parent; nothing to do");
            return Ok(0);
        }
        let mut handle = Handle::open(&self.db, tx).await?;
        sync::sync(
            handle.connection(),
            &builder,
            &values,
            parents,
            opts.cancel.as_ref(),
        )
        .await
    }

    /// Syncs rows spanning several parents, one partition per parent tuple.
    #[instrument(skip_all)]
    pub async fn sync_multi_parent<T: Entity>(
        &self,
        tx: Option<&mut Transaction>,
        rows: &[T],
        opts: &Options,
    ) -> MapResult<u64> {
        let descriptor = self.descriptor::<T>()?;
        let values = write_all(rows);
        let builder = self.builder(&descriptor, tx.as_deref(), opts);
        descriptor.require_sync_roles("sync_multi_parent")?;
        if values.is_empty() {
            return Ok(0);
        }
        let mut handle = Handle::open(&self.db, tx).await?;
        sync::sync_multi_parent(handle.connection(), &builder, values, opts.cancel.as_ref()).await
    }
}

fn write_all<T: Entity>(rows: &[T]) -> Vec<PropertyValues> {
    rows.iter().map(PropertyValues::of).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn dialect_from_url() {
        assert_eq!(Dialect::from_url("sqlite::memory:"), Some(Dialect::Sqlite));
        assert_eq!(
            Dialect::from_url("postgresql://u@h/db"),
            Some(Dialect::Postgres)
        );
        assert_eq!(Dialect::from_url("mysql://h/db"), None);
    }

    #[test]
    fn params_macro_converts() {
        let id = 4_i64;
        let values = params![id, "x", None::<i32>];
        assert_eq!(
            values,
            vec![
                Value::BigInt(4),
                Value::Text("x".into()),
                Value::Null(ColumnType::Int)
            ]
        );
        assert!(params![].is_empty());
    }

    #[test]
    fn settings_defaults() {
        let settings: MapperSettings = serde_yaml::from_str("naming: camel_case").unwrap();
        assert_eq!(settings.naming, NamingConvention::CamelCase);
        assert_eq!(settings.missing_column, MissingColumnPolicy::FailOnNotFound);
        assert!(settings.cache_metadata);
    }
}
