//! Error taxonomy for the mapping layer and the repositories built on it.
use crate::mapper::executor::render_sql;
use crate::mapper::value::Value;
use thiserror::Error;
use tracing::warn;

pub type MapResult<T> = Result<T, MapError>;

/// A caller or schema mistake. Raised before any SQL is issued and never retried.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{type_name} declares no mapping constructor")]
    MissingConstructor { type_name: &'static str },
    #[error("{type_name} declares {count} mapping constructors; exactly one is required")]
    AmbiguousConstructor { type_name: &'static str, count: usize },
    #[error("{type_name} needs exactly one record identifier for {operation}, found {found}")]
    RecordIdentifier {
        type_name: &'static str,
        operation: &'static str,
        found: usize,
    },
    #[error("{type_name} needs at least one scope identifier for {operation}")]
    MissingScopeIdentifier {
        type_name: &'static str,
        operation: &'static str,
    },
    #[error("{type_name} has no record or scope identifier to build a conflict target from")]
    MissingConflictColumns { type_name: &'static str },
    #[error("{type_name} has no identifier columns for {operation}")]
    MissingIdentifiers {
        type_name: &'static str,
        operation: &'static str,
    },
    #[error("{type_name} has no insertable properties")]
    NoInsertableColumns { type_name: &'static str },
    #[error("{type_name}: rows of one batch must share parent identifiers ({first} vs {other})")]
    MixedParents {
        type_name: &'static str,
        first: String,
        other: String,
    },
    #[error("{type_name}: property `{property}` was declared but not written")]
    MissingPropertyValue {
        type_name: &'static str,
        property: String,
    },
    #[error("{type_name}: `{property}` is not a mapped property")]
    UnknownProperty {
        type_name: &'static str,
        property: String,
    },
    #[error("{type_name}: `{property}` is not a scope identifier and cannot select a parent")]
    NotAScopeIdentifier {
        type_name: &'static str,
        property: String,
    },
    #[error("cannot coerce {from} value to column type {to}")]
    Coercion { from: String, to: String },
}

/// A column required by the mapping constructor is absent from a result row.
#[derive(Debug, Error)]
#[error("{type_name}: no column `{column}` for constructor parameter `{parameter}`")]
pub struct NameResolutionError {
    pub type_name: &'static str,
    pub parameter: &'static str,
    pub column: String,
}

/// A stored value could not be turned into the requested host type.
#[derive(Debug, Error)]
#[error("column `{}`: expected {expected}, found {found}", column.as_deref().unwrap_or("?"))]
pub struct ConversionError {
    pub column: Option<String>,
    pub expected: String,
    pub found: String,
}

impl ConversionError {
    pub fn new(expected: impl Into<String>, found: &Value) -> Self {
        Self {
            column: None,
            expected: expected.into(),
            found: found.describe(),
        }
    }

    pub fn at(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }
}

/// Any failure surfaced by the driver while running a command.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct QueryError {
    pub message: String,
    pub sql: String,
    pub params: Vec<Value>,
    #[source]
    pub source: sqlx::Error,
}

impl QueryError {
    pub fn new(sql: &str, params: &[Value], source: sqlx::Error) -> Self {
        let message = match &source {
            sqlx::Error::Database(db) => match db.constraint() {
                Some(constraint) => {
                    format!("query failed: {} (constraint `{constraint}`)", db.message())
                }
                None => format!("query failed: {}", db.message()),
            },
            other => format!("query failed: {other}"),
        };
        Self {
            message,
            sql: sql.to_string(),
            params: params.to_vec(),
            source,
        }
    }

    /// SQL text with parameter literals substituted. For logs only.
    pub fn rendered(&self) -> String {
        render_sql(&self.sql, &self.params)
    }
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    NameResolution(#[from] NameResolutionError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("database connection failed: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("operation cancelled")]
    Cancelled,
}

impl MapError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, MapError::Configuration(_))
    }
}

/// A mapping failure annotated with the repository member that caused it.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{entity}::{member} failed: {source}")]
    Operation {
        entity: &'static str,
        member: &'static str,
        rendered_sql: Option<String>,
        #[source]
        source: MapError,
    },
    #[error("{entity}::{member} affected no rows")]
    NoRowsAffected {
        entity: &'static str,
        member: &'static str,
    },
}

impl RepositoryError {
    pub fn map_error(&self) -> Option<&MapError> {
        match self {
            RepositoryError::Operation { source, .. } => Some(source),
            RepositoryError::NoRowsAffected { .. } => None,
        }
    }
}

pub trait ResultExt<T> {
    fn in_repo(self, entity: &'static str, member: &'static str) -> Result<T, RepositoryError>;
}

impl<T> ResultExt<T> for MapResult<T> {
    fn in_repo(self, entity: &'static str, member: &'static str) -> Result<T, RepositoryError> {
        self.map_err(|source| {
            let rendered_sql = match &source {
                MapError::Query(query) => Some(query.rendered()),
                _ => None,
            };
            warn!(
                entity,
                member,
                sql = rendered_sql.as_deref().unwrap_or(""),
                error = %source,
                "repository operation failed"
            );
            RepositoryError::Operation {
                entity,
                member,
                rendered_sql,
                source,
            }
        })
    }
}

/// Escalate "nothing changed" into a repository error.
pub fn ensure_affected(
    affected: u64,
    entity: &'static str,
    member: &'static str,
) -> Result<u64, RepositoryError> {
    if affected == 0 {
        return Err(RepositoryError::NoRowsAffected { entity, member });
    }
    Ok(affected)
}
