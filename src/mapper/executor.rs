//! Connections, transactions, and command execution.
//!
//! The mapper talks to a [`Connection`] only; SQLite and PostgreSQL
//! connections implement it. Every command runs with its parameters bound by
//! the dialect's binder, races an optional cancellation token, and has driver
//! failures wrapped into [`QueryError`] with the SQL and parameters attached.
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Postgres, Sqlite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::binder::{bind_pg, bind_sqlite};
use super::materializer::{decode_pg_row, decode_sqlite_row, Row};
use super::query::Command;
use super::value::Value;
use super::Dialect;
use crate::error::{MapError, MapResult, QueryError};

#[async_trait]
pub trait Connection: Send {
    fn dialect(&self) -> Dialect;

    /// Runs a command and reports the affected row count.
    async fn execute(&mut self, command: &Command) -> Result<u64, sqlx::Error>;

    async fn fetch_all(&mut self, command: &Command) -> Result<Vec<Row>, sqlx::Error>;
}

#[async_trait]
impl Connection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&mut self, command: &Command) -> Result<u64, sqlx::Error> {
        let mut query = sqlx::query::<Sqlite>(&command.sql);
        for value in &command.params {
            query = bind_sqlite(query, value);
        }
        Ok(query.execute(&mut *self).await?.rows_affected())
    }

    async fn fetch_all(&mut self, command: &Command) -> Result<Vec<Row>, sqlx::Error> {
        let mut query = sqlx::query::<Sqlite>(&command.sql);
        for value in &command.params {
            query = bind_sqlite(query, value);
        }
        let mut stream = query.fetch(&mut *self);
        let mut rows = Vec::new();
        while let Some(row) = stream.try_next().await? {
            rows.push(decode_sqlite_row(&row)?);
        }
        Ok(rows)
    }
}

#[async_trait]
impl Connection for PgConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&mut self, command: &Command) -> Result<u64, sqlx::Error> {
        let mut query = sqlx::query::<Postgres>(&command.sql);
        for value in &command.params {
            query = bind_pg(query, value)?;
        }
        Ok(query.execute(&mut *self).await?.rows_affected())
    }

    async fn fetch_all(&mut self, command: &Command) -> Result<Vec<Row>, sqlx::Error> {
        let mut query = sqlx::query::<Postgres>(&command.sql);
        for value in &command.params {
            query = bind_pg(query, value)?;
        }
        let mut stream = query.fetch(&mut *self);
        let mut rows = Vec::new();
        while let Some(row) = stream.try_next().await? {
            rows.push(decode_pg_row(&row)?);
        }
        Ok(rows)
    }
}

/// A connection pool for one of the supported backends.
#[derive(Debug, Clone)]
pub enum Database {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl Database {
    /// Connects by URL scheme: `sqlite:` or `postgres:`/`postgresql:`.
    #[instrument(skip_all)]
    pub async fn connect(url: &str, max_connections: u32) -> MapResult<Self> {
        match Dialect::from_url(url) {
            Some(Dialect::Sqlite) => connect_sqlite(url, max_connections).await,
            Some(Dialect::Postgres) => {
                let pool = PgPoolOptions::new()
                    .max_connections(max_connections.max(1))
                    .connect(url)
                    .await
                    .map_err(MapError::Connect)?;
                Ok(Database::Postgres(pool))
            }
            None => Err(MapError::Connect(sqlx::Error::Configuration(
                format!("unsupported database url `{url}`").into(),
            ))),
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            Database::Sqlite(_) => Dialect::Sqlite,
            Database::Postgres(_) => Dialect::Postgres,
        }
    }

    pub async fn acquire(&self) -> MapResult<PooledConnection> {
        match self {
            Database::Sqlite(pool) => pool
                .acquire()
                .await
                .map(PooledConnection::Sqlite)
                .map_err(MapError::Connect),
            Database::Postgres(pool) => pool
                .acquire()
                .await
                .map(PooledConnection::Postgres)
                .map_err(MapError::Connect),
        }
    }

    pub async fn begin(&self) -> MapResult<Transaction> {
        match self {
            Database::Sqlite(pool) => pool
                .begin()
                .await
                .map(Transaction::Sqlite)
                .map_err(MapError::Connect),
            Database::Postgres(pool) => pool
                .begin()
                .await
                .map(Transaction::Postgres)
                .map_err(MapError::Connect),
        }
    }

    pub async fn close(&self) {
        match self {
            Database::Sqlite(pool) => pool.close().await,
            Database::Postgres(pool) => pool.close().await,
        }
    }
}

async fn connect_sqlite(url: &str, max_connections: u32) -> MapResult<Database> {
    let normalized = prepare_sqlite_url(url);
    let in_memory = normalized.contains(":memory:") || normalized.contains("mode=memory");
    let mut options = SqliteConnectOptions::from_str(&normalized)
        .map_err(MapError::Connect)?
        .create_if_missing(true);
    let mut pool = SqlitePoolOptions::new();
    if in_memory {
        // Every connection to :memory: is its own database.
        pool = pool
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        pool = pool
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30));
    }
    let pool = pool
        .connect_with(options)
        .await
        .map_err(MapError::Connect)?;
    Ok(Database::Sqlite(pool))
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

#[derive(Debug)]
pub enum PooledConnection {
    Sqlite(PoolConnection<Sqlite>),
    Postgres(PoolConnection<Postgres>),
}

impl PooledConnection {
    pub fn as_connection(&mut self) -> &mut dyn Connection {
        match self {
            PooledConnection::Sqlite(conn) => &mut **conn,
            PooledConnection::Postgres(conn) => &mut **conn,
        }
    }
}

/// A caller-owned transaction. Passing one to a mapper operation makes the
/// operation participate in it; nothing is committed until [`commit`](Self::commit).
#[derive(Debug)]
pub enum Transaction {
    Sqlite(sqlx::Transaction<'static, Sqlite>),
    Postgres(sqlx::Transaction<'static, Postgres>),
}

impl Transaction {
    pub fn dialect(&self) -> Dialect {
        match self {
            Transaction::Sqlite(_) => Dialect::Sqlite,
            Transaction::Postgres(_) => Dialect::Postgres,
        }
    }

    pub fn as_connection(&mut self) -> &mut dyn Connection {
        match self {
            Transaction::Sqlite(tx) => &mut **tx,
            Transaction::Postgres(tx) => &mut **tx,
        }
    }

    pub async fn commit(self) -> MapResult<()> {
        let result = match self {
            Transaction::Sqlite(tx) => tx.commit().await,
            Transaction::Postgres(tx) => tx.commit().await,
        };
        result.map_err(|e| QueryError::new("COMMIT", &[], e).into())
    }

    pub async fn rollback(self) -> MapResult<()> {
        let result = match self {
            Transaction::Sqlite(tx) => tx.rollback().await,
            Transaction::Postgres(tx) => tx.rollback().await,
        };
        result.map_err(|e| QueryError::new("ROLLBACK", &[], e).into())
    }
}

/// Either the caller's transaction or a connection checked out for one call.
pub(crate) enum Handle<'t> {
    Borrowed(&'t mut Transaction),
    Pooled(PooledConnection),
}

impl<'t> Handle<'t> {
    pub(crate) async fn open(db: &Database, tx: Option<&'t mut Transaction>) -> MapResult<Self> {
        match tx {
            Some(tx) => Ok(Handle::Borrowed(tx)),
            None => db.acquire().await.map(Handle::Pooled),
        }
    }

    pub(crate) fn connection(&mut self) -> &mut dyn Connection {
        match self {
            Handle::Borrowed(tx) => tx.as_connection(),
            Handle::Pooled(conn) => conn.as_connection(),
        }
    }
}

async fn cancellable<F: Future>(cancel: Option<&CancellationToken>, work: F) -> MapResult<F::Output> {
    let Some(token) = cancel else {
        return Ok(work.await);
    };
    if token.is_cancelled() {
        return Err(MapError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(MapError::Cancelled),
        out = work => Ok(out),
    }
}

fn failed(command: &Command, source: sqlx::Error) -> MapError {
    let err = QueryError::new(&command.sql, &command.params, source);
    warn!(sql = %err.rendered(), error = %err, "command failed");
    err.into()
}

pub(crate) async fn execute(
    conn: &mut dyn Connection,
    command: &Command,
    cancel: Option<&CancellationToken>,
) -> MapResult<u64> {
    debug!(sql = %command.sql, params = command.params.len(), "execute");
    let affected = cancellable(cancel, conn.execute(command))
        .await?
        .map_err(|e| failed(command, e))?;
    debug!(affected, "executed");
    Ok(affected)
}

pub(crate) async fn fetch(
    conn: &mut dyn Connection,
    command: &Command,
    cancel: Option<&CancellationToken>,
) -> MapResult<Vec<Row>> {
    debug!(sql = %command.sql, params = command.params.len(), "fetch");
    let rows = cancellable(cancel, conn.fetch_all(command))
        .await?
        .map_err(|e| failed(command, e))?;
    debug!(rows = rows.len(), "fetched");
    Ok(rows)
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$(\d+)").expect("valid regex"));

/// Substitutes `$n` placeholders with SQL literals of the bound values.
/// Meant for logs and error reports, never for execution.
pub fn render_sql(sql: &str, params: &[Value]) -> String {
    PLACEHOLDER
        .replace_all(sql, |caps: &Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|idx| params.get(idx))
                .map(Value::sql_literal)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::value::ColumnType;

    #[test]
    fn render_substitutes_literals() {
        let sql = render_sql(
            "SELECT * FROM \"t\" WHERE \"a\" = $1 AND \"b\" = $2 AND \"c\" = $10",
            &[Value::Text("o'k".into()), Value::Null(ColumnType::Int)],
        );
        assert_eq!(
            sql,
            "SELECT * FROM \"t\" WHERE \"a\" = 'o''k' AND \"b\" = NULL AND \"c\" = $10"
        );
    }

    #[test]
    fn sqlite_url_prepared() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}/nested/app.db?mode=rwc", dir.path().display());
        let prepared = prepare_sqlite_url(&url);
        assert!(prepared.starts_with("sqlite://"));
        assert!(prepared.ends_with("/nested/app.db?mode=rwc"));
        assert!(dir.path().join("nested").is_dir());
    }

    #[tokio::test]
    async fn memory_database_executes_and_fetches() {
        let db = Database::connect("sqlite::memory:", 4).await.unwrap();
        assert_eq!(db.dialect(), Dialect::Sqlite);
        let mut handle = Handle::open(&db, None).await.unwrap();
        let conn = handle.connection();
        execute(
            conn,
            &Command::new("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", vec![]),
            None,
        )
        .await
        .unwrap();
        let affected = execute(
            conn,
            &Command::new(
                "INSERT INTO t (id, name) VALUES ($1, $2), ($3, $4)",
                vec![
                    Value::BigInt(1),
                    Value::Text("a".into()),
                    Value::BigInt(2),
                    Value::Null(ColumnType::Text),
                ],
            ),
            None,
        )
        .await
        .unwrap();
        assert_eq!(affected, 2);

        let rows = fetch(
            conn,
            &Command::new("SELECT id, name FROM t ORDER BY id", vec![]),
            None,
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("name"), Some(&Value::Text("a".into())));
        assert!(rows[1].get("name").unwrap().is_null());
    }

    #[tokio::test]
    async fn failures_carry_sql_and_params() {
        let db = Database::connect("sqlite::memory:", 1).await.unwrap();
        let mut handle = Handle::open(&db, None).await.unwrap();
        let err = execute(
            handle.connection(),
            &Command::new("DELETE FROM missing WHERE id = $1", vec![Value::BigInt(3)]),
            None,
        )
        .await
        .unwrap_err();
        match err {
            MapError::Query(q) => {
                assert_eq!(q.params, vec![Value::BigInt(3)]);
                assert_eq!(q.rendered(), "DELETE FROM missing WHERE id = 3");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_running() {
        let db = Database::connect("sqlite::memory:", 1).await.unwrap();
        let mut handle = Handle::open(&db, None).await.unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = execute(
            handle.connection(),
            &Command::new("SELECT 1", vec![]),
            Some(&token),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MapError::Cancelled));
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let err = Database::connect("mysql://localhost/db", 1).await.unwrap_err();
        assert!(matches!(err, MapError::Connect(_)));
    }
}
