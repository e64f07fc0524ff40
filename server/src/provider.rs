//! Database providers: one per dialect, each owning a connection pool.
//! `DbConnection` is the `Kind`-plus-pool pairing the query engine and
//! expand engine drive through the [`datastore::expand::QueryExecutor`]
//! trait; unlike the pooled-`Any`-driver approach, each backend keeps its
//! own concrete `sqlx` pool so placeholder binding and column decoding stay
//! first-class per dialect instead of going through a lowest-common-
//! denominator row type.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use datastore::expand::QueryExecutor;
use datastore::row::RawColumn;
use datastore::value::SqlValue;
use datastore::Dialect;
use sqlx::{Column, Row, TypeInfo};

use crate::opt::Opt;

#[derive(Clone)]
pub enum DbConnection {
    #[cfg(feature = "postgres")]
    Postgres(sqlx::PgPool),
    #[cfg(feature = "mysql")]
    MySql(sqlx::MySqlPool),
    #[cfg(feature = "oracle")]
    Oracle(std::sync::Arc<OracleConnection>),
}

#[cfg(feature = "oracle")]
pub struct OracleConnection {
    pub connect_string: String,
    pub username: String,
    pub password: String,
}

impl DbConnection {
    pub async fn connect(opt: &Opt) -> Result<Self> {
        match Dialect::from_driver_name(&opt.driver) {
            #[cfg(feature = "postgres")]
            Dialect::Postgres | Dialect::Default => {
                let uri = format!(
                    "postgres://{}:{}@{}:{}/{}",
                    opt.db_user, opt.db_password, opt.db_host, opt.db_port, opt.db_name
                );
                let mut options = sqlx::postgres::PgPoolOptions::new()
                    .max_lifetime(opt.pool_max_lifetime())
                    .idle_timeout(opt.pool_max_idle_time());
                if opt.pool_max_open > 0 {
                    options = options.max_connections(opt.pool_max_open);
                }
                if opt.pool_max_idle > 0 {
                    options = options.min_connections(opt.pool_max_idle);
                }
                let pool = options
                    .connect(&uri)
                    .await
                    .with_context(|| "connecting to PostgreSQL".to_string())?;
                Ok(DbConnection::Postgres(pool))
            }
            #[cfg(feature = "mysql")]
            Dialect::MySql => {
                let uri = format!(
                    "mysql://{}:{}@{}:{}/{}",
                    opt.db_user, opt.db_password, opt.db_host, opt.db_port, opt.db_name
                );
                let mut options = sqlx::mysql::MySqlPoolOptions::new()
                    .max_lifetime(opt.pool_max_lifetime())
                    .idle_timeout(opt.pool_max_idle_time());
                if opt.pool_max_open > 0 {
                    options = options.max_connections(opt.pool_max_open);
                }
                if opt.pool_max_idle > 0 {
                    options = options.min_connections(opt.pool_max_idle);
                }
                let pool = options
                    .connect(&uri)
                    .await
                    .with_context(|| "connecting to MySQL".to_string())?;
                Ok(DbConnection::MySql(pool))
            }
            #[cfg(feature = "oracle")]
            Dialect::Oracle => Ok(DbConnection::Oracle(std::sync::Arc::new(OracleConnection {
                connect_string: format!("{}:{}/{}", opt.db_host, opt.db_port, opt.db_name),
                username: opt.db_user.clone(),
                password: opt.db_password.clone(),
            }))),
            #[allow(unreachable_patterns)]
            other => Err(anyhow!("driver `{}` is not compiled into this build", other.display_name())),
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            #[cfg(feature = "postgres")]
            DbConnection::Postgres(_) => Dialect::Postgres,
            #[cfg(feature = "mysql")]
            DbConnection::MySql(_) => Dialect::MySql,
            #[cfg(feature = "oracle")]
            DbConnection::Oracle(_) => Dialect::Oracle,
        }
    }

    pub async fn begin_transaction(&self) -> Result<Transaction<'_>> {
        match self {
            #[cfg(feature = "postgres")]
            DbConnection::Postgres(pool) => Ok(Transaction::Postgres(pool.begin().await?)),
            #[cfg(feature = "mysql")]
            DbConnection::MySql(pool) => Ok(Transaction::MySql(pool.begin().await?)),
            #[cfg(feature = "oracle")]
            DbConnection::Oracle(conn) => {
                let conn = std::sync::Arc::clone(conn);
                let tx = tokio::task::spawn_blocking(move || -> Result<oracle::Connection> {
                    let c = oracle::Connection::connect(&conn.username, &conn.password, &conn.connect_string)?;
                    c.set_autocommit(false);
                    Ok(c)
                })
                .await??;
                Ok(Transaction::Oracle(tx))
            }
        }
    }
}

/// A changeset's transaction boundary; one per batch changeset, never
/// shared across tasks, and released on every return path by the caller.
pub enum Transaction<'a> {
    #[cfg(feature = "postgres")]
    Postgres(sqlx::Transaction<'a, sqlx::Postgres>),
    #[cfg(feature = "mysql")]
    MySql(sqlx::Transaction<'a, sqlx::MySql>),
    #[cfg(feature = "oracle")]
    Oracle(oracle::Connection),
}

impl<'a> Transaction<'a> {
    pub async fn commit(self) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            Transaction::Postgres(tx) => Ok(tx.commit().await?),
            #[cfg(feature = "mysql")]
            Transaction::MySql(tx) => Ok(tx.commit().await?),
            #[cfg(feature = "oracle")]
            Transaction::Oracle(conn) => Ok(tokio::task::spawn_blocking(move || conn.commit()).await??),
        }
    }

    pub async fn rollback(self) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            Transaction::Postgres(tx) => Ok(tx.rollback().await?),
            #[cfg(feature = "mysql")]
            Transaction::MySql(tx) => Ok(tx.rollback().await?),
            #[cfg(feature = "oracle")]
            Transaction::Oracle(conn) => Ok(tokio::task::spawn_blocking(move || conn.rollback()).await??),
        }
    }

    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        match self {
            #[cfg(feature = "postgres")]
            Transaction::Postgres(tx) => {
                let mut query = sqlx::query(sql);
                for p in params {
                    query = bind_postgres(query, p);
                }
                Ok(query.execute(&mut **tx).await?.rows_affected())
            }
            #[cfg(feature = "mysql")]
            Transaction::MySql(tx) => {
                let mut query = sqlx::query(sql);
                for p in params {
                    query = bind_mysql(query, p);
                }
                Ok(query.execute(&mut **tx).await?.rows_affected())
            }
            #[cfg(feature = "oracle")]
            Transaction::Oracle(conn) => execute_oracle(conn, sql, params),
        }
    }

    /// Runs a query within this transaction and scans the result rows. Used
    /// by the entity service to read back a just-inserted row (`RETURNING
    /// *` on Postgres, a follow-up `SELECT` by key elsewhere) without
    /// leaving the transaction's read-your-writes boundary.
    pub async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<RawColumn>>> {
        match self {
            #[cfg(feature = "postgres")]
            Transaction::Postgres(tx) => {
                let mut query = sqlx::query(sql);
                for p in params {
                    query = bind_postgres(query, p);
                }
                let rows = query.fetch_all(&mut **tx).await?;
                Ok(rows.iter().map(scan_postgres_row).collect())
            }
            #[cfg(feature = "mysql")]
            Transaction::MySql(tx) => {
                let mut query = sqlx::query(sql);
                for p in params {
                    query = bind_mysql(query, p);
                }
                let rows = query.fetch_all(&mut **tx).await?;
                Ok(rows.iter().map(scan_mysql_row).collect())
            }
            #[cfg(feature = "oracle")]
            Transaction::Oracle(conn) => query_oracle(conn, sql, params),
        }
    }
}

#[async_trait]
impl QueryExecutor for DbConnection {
    async fn fetch_all(&self, sql: &str, params: &[SqlValue]) -> anyhow::Result<Vec<Vec<RawColumn>>> {
        match self {
            #[cfg(feature = "postgres")]
            DbConnection::Postgres(pool) => {
                let mut query = sqlx::query(sql);
                for p in params {
                    query = bind_postgres(query, p);
                }
                let rows = query.fetch_all(pool).await?;
                Ok(rows.iter().map(scan_postgres_row).collect())
            }
            #[cfg(feature = "mysql")]
            DbConnection::MySql(pool) => {
                let mut query = sqlx::query(sql);
                for p in params {
                    query = bind_mysql(query, p);
                }
                let rows = query.fetch_all(pool).await?;
                Ok(rows.iter().map(scan_mysql_row).collect())
            }
            #[cfg(feature = "oracle")]
            DbConnection::Oracle(conn) => {
                let conn = std::sync::Arc::clone(conn);
                let sql = sql.to_string();
                let params = params.to_vec();
                tokio::task::spawn_blocking(move || fetch_oracle(&conn, &sql, &params)).await?
            }
        }
    }
}

#[cfg(feature = "postgres")]
fn bind_postgres<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &'q SqlValue,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        SqlValue::Null => query.bind(None::<i64>),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Text(s) => query.bind(s.as_str()),
        SqlValue::Guid(g) => query.bind(g.to_string()),
        SqlValue::Date(d) => query.bind(d.to_string()),
        SqlValue::Time(t) => query.bind(t.to_string()),
        SqlValue::DateTime(dt) => query.bind(dt.to_string()),
        SqlValue::Duration(d) => query.bind(d.whole_seconds()),
    }
}

#[cfg(feature = "mysql")]
fn bind_mysql<'q>(
    query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    value: &'q SqlValue,
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    match value {
        SqlValue::Null => query.bind(None::<i64>),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Text(s) => query.bind(s.as_str()),
        SqlValue::Guid(g) => query.bind(g.to_string()),
        SqlValue::Date(d) => query.bind(d.to_string()),
        SqlValue::Time(t) => query.bind(t.to_string()),
        SqlValue::DateTime(dt) => query.bind(dt.to_string()),
        SqlValue::Duration(d) => query.bind(d.whole_seconds()),
    }
}

#[cfg(feature = "postgres")]
fn scan_postgres_row(row: &sqlx::postgres::PgRow) -> Vec<RawColumn> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| RawColumn {
            name: col.name().to_string(),
            value: decode_postgres_value(col.type_info().name(), row, i),
        })
        .collect()
}

#[cfg(feature = "postgres")]
fn decode_postgres_value(type_name: &str, row: &sqlx::postgres::PgRow, i: usize) -> SqlValue {
    match type_name.to_ascii_uppercase().as_str() {
        "BOOL" => row.try_get::<Option<bool>, _>(i).ok().flatten().map(SqlValue::Bool),
        "INT2" | "INT4" | "INT8" => row.try_get::<Option<i64>, _>(i).ok().flatten().map(SqlValue::Int),
        "FLOAT4" | "FLOAT8" | "NUMERIC" => row.try_get::<Option<f64>, _>(i).ok().flatten().map(SqlValue::Float),
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(i)
            .ok()
            .flatten()
            .map(|b| SqlValue::Text(String::from_utf8_lossy(&b).into_owned())),
        _ => row.try_get::<Option<String>, _>(i).ok().flatten().map(SqlValue::Text),
    }
    .unwrap_or(SqlValue::Null)
}

#[cfg(feature = "mysql")]
fn scan_mysql_row(row: &sqlx::mysql::MySqlRow) -> Vec<RawColumn> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| RawColumn {
            name: col.name().to_string(),
            value: decode_mysql_value(col.type_info().name(), row, i),
        })
        .collect()
}

#[cfg(feature = "mysql")]
fn decode_mysql_value(type_name: &str, row: &sqlx::mysql::MySqlRow, i: usize) -> SqlValue {
    match type_name.to_ascii_uppercase().as_str() {
        "TINYINT(1)" | "BOOLEAN" => row.try_get::<Option<bool>, _>(i).ok().flatten().map(SqlValue::Bool),
        "TINYINT" | "SMALLINT" | "INT" | "BIGINT" => {
            row.try_get::<Option<i64>, _>(i).ok().flatten().map(SqlValue::Int)
        }
        "FLOAT" | "DOUBLE" | "DECIMAL" => row.try_get::<Option<f64>, _>(i).ok().flatten().map(SqlValue::Float),
        "BLOB" | "VARBINARY" => row
            .try_get::<Option<Vec<u8>>, _>(i)
            .ok()
            .flatten()
            .map(|b| SqlValue::Text(String::from_utf8_lossy(&b).into_owned())),
        _ => row.try_get::<Option<String>, _>(i).ok().flatten().map(SqlValue::Text),
    }
    .unwrap_or(SqlValue::Null)
}

#[cfg(feature = "oracle")]
fn fetch_oracle(conn: &OracleConnection, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<RawColumn>>> {
    let connection = oracle::Connection::connect(&conn.username, &conn.password, &conn.connect_string)?;
    query_oracle(&connection, sql, params)
}

#[cfg(feature = "oracle")]
fn query_oracle(connection: &oracle::Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<RawColumn>>> {
    let bind_values: Vec<Box<dyn oracle::sql_type::ToSql>> = params.iter().map(to_oracle_bind).collect();
    let bind_refs: Vec<&dyn oracle::sql_type::ToSql> = bind_values.iter().map(|b| b.as_ref()).collect();
    let rows = connection.query(sql, &bind_refs)?;
    let column_info = rows.column_info().to_vec();
    let mut out = Vec::new();
    for row_result in rows {
        let row = row_result?;
        let mut cols = Vec::with_capacity(column_info.len());
        for (i, info) in column_info.iter().enumerate() {
            let value = row
                .get::<_, Option<String>>(i)
                .ok()
                .flatten()
                .map(SqlValue::Text)
                .unwrap_or(SqlValue::Null);
            cols.push(RawColumn { name: info.name().to_string(), value });
        }
        out.push(cols);
    }
    Ok(out)
}

#[cfg(feature = "oracle")]
fn execute_oracle(conn: &oracle::Connection, sql: &str, params: &[SqlValue]) -> Result<u64> {
    let bind_values: Vec<Box<dyn oracle::sql_type::ToSql>> = params.iter().map(to_oracle_bind).collect();
    let bind_refs: Vec<&dyn oracle::sql_type::ToSql> = bind_values.iter().map(|b| b.as_ref()).collect();
    let stmt = conn.execute(sql, &bind_refs)?;
    Ok(stmt.row_count()?)
}

#[cfg(feature = "oracle")]
fn to_oracle_bind(value: &SqlValue) -> Box<dyn oracle::sql_type::ToSql> {
    match value {
        SqlValue::Null => Box::new(Option::<String>::None),
        SqlValue::Bool(b) => Box::new(if *b { 1i64 } else { 0i64 }),
        SqlValue::Int(i) => Box::new(*i),
        SqlValue::Float(f) => Box::new(*f),
        // Oracle string-key filters are always parameterized here; never
        // inlined, unlike the shortcut some drivers take for rowid lookups.
        SqlValue::Text(s) => Box::new(s.clone()),
        other => Box::new(other.to_string()),
    }
}

pub fn idle_timeout(opt: &Opt) -> Duration {
    opt.pool_max_idle_time()
}
