// ABOUTME: SQL Server connection plumbing shared by every engine component
// ABOUTME: Connect-with-retry, dynamic value binding, identifier quoting, server error codes

use anyhow::{Context, Result};
use std::borrow::Cow;
use std::time::Duration;
use tiberius::{Client, ColumnData, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

/// A connected SQL Server session over the tokio compat layer.
pub type MssqlClient = Client<Compat<TcpStream>>;

/// Foreign-key constraint violation.
pub const ERR_FK_VIOLATION: u32 = 547;
/// Duplicate key in a unique or primary-key index.
pub const ERR_DUPLICATE_KEY: u32 = 2627;
/// Operand type clash (e.g. nvarchar null bound against an image column).
pub const ERR_TYPE_CLASH: u32 = 206;

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Connect using an ADO.NET style connection string, retrying transient
/// failures a few times before giving up.
pub async fn connect_with_retry(connection_string: &str) -> Result<MssqlClient> {
    let mut last_err = None;

    for attempt in 1..=CONNECT_ATTEMPTS {
        match connect(connection_string).await {
            Ok(client) => return Ok(client),
            Err(e) => {
                tracing::warn!(
                    "Connection attempt {}/{} to {} failed: {}",
                    attempt,
                    CONNECT_ATTEMPTS,
                    redact_connection_string(connection_string),
                    e
                );
                last_err = Some(e);
                if attempt < CONNECT_ATTEMPTS {
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("No connection attempt was made")))
}

async fn connect(connection_string: &str) -> Result<MssqlClient> {
    let config = tiberius::Config::from_ado_string(connection_string)
        .context("Invalid connection string")?;

    let tcp = TcpStream::connect(config.get_addr())
        .await
        .with_context(|| format!("Failed to reach {}", config.get_addr()))?;
    tcp.set_nodelay(true).ok();

    let client = Client::connect(config, tcp.compat_write())
        .await
        .context("Failed to authenticate with SQL Server")?;

    Ok(client)
}

/// Redact the password segment of a connection string before it hits a log line.
pub fn redact_connection_string(connection_string: &str) -> String {
    let lower = connection_string.to_ascii_lowercase();
    if let Some(start) = lower.find("password=") {
        let after = &connection_string[start..];
        match after.find(';') {
            Some(end) => format!(
                "{}Password=***{}",
                &connection_string[..start],
                &after[end..]
            ),
            None => format!("{}Password=***", &connection_string[..start]),
        }
    } else {
        connection_string.to_string()
    }
}

/// Quote an identifier with brackets, escaping embedded closing brackets.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Quote a `schema.table` pair.
pub fn quote_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Extract the server error number from an error chain, if the failure was a
/// SQL Server token error (as opposed to an I/O or protocol failure).
pub fn server_error_code(err: &anyhow::Error) -> Option<u32> {
    err.downcast_ref::<tiberius::error::Error>()
        .and_then(|e| match e {
            tiberius::error::Error::Server(token) => Some(token.code()),
            _ => None,
        })
}

/// Run a database future under the configured command timeout.
/// A zero/absent timeout leaves the driver default in place.
pub async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) if !limit.is_zero() => tokio::time::timeout(limit, fut)
            .await
            .context("Query exceeded the configured timeout")?,
        _ => fut.await,
    }
}

/// A dynamically typed column value, sufficient to carry the server's scalar
/// and binary types between the fetcher and the applier.
///
/// Values are bound as typed TDS parameters, never interpolated into SQL text.
/// Date and time values are bound as ISO 8601 strings; SQL Server performs the
/// implicit conversion on its side.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bit(bool),
    TinyInt(u8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Real(f32),
    Float(f64),
    NVarChar(String),
    Binary(Vec<u8>),
    Guid(uuid::Uuid),
    DateTime(chrono::NaiveDateTime),
    Date(chrono::NaiveDate),
    Time(chrono::NaiveTime),
}

impl tiberius::ToSql for SqlValue {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            SqlValue::Null => ColumnData::String(None),
            SqlValue::Bit(b) => ColumnData::Bit(Some(*b)),
            SqlValue::TinyInt(n) => ColumnData::U8(Some(*n)),
            SqlValue::SmallInt(n) => ColumnData::I16(Some(*n)),
            SqlValue::Int(n) => ColumnData::I32(Some(*n)),
            SqlValue::BigInt(n) => ColumnData::I64(Some(*n)),
            SqlValue::Real(n) => ColumnData::F32(Some(*n)),
            SqlValue::Float(n) => ColumnData::F64(Some(*n)),
            SqlValue::NVarChar(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
            SqlValue::Binary(b) => ColumnData::Binary(Some(Cow::Borrowed(b.as_slice()))),
            SqlValue::Guid(u) => ColumnData::Guid(Some(*u)),
            SqlValue::DateTime(dt) => ColumnData::String(Some(Cow::Owned(
                dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            ))),
            SqlValue::Date(d) => {
                ColumnData::String(Some(Cow::Owned(d.format("%Y-%m-%d").to_string())))
            }
            SqlValue::Time(t) => {
                ColumnData::String(Some(Cow::Owned(t.format("%H:%M:%S%.f").to_string())))
            }
        }
    }
}

impl SqlValue {
    /// Read a column value from a row without knowing the column type up
    /// front. Probes typed accessors in order of likelihood; a NULL of any
    /// type falls through to `Null`.
    pub fn from_row(row: &Row, idx: usize) -> SqlValue {
        if let Ok(Some(v)) = row.try_get::<bool, _>(idx) {
            return SqlValue::Bit(v);
        }
        if let Ok(Some(v)) = row.try_get::<u8, _>(idx) {
            return SqlValue::TinyInt(v);
        }
        if let Ok(Some(v)) = row.try_get::<i16, _>(idx) {
            return SqlValue::SmallInt(v);
        }
        if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
            return SqlValue::Int(v);
        }
        if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
            return SqlValue::BigInt(v);
        }
        if let Ok(Some(v)) = row.try_get::<f32, _>(idx) {
            return SqlValue::Real(v);
        }
        if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
            return SqlValue::Float(v);
        }
        if let Ok(Some(v)) = row.try_get::<&str, _>(idx) {
            return SqlValue::NVarChar(v.to_string());
        }
        if let Ok(Some(v)) = row.try_get::<uuid::Uuid, _>(idx) {
            return SqlValue::Guid(v);
        }
        if let Ok(Some(v)) = row.try_get::<chrono::NaiveDateTime, _>(idx) {
            return SqlValue::DateTime(v);
        }
        if let Ok(Some(v)) = row.try_get::<chrono::NaiveDate, _>(idx) {
            return SqlValue::Date(v);
        }
        if let Ok(Some(v)) = row.try_get::<chrono::NaiveTime, _>(idx) {
            return SqlValue::Time(v);
        }
        if let Ok(Some(v)) = row.try_get::<&[u8], _>(idx) {
            return SqlValue::Binary(v.to_vec());
        }
        SqlValue::Null
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// Build a parameter slice from owned values for a driver call.
/// The values must outlive the query execution since the slice borrows them.
pub fn param_refs(values: &[SqlValue]) -> Vec<&dyn tiberius::ToSql> {
    values.iter().map(|v| v as &dyn tiberius::ToSql).collect()
}
