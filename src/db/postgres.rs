//! Postgres pools via sqlx
//!
//! Pools are built lazily (`connect_lazy_with`), so building one never does
//! I/O; the first acquire dials the target.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{
    PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode, PgValueFormat,
    PgValueRef,
};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _, TypeInfo, ValueRef};
use tracing::{debug, info};

use super::error::DbError;
use super::pool::{DbConnection, DbPool, PoolSpec, Row};

pub(super) fn build_pool(spec: &PoolSpec) -> Result<Arc<dyn DbPool>, DbError> {
    let mut options = PgConnectOptions::new()
        .host(&spec.target.host)
        .port(spec.target.port)
        .username(&spec.credentials.username)
        .password(&spec.credentials.password)
        .ssl_mode(if spec.ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Disable
        });

    if let Some(database) = &spec.database {
        options = options.database(database);
    }
    if let Some(timeout) = spec.settings.statement_timeout {
        options = options.options([("statement_timeout", timeout.as_millis().to_string())]);
    }

    let pool = PgPoolOptions::new()
        .min_connections(spec.settings.min_connections)
        .max_connections(spec.settings.max_connections)
        .acquire_timeout(spec.settings.connect_timeout)
        .idle_timeout(Some(spec.settings.idle_timeout))
        .connect_lazy_with(options);

    info!(
        "Built Postgres pool for {} -> {} (database: {}, ssl: {}, max: {})",
        spec.db,
        spec.target,
        spec.database.as_deref().unwrap_or("<default>"),
        spec.ssl,
        spec.settings.max_connections
    );

    Ok(Arc::new(PgPoolHandle { pool }))
}

struct PgPoolHandle {
    pool: PgPool,
}

#[async_trait]
impl DbPool for PgPoolHandle {
    async fn acquire(&self) -> Result<Box<dyn DbConnection>, DbError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgConn { conn }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

struct PgConn {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl DbConnection for PgConn {
    async fn query(&mut self, statement: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        let mut query = sqlx::query(statement);
        for param in params {
            query = bind_param(query, param);
        }
        let rows = query.fetch_all(&mut *self.conn).await?;
        rows.iter().map(row_to_json).collect()
    }

    async fn release(self: Box<Self>) {
        // PoolConnection goes back to the pool on drop
        drop(self.conn);
    }
}

fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(f) = n.as_f64() {
                query.bind(f)
            } else {
                query.bind(n.to_string())
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(sqlx::types::Json(other)),
    }
}

fn row_to_json(row: &PgRow) -> Result<Row, DbError> {
    let mut map = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), decode_column(row, idx)?);
    }
    Ok(map)
}

fn get<'r, T>(row: &'r PgRow, idx: usize) -> Result<Option<T>, DbError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    Ok(row.try_get::<Option<T>, _>(idx)?)
}

fn array<'r, T>(row: &'r PgRow, idx: usize) -> Result<Option<Value>, DbError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres> + Into<Value>,
    Vec<Option<T>>: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    Ok(get::<Vec<Option<T>>>(row, idx)?.map(|items| {
        Value::Array(
            items
                .into_iter()
                .map(|item| item.map(Into::into).unwrap_or(Value::Null))
                .collect(),
        )
    }))
}

/// Convert one column to JSON
///
/// NUMERIC comes back as an exact decimal string. A type with no JSON mapping
/// and no text form is an error rather than a null.
fn decode_column(row: &PgRow, idx: usize) -> Result<Value, DbError> {
    let type_name = row.columns()[idx].type_info().name().to_ascii_uppercase();

    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let value = match type_name.as_str() {
        "BOOL" => get::<bool>(row, idx)?.map(Value::Bool),
        "INT2" => get::<i16>(row, idx)?.map(Value::from),
        "INT4" => get::<i32>(row, idx)?.map(Value::from),
        "INT8" => get::<i64>(row, idx)?.map(Value::from),
        "FLOAT4" => get::<f32>(row, idx)?.map(|f| Value::from(f as f64)),
        "FLOAT8" => get::<f64>(row, idx)?.map(Value::from),
        "NUMERIC" => Some(render(raw, idx, &type_name, numeric_to_string)?),
        "UUID" => get::<uuid::Uuid>(row, idx)?.map(|u| Value::String(u.to_string())),
        "INET" | "CIDR" => Some(render(raw, idx, &type_name, inet_to_string)?),
        "JSON" | "JSONB" => get::<Value>(row, idx)?,
        "BYTEA" => get::<Vec<u8>>(row, idx)?.map(|b| Value::String(BASE64.encode(b))),
        "TIMESTAMPTZ" => {
            get::<chrono::DateTime<chrono::Utc>>(row, idx)?.map(|t| Value::String(t.to_rfc3339()))
        }
        "TIMESTAMP" => get::<chrono::NaiveDateTime>(row, idx)?.map(|t| Value::String(t.to_string())),
        "DATE" => get::<chrono::NaiveDate>(row, idx)?.map(|d| Value::String(d.to_string())),
        "TIME" => get::<chrono::NaiveTime>(row, idx)?.map(|t| Value::String(t.to_string())),
        "BOOL[]" => array::<bool>(row, idx)?,
        "INT2[]" => array::<i16>(row, idx)?,
        "INT4[]" => array::<i32>(row, idx)?,
        "INT8[]" => array::<i64>(row, idx)?,
        "FLOAT8[]" => array::<f64>(row, idx)?,
        "TEXT[]" | "VARCHAR[]" | "BPCHAR[]" | "NAME[]" => array::<String>(row, idx)?,
        "UUID[]" => get::<Vec<Option<uuid::Uuid>>>(row, idx)?.map(|items| {
            Value::Array(
                items
                    .into_iter()
                    .map(|u| u.map(|u| Value::String(u.to_string())).unwrap_or(Value::Null))
                    .collect(),
            )
        }),
        _ => match row.try_get::<Option<String>, _>(idx) {
            Ok(s) => s.map(Value::String),
            Err(e) => {
                debug!("Column {} ({}) has no text form: {}", idx, type_name, e);
                return Err(DbError::Query(format!(
                    "Unsupported column type {} in column {}",
                    type_name, idx
                )));
            }
        },
    };

    Ok(value.unwrap_or(Value::Null))
}

/// Text-format values pass through; binary ones go through `decode`
fn render(
    raw: PgValueRef<'_>,
    idx: usize,
    type_name: &str,
    decode: fn(&[u8]) -> Option<String>,
) -> Result<Value, DbError> {
    let malformed = || DbError::Query(format!("Malformed {} value in column {}", type_name, idx));
    let text = match raw.format() {
        PgValueFormat::Text => raw.as_str().ok().map(str::to_string),
        PgValueFormat::Binary => raw.as_bytes().ok().and_then(decode),
    };
    text.map(Value::String).ok_or_else(malformed)
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Render a NUMERIC in Postgres binary format as its exact decimal text
///
/// Layout: ndigits, weight, sign, dscale (16 bits each), then ndigits
/// base-10000 digits. The value is `sum(digit[i] * 10000^(weight - i))`.
fn numeric_to_string(bytes: &[u8]) -> Option<String> {
    let word = |at: usize| -> Option<u16> {
        Some(u16::from_be_bytes([*bytes.get(at)?, *bytes.get(at + 1)?]))
    };
    let ndigits = word(0)? as usize;
    let weight = word(2)? as i16 as i32;
    let sign = word(4)?;
    let dscale = word(6)? as usize;

    match sign {
        NUMERIC_NAN => return Some("NaN".into()),
        NUMERIC_PINF => return Some("Infinity".into()),
        NUMERIC_NINF => return Some("-Infinity".into()),
        _ => {}
    }

    let digits = (0..ndigits)
        .map(|i| word(8 + 2 * i).filter(|d| *d < 10000))
        .collect::<Option<Vec<u16>>>()?;
    let digit = |group: i32| -> u16 {
        usize::try_from(group)
            .ok()
            .and_then(|g| digits.get(g).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG && !digits.iter().all(|d| *d == 0) {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit(0).to_string());
        for group in 1..=weight {
            out.push_str(&format!("{:04}", digit(group)));
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let mut group = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(group)));
            group += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Some(out)
}

const PGSQL_AF_INET: u8 = 2;
const PGSQL_AF_INET6: u8 = 3;

/// Render an INET/CIDR in Postgres binary format as `addr[/bits]`
///
/// Layout: family, bits, is_cidr, address length, then the address bytes.
/// The prefix is omitted for host addresses, as Postgres prints them.
fn inet_to_string(bytes: &[u8]) -> Option<String> {
    let (&family, rest) = bytes.split_first()?;
    let (&bits, rest) = rest.split_first()?;
    let (&is_cidr, rest) = rest.split_first()?;
    let (&len, addr) = rest.split_first()?;

    let (address, max_bits) = match (family, len, addr.len()) {
        (PGSQL_AF_INET, 4, 4) => {
            let octets: [u8; 4] = addr.try_into().ok()?;
            (Ipv4Addr::from(octets).to_string(), 32)
        }
        (PGSQL_AF_INET6, 16, 16) => {
            let octets: [u8; 16] = addr.try_into().ok()?;
            (Ipv6Addr::from(octets).to_string(), 128)
        }
        _ => return None,
    };

    if is_cidr != 0 || bits != max_bits {
        Some(format!("{}/{}", address, bits))
    } else {
        Some(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::config::{Backend, Credentials, LogicalDb, PoolSettings, Target};
    use std::time::Duration;

    fn spec(port: u16) -> PoolSpec {
        let mut settings = PoolSettings::postgres(false);
        settings.connect_timeout = Duration::from_secs(1);
        PoolSpec {
            db: LogicalDb::Main,
            backend: Backend::Postgres,
            target: Target::loopback(port),
            credentials: Credentials::new("app", "secret"),
            database: Some("forms".into()),
            ssl: false,
            settings,
        }
    }

    #[tokio::test]
    async fn test_build_is_lazy() {
        let pool = build_pool(&spec(1)).unwrap();
        assert!(!pool.is_closed());
        pool.close().await;
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn test_acquire_against_dead_target_is_connection_class() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let pool = build_pool(&spec(port)).unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(err.is_connection_class(), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_closed_pool_acquire_is_connection_class() {
        let pool = build_pool(&spec(1)).unwrap();
        pool.close().await;
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, DbError::PoolClosed));
        assert!(err.is_connection_class());
    }

    fn numeric(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(digits.len() as u16).to_be_bytes());
        buf.extend_from_slice(&weight.to_be_bytes());
        buf.extend_from_slice(&sign.to_be_bytes());
        buf.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            buf.extend_from_slice(&d.to_be_bytes());
        }
        buf
    }

    #[test]
    fn test_numeric_renders_exact_decimal_text() {
        assert_eq!(numeric_to_string(&numeric(0, 0, 2, &[12, 5000])).unwrap(), "12.50");
        assert_eq!(numeric_to_string(&numeric(-1, 0, 3, &[10])).unwrap(), "0.001");
        assert_eq!(numeric_to_string(&numeric(1, 0, 0, &[1])).unwrap(), "10000");
        assert_eq!(numeric_to_string(&numeric(0, 0, 0, &[])).unwrap(), "0");
        assert_eq!(
            numeric_to_string(&numeric(2, NUMERIC_NEG, 4, &[1, 2345, 6789, 1200])).unwrap(),
            "-123456789.1200"
        );
        // Beyond f64 precision
        assert_eq!(
            numeric_to_string(&numeric(4, 0, 0, &[9, 9999, 9999, 9999, 9999])).unwrap(),
            "99999999999999999"
        );
        assert_eq!(numeric_to_string(&numeric(0, NUMERIC_NAN, 0, &[])).unwrap(), "NaN");
    }

    #[test]
    fn test_malformed_numeric_is_rejected() {
        assert_eq!(numeric_to_string(&[0, 1]), None);
        // Declares two digits, carries one
        let mut short = numeric(0, 0, 0, &[7]);
        short[1] = 2;
        assert_eq!(numeric_to_string(&short), None);
        // Digit out of base-10000 range
        assert_eq!(numeric_to_string(&numeric(0, 0, 0, &[10000])), None);
    }

    #[test]
    fn test_inet_renders_address_and_prefix() {
        assert_eq!(inet_to_string(&[2, 32, 0, 4, 10, 0, 0, 5]).unwrap(), "10.0.0.5");
        assert_eq!(inet_to_string(&[2, 24, 1, 4, 10, 0, 0, 0]).unwrap(), "10.0.0.0/24");

        let mut v6 = vec![3, 128, 0, 16];
        v6.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        assert_eq!(inet_to_string(&v6).unwrap(), "::1");

        assert_eq!(inet_to_string(&[2, 32, 0, 4, 10, 0]), None);
    }
}
