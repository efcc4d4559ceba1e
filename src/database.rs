use crate::config::DatabaseSettings;
use crate::models::{Column, ColumnData, TimeSeriesTable, TIME_COLUMN};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use log::{debug, error, info, warn};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls, Row};

const ENCRYPTION_PREFIX: &str = "enc:v1:";
const ENCRYPTION_IV_LENGTH: usize = 12;
const DATABASE_KEY_ENV_VAR: &str = "DATABASE_KEY";

/// Read-only access to the feature table.
pub struct Database {
    client: Client,
    schema: String,
    table: String,
}

impl Database {
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        let (client, connection) = match &settings.url {
            Some(url) => tokio_postgres::connect(url, NoTls)
                .await
                .context("failed to connect to PostgreSQL using DATABASE_URL")?,
            None => {
                let password = decrypt_database_value(&settings.password)
                    .context("failed to decrypt DB_PASSWORD")?;
                let mut config = tokio_postgres::Config::new();
                config
                    .host(&settings.host)
                    .port(settings.port)
                    .dbname(&settings.name)
                    .user(&settings.user);
                if !password.is_empty() {
                    config.password(password);
                }
                config.connect(NoTls).await.with_context(|| {
                    format!(
                        "failed to connect to PostgreSQL at {}:{}/{}",
                        settings.host, settings.port, settings.name
                    )
                })?
            }
        };

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self {
            client,
            schema: settings.schema.clone(),
            table: settings.table.clone(),
        })
    }

    fn qualified_table(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }

    /// Earliest and latest timestamps in the table, or `None` when it is empty.
    pub async fn get_min_max_time(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let query = format!(
            "SELECT MIN(\"{col}\"), MAX(\"{col}\") FROM {table};",
            col = TIME_COLUMN,
            table = self.qualified_table()
        );
        let row = self
            .client
            .query_one(query.as_str(), &[])
            .await
            .with_context(|| format!("failed to query time range of {}", self.qualified_table()))?;
        let min = timestamp_at(&row, 0)?;
        let max = timestamp_at(&row, 1)?;
        Ok(min.zip(max))
    }

    /// Rows with `start <= date_time <= stop`; either bound may be open.
    pub async fn get_range(
        &self,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
    ) -> Result<TimeSeriesTable> {
        let query = range_query(&self.qualified_table(), start.is_some(), stop.is_some());
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        if let Some(start) = start.as_ref() {
            params.push(start);
        }
        if let Some(stop) = stop.as_ref() {
            params.push(stop);
        }
        debug!("Running {}", query);

        let rows = self
            .client
            .query(query.as_str(), &params)
            .await
            .with_context(|| format!("failed to read rows from {}", self.qualified_table()))?;
        let table = rows_to_table(&rows)?;
        info!(
            "Loaded {} rows from {} between {:?} and {:?}",
            table.len(),
            self.qualified_table(),
            start,
            stop
        );
        Ok(table)
    }
}

/// Connects, reads the table's time range and disconnects.
pub async fn fetch_min_max_time(
    settings: &DatabaseSettings,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    let db = Database::connect(settings).await?;
    db.get_min_max_time().await
}

/// Connects, reads one time range and disconnects.
pub async fn fetch_range(
    settings: &DatabaseSettings,
    start: Option<DateTime<Utc>>,
    stop: Option<DateTime<Utc>>,
) -> Result<TimeSeriesTable> {
    let db = Database::connect(settings).await?;
    db.get_range(start, stop).await
}

fn range_query(table: &str, has_start: bool, has_stop: bool) -> String {
    let mut conditions = Vec::new();
    if has_start {
        conditions.push(format!(
            "\"{}\" >= ${}::timestamptz",
            TIME_COLUMN,
            conditions.len() + 1
        ));
    }
    if has_stop {
        conditions.push(format!(
            "\"{}\" <= ${}::timestamptz",
            TIME_COLUMN,
            conditions.len() + 1
        ));
    }
    let filter = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    format!(
        "SELECT * FROM {}{} ORDER BY \"{}\";",
        table, filter, TIME_COLUMN
    )
}

fn timestamp_at(row: &Row, idx: usize) -> Result<Option<DateTime<Utc>>> {
    let column_type = row
        .columns()
        .get(idx)
        .map(|column| column.type_().clone())
        .ok_or_else(|| anyhow!("column {} missing from result", idx))?;
    let value = if column_type == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx)?
    } else if column_type == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|value| value.and_utc())
    } else if column_type == Type::DATE {
        row.try_get::<_, Option<NaiveDate>>(idx)?
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|value| value.and_utc())
    } else {
        return Err(anyhow!(
            "column {} has type {}, expected a timestamp",
            TIME_COLUMN,
            column_type
        ));
    };
    Ok(value)
}

enum ColumnReader {
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Bool,
    Text,
}

impl ColumnReader {
    fn for_type(column_type: &Type) -> Option<Self> {
        match *column_type {
            Type::INT2 => Some(Self::Int2),
            Type::INT4 => Some(Self::Int4),
            Type::INT8 => Some(Self::Int8),
            Type::FLOAT4 => Some(Self::Float4),
            Type::FLOAT8 => Some(Self::Float8),
            Type::BOOL => Some(Self::Bool),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => Some(Self::Text),
            _ => None,
        }
    }

    fn empty(&self, capacity: usize) -> ColumnData {
        match self {
            Self::Bool | Self::Text => ColumnData::Categorical(Vec::with_capacity(capacity)),
            _ => ColumnData::Numeric(Vec::with_capacity(capacity)),
        }
    }

    fn push(&self, row: &Row, idx: usize, data: &mut ColumnData) -> Result<()> {
        match (self, data) {
            (Self::Int2, ColumnData::Numeric(values)) => {
                values.push(row.try_get::<_, Option<i16>>(idx)?.map(f64::from))
            }
            (Self::Int4, ColumnData::Numeric(values)) => {
                values.push(row.try_get::<_, Option<i32>>(idx)?.map(f64::from))
            }
            (Self::Int8, ColumnData::Numeric(values)) => {
                values.push(row.try_get::<_, Option<i64>>(idx)?.map(|v| v as f64))
            }
            (Self::Float4, ColumnData::Numeric(values)) => {
                values.push(present(row.try_get::<_, Option<f32>>(idx)?.map(f64::from)))
            }
            (Self::Float8, ColumnData::Numeric(values)) => {
                values.push(present(row.try_get::<_, Option<f64>>(idx)?))
            }
            (Self::Bool, ColumnData::Categorical(values)) => values.push(
                row.try_get::<_, Option<bool>>(idx)?
                    .map(|flag| (if flag { "True" } else { "False" }).to_string()),
            ),
            (Self::Text, ColumnData::Categorical(values)) => {
                values.push(row.try_get::<_, Option<String>>(idx)?)
            }
            _ => return Err(anyhow!("column reader does not match column storage")),
        }
        Ok(())
    }
}

// PostgreSQL 'NaN' doubles are gaps, like empty CSV cells.
fn present(value: Option<f64>) -> Option<f64> {
    value.filter(|v| !v.is_nan())
}

fn rows_to_table(rows: &[Row]) -> Result<TimeSeriesTable> {
    let Some(first) = rows.first() else {
        return Ok(TimeSeriesTable::default());
    };

    let mut time_idx = None;
    let mut readers = Vec::new();
    for (idx, column) in first.columns().iter().enumerate() {
        if column.name() == TIME_COLUMN {
            time_idx = Some(idx);
            continue;
        }
        match ColumnReader::for_type(column.type_()) {
            Some(reader) => {
                let data = reader.empty(rows.len());
                readers.push((idx, column.name().to_string(), reader, data));
            }
            None => warn!(
                "Skipping column {} with unsupported type {}",
                column.name(),
                column.type_()
            ),
        }
    }
    let time_idx =
        time_idx.ok_or_else(|| anyhow!("table has no '{}' column", TIME_COLUMN))?;

    let mut index = Vec::with_capacity(rows.len());
    for row in rows {
        let timestamp = timestamp_at(row, time_idx)?
            .ok_or_else(|| anyhow!("row with NULL {} in table", TIME_COLUMN))?;
        index.push(timestamp);
        for (idx, name, reader, data) in readers.iter_mut() {
            reader
                .push(row, *idx, data)
                .with_context(|| format!("failed to read column {}", name))?;
        }
    }

    let columns = readers
        .into_iter()
        .map(|(_, name, _, data)| Column { name, data })
        .collect();
    TimeSeriesTable::new(index, columns)
}

/// Decrypts `enc:v1:<iv>:<data>:<tag>` values; anything else is returned as is.
pub fn decrypt_database_value(value: &str) -> Result<String> {
    if value.is_empty() || !value.starts_with(ENCRYPTION_PREFIX) {
        return Ok(value.to_string());
    }

    let key = load_database_key()?;
    let payload = value
        .strip_prefix(ENCRYPTION_PREFIX)
        .ok_or_else(|| anyhow!("Encrypted value has an invalid format."))?;
    let parts: Vec<&str> = payload.split(':').collect();
    if parts.len() != 3 {
        return Err(anyhow!("Encrypted value has an invalid format."));
    }

    let iv = BASE64_STANDARD
        .decode(parts[0])
        .map_err(|_| anyhow!("Encrypted value payload is invalid."))?;
    let data = BASE64_STANDARD
        .decode(parts[1])
        .map_err(|_| anyhow!("Encrypted value payload is invalid."))?;
    let tag = BASE64_STANDARD
        .decode(parts[2])
        .map_err(|_| anyhow!("Encrypted value payload is invalid."))?;

    if iv.len() != ENCRYPTION_IV_LENGTH || tag.is_empty() {
        return Err(anyhow!("Encrypted value payload is invalid."));
    }

    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|_| anyhow!("Failed to initialize cipher."))?;
    let nonce = Nonce::from_slice(&iv);
    let mut encrypted = Vec::with_capacity(data.len() + tag.len());
    encrypted.extend_from_slice(&data);
    encrypted.extend_from_slice(&tag);
    let plaintext = cipher
        .decrypt(nonce, encrypted.as_ref())
        .map_err(|_| anyhow!("Failed to decrypt encrypted value."))?;

    String::from_utf8(plaintext).context("Decrypted value is not valid UTF-8.")
}

fn load_database_key() -> Result<[u8; 32]> {
    let raw = std::env::var(DATABASE_KEY_ENV_VAR).unwrap_or_default();
    parse_database_key(&raw)
}

fn parse_database_key(raw: &str) -> Result<[u8; 32]> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow!(
            "{} is required to decrypt DB_PASSWORD. Generate one with \"openssl rand -hex 32\".",
            DATABASE_KEY_ENV_VAR
        ));
    }

    if trimmed.len() == 64 && trimmed.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        let decoded = hex::decode(trimmed).map_err(|_| invalid_database_key_error(0))?;
        let key: [u8; 32] = decoded
            .try_into()
            .map_err(|decoded: Vec<u8>| invalid_database_key_error(decoded.len()))?;
        return Ok(key);
    }

    let decoded = BASE64_STANDARD.decode(trimmed).unwrap_or_default();
    let key: [u8; 32] = decoded
        .try_into()
        .map_err(|decoded: Vec<u8>| invalid_database_key_error(decoded.len()))?;
    Ok(key)
}

fn invalid_database_key_error(key_length: usize) -> anyhow::Error {
    anyhow!(
        "{} must be a 32-byte key encoded as 64 hex characters or base64. Key length {}",
        DATABASE_KEY_ENV_VAR,
        key_length
    )
}
