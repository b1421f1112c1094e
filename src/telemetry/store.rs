use crate::config::{self, ConfigError};
use crate::telemetry::parser::CanonicalRecord;
use crate::telemetry::schema;
use chrono::SecondsFormat;
use rusqlite::Connection;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("connecting to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: BoxError,
    },
    #[error("ensuring {} schema: {source}", schema::SYSTEM_LOGS_TABLE)]
    Schema {
        #[source]
        source: BoxError,
    },
    #[error("write failed: {0}")]
    WriteFailed(#[source] BoxError),
}

impl PersistError {
    fn write_failed(e: impl Into<BoxError>) -> Self {
        Self::WriteFailed(e.into())
    }

    fn schema(e: impl Into<BoxError>) -> Self {
        Self::Schema { source: e.into() }
    }
}

/// A parsed `DATABASE_URL`.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreUrl {
    SqliteMemory,
    Sqlite(PathBuf),
    Postgres(String),
}

impl StoreUrl {
    /// Parse a SQLAlchemy-style database URL.
    ///
    /// `sqlite:///logs.db` names `logs.db` relative to the working
    /// directory and `sqlite:////var/lib/logs.db` an absolute path;
    /// `sqlite://` and `sqlite:///:memory:` open a private in-memory
    /// database. A `+driver` suffix on the scheme, as in
    /// `postgresql+psycopg2://`, is accepted and ignored.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        let Some((scheme, rest)) = url.split_once(':') else {
            return Err(ConfigError::InvalidDatabaseUrl(format!(
                "`{url}` has no scheme"
            )));
        };
        let dialect = scheme.split_once('+').map_or(scheme, |(d, _)| d);
        match dialect {
            "sqlite" => Self::sqlite(rest),
            "postgres" | "postgresql" => {
                if !rest.starts_with("//") {
                    return Err(ConfigError::InvalidDatabaseUrl(format!(
                        "{dialect} URL must start with {dialect}://"
                    )));
                }
                Ok(Self::Postgres(format!("{dialect}:{rest}")))
            }
            _ => Err(ConfigError::UnsupportedScheme(scheme.to_string())),
        }
    }

    fn sqlite(rest: &str) -> Result<Self, ConfigError> {
        let path = match rest.strip_prefix("///") {
            Some(path) => path,
            None if rest == "//" || rest == ":memory:" => return Ok(Self::SqliteMemory),
            None if rest.starts_with("//") => {
                return Err(ConfigError::InvalidDatabaseUrl(
                    "sqlite URLs take no host; use sqlite:///relative.db or sqlite:////absolute.db"
                        .into(),
                ))
            }
            // `sqlite:logs.db` shorthand.
            None => rest,
        };
        match path {
            "" if rest.is_empty() => Err(ConfigError::InvalidDatabaseUrl(
                "sqlite URL has no database path".into(),
            )),
            "" | ":memory:" => Ok(Self::SqliteMemory),
            path => Ok(Self::Sqlite(PathBuf::from(
                shellexpand::tilde(path).into_owned(),
            ))),
        }
    }
}

/// Renders the URL with any credentials removed.
impl fmt::Display for StoreUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SqliteMemory => f.write_str("sqlite::memory:"),
            Self::Sqlite(path) => write!(f, "sqlite:///{}", path.display()),
            Self::Postgres(url) => match (url.split_once("://"), url.rfind('@')) {
                (Some((scheme, _)), Some(at)) => write!(f, "{scheme}://***@{}", &url[at + 1..]),
                _ => f.write_str(url),
            },
        }
    }
}

/// A relational sink for canonical records.
///
/// Implementations run each `insert` in its own transaction and leave
/// nothing open on return, whether the write succeeded or not.
pub trait RecordStore: Send {
    /// Create the table if it does not exist. Safe to call repeatedly.
    fn ensure_schema(&mut self) -> Result<(), PersistError>;

    /// Insert one row and return its id.
    fn insert(&mut self, record: &CanonicalRecord) -> Result<i64, PersistError>;

    fn backend(&self) -> &'static str;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(url: &StoreUrl) -> Result<Self, PersistError> {
        let connect_err = |e: BoxError| PersistError::Connect {
            target: url.to_string(),
            source: e,
        };
        let conn = match url {
            StoreUrl::SqliteMemory => Connection::open_in_memory(),
            StoreUrl::Sqlite(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir).map_err(|e| connect_err(e.into()))?;
                }
                Connection::open(path)
            }
            StoreUrl::Postgres(_) => {
                return Err(connect_err("not a sqlite URL".into()));
            }
        }
        .map_err(|e| connect_err(e.into()))?;
        Ok(Self { conn })
    }
}

impl RecordStore for SqliteStore {
    fn ensure_schema(&mut self) -> Result<(), PersistError> {
        self.conn
            .execute_batch(schema::PRAGMAS)
            .map_err(PersistError::schema)?;
        self.conn
            .execute_batch(schema::SYSTEM_LOGS_SQLITE_DDL)
            .map_err(PersistError::schema)
    }

    fn insert(&mut self, record: &CanonicalRecord) -> Result<i64, PersistError> {
        let tx = self
            .conn
            .transaction()
            .map_err(PersistError::write_failed)?;
        let written = tx.execute(
            schema::SQLITE_INSERT,
            rusqlite::params![
                record
                    .collected_at
                    .to_rfc3339_opts(SecondsFormat::Micros, true),
                record.cpu_percent,
                record.memory_percent,
                record.disk_percent,
            ],
        );
        if let Err(e) = written {
            if let Err(rollback) = tx.rollback() {
                tracing::warn!(error = %rollback, "sqlite rollback failed");
            }
            return Err(PersistError::write_failed(e));
        }
        let id = tx.last_insert_rowid();
        // A failed COMMIT drops the transaction, which rolls it back.
        tx.commit().map_err(PersistError::write_failed)?;
        Ok(id)
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

pub struct PostgresStore {
    client: postgres::Client,
}

impl PostgresStore {
    pub fn connect(url: &str) -> Result<Self, PersistError> {
        let client = postgres::Client::connect(url, postgres::NoTls).map_err(|e| {
            PersistError::Connect {
                target: StoreUrl::Postgres(url.to_string()).to_string(),
                source: e.into(),
            }
        })?;
        Ok(Self { client })
    }
}

impl RecordStore for PostgresStore {
    fn ensure_schema(&mut self) -> Result<(), PersistError> {
        self.client
            .batch_execute(schema::SYSTEM_LOGS_POSTGRES_DDL)
            .map_err(PersistError::schema)
    }

    fn insert(&mut self, record: &CanonicalRecord) -> Result<i64, PersistError> {
        let mut tx = self
            .client
            .transaction()
            .map_err(PersistError::write_failed)?;
        let row = match tx.query_one(
            schema::POSTGRES_INSERT,
            &[
                &record.collected_at,
                &record.cpu_percent,
                &record.memory_percent,
                &record.disk_percent,
            ],
        ) {
            Ok(row) => row,
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!(error = %rollback, "postgres rollback failed");
                }
                return Err(PersistError::write_failed(e));
            }
        };
        let id: i64 = row.try_get(0).map_err(PersistError::write_failed)?;
        tx.commit().map_err(PersistError::write_failed)?;
        Ok(id)
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

/// Owns the store connection and writes one record per transaction.
pub struct Persister {
    store: Box<dyn RecordStore>,
}

impl Persister {
    /// Connect to the store named by `DATABASE_URL`.
    pub fn from_env() -> Result<Self, PersistError> {
        let url = config::database_url()?;
        Self::open(&url)
    }

    pub fn open(url: &str) -> Result<Self, PersistError> {
        let url = StoreUrl::parse(url)?;
        tracing::info!(target_store = %url, "connecting to store");
        let store: Box<dyn RecordStore> = match &url {
            StoreUrl::Postgres(raw) => Box::new(PostgresStore::connect(raw)?),
            _ => Box::new(SqliteStore::open(&url)?),
        };
        Self::with_store(store)
    }

    /// Wrap an already-connected store, ensuring its schema first.
    pub fn with_store(mut store: Box<dyn RecordStore>) -> Result<Self, PersistError> {
        store.ensure_schema()?;
        tracing::debug!(backend = store.backend(), "schema ready");
        Ok(Self { store })
    }

    pub fn persist(&mut self, record: &CanonicalRecord) -> Result<i64, PersistError> {
        self.store.insert(record)
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }
}
