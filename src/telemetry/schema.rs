// DDL constants for the system_logs table, one per supported dialect.

/// Name of the append-only table every sample lands in.
pub const SYSTEM_LOGS_TABLE: &str = "system_logs";

pub const SYSTEM_LOGS_SQLITE_DDL: &str = "\
CREATE TABLE IF NOT EXISTS system_logs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp       TEXT    NOT NULL,
    cpu_percent     REAL    NOT NULL,
    memory_percent  REAL    NOT NULL,
    disk_percent    REAL    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_system_logs_timestamp ON system_logs(timestamp);
";

pub const SYSTEM_LOGS_POSTGRES_DDL: &str = "\
CREATE TABLE IF NOT EXISTS system_logs (
    id              BIGSERIAL        PRIMARY KEY,
    timestamp       TIMESTAMPTZ      NOT NULL,
    cpu_percent     DOUBLE PRECISION NOT NULL,
    memory_percent  DOUBLE PRECISION NOT NULL,
    disk_percent    DOUBLE PRECISION NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_system_logs_timestamp ON system_logs(timestamp);
";

pub const SQLITE_INSERT: &str = "\
INSERT INTO system_logs (timestamp, cpu_percent, memory_percent, disk_percent)
VALUES (?1, ?2, ?3, ?4)";

pub const POSTGRES_INSERT: &str = "\
INSERT INTO system_logs (timestamp, cpu_percent, memory_percent, disk_percent)
VALUES ($1, $2, $3, $4)
RETURNING id";

pub const PRAGMAS: &str = "\
PRAGMA journal_mode = WAL;
PRAGMA synchronous  = NORMAL;
PRAGMA busy_timeout = 5000;
PRAGMA temp_store   = MEMORY;
";
