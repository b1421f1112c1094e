//! Periodic host utilization sampler.
//!
//! Each tick collects CPU, memory and disk usage, validates the sample and
//! appends it to a SQLite or PostgreSQL `system_logs` table in its own
//! transaction. A failed tick is logged and skipped; only configuration
//! errors at startup are fatal.

pub mod config;
pub mod telemetry;
