use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use thiserror::Error;

/// One reading of host utilization, as produced by the collector.
///
/// The timestamp is kept as the RFC 3339 text it was rendered to at
/// collection time; the parser turns it into a typed value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RawSample {
    #[serde(rename = "timestamp")]
    pub collected_at: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

/// Utilization percentages read in a single pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("{metric} metrics unavailable: {reason}")]
    Unavailable {
        metric: &'static str,
        reason: String,
    },
    #[error("no mounted filesystem at {}", .0.display())]
    MountNotFound(PathBuf),
}

/// Provider of raw utilization numbers.
pub trait MetricsSource: Send {
    fn snapshot(&mut self) -> Result<UsageSnapshot, CollectionError>;
}

/// `MetricsSource` backed by `sysinfo` for CPU and memory, and by the
/// filesystem statistics of `mount` for disk.
pub struct SysinfoSource {
    system: System,
    #[cfg(not(unix))]
    disks: sysinfo::Disks,
    mount: PathBuf,
}

impl SysinfoSource {
    pub fn new(mount: impl Into<PathBuf>) -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
                .with_memory(MemoryRefreshKind::nothing().with_ram()),
        );
        // Baseline for CPU usage; the first delta is otherwise always 0.
        system.refresh_cpu_usage();
        Self {
            system,
            #[cfg(not(unix))]
            disks: sysinfo::Disks::new_with_refreshed_list(),
            mount: mount.into(),
        }
    }

    /// Usage of the filesystem holding `mount`, computed the way `df` does:
    /// blocks reserved for root count as neither used nor available.
    #[cfg(unix)]
    fn disk_percent(&mut self) -> Result<f64, CollectionError> {
        let stat = nix::sys::statvfs::statvfs(self.mount.as_path()).map_err(|errno| {
            CollectionError::Unavailable {
                metric: "disk",
                reason: format!("statvfs {}: {errno}", self.mount.display()),
            }
        })?;
        let used = u64::from(stat.blocks()).saturating_sub(u64::from(stat.blocks_free()));
        let usable = used + u64::from(stat.blocks_available());
        if usable == 0 {
            return Err(CollectionError::Unavailable {
                metric: "disk",
                reason: format!("{} reports zero capacity", self.mount.display()),
            });
        }
        Ok(percent(used, usable))
    }

    #[cfg(not(unix))]
    fn disk_percent(&mut self) -> Result<f64, CollectionError> {
        self.disks.refresh(true);
        let disk = self
            .disks
            .list()
            .iter()
            .filter(|d| self.mount.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or_else(|| CollectionError::MountNotFound(self.mount.clone()))?;
        let total = disk.total_space();
        if total == 0 {
            return Err(CollectionError::Unavailable {
                metric: "disk",
                reason: format!("{} reports zero capacity", self.mount.display()),
            });
        }
        let used = total.saturating_sub(disk.available_space());
        Ok(percent(used, total))
    }
}

impl MetricsSource for SysinfoSource {
    fn snapshot(&mut self) -> Result<UsageSnapshot, CollectionError> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());

        let cpu = f64::from(self.system.global_cpu_usage());
        if !cpu.is_finite() {
            return Err(CollectionError::Unavailable {
                metric: "cpu",
                reason: format!("non-finite usage {cpu}"),
            });
        }

        let total = self.system.total_memory();
        if total == 0 {
            return Err(CollectionError::Unavailable {
                metric: "memory",
                reason: "total memory reported as zero".into(),
            });
        }
        let used = total.saturating_sub(self.system.available_memory());

        Ok(UsageSnapshot {
            cpu_percent: round1(cpu),
            memory_percent: percent(used, total),
            disk_percent: self.disk_percent()?,
        })
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    round1(part as f64 / whole as f64 * 100.0)
}

fn round1(pct: f64) -> f64 {
    (pct * 10.0).round() / 10.0
}

/// Renders the collection time of a sample.
pub type Clock = Box<dyn FnMut() -> String + Send>;

fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Samples the host and stamps each reading with the collection time.
pub struct Collector {
    source: Box<dyn MetricsSource>,
    clock: Clock,
}

impl Collector {
    pub fn new(source: Box<dyn MetricsSource>) -> Self {
        Self::with_clock(source, Box::new(utc_now))
    }

    /// Collector whose samples are stamped by `clock` instead of the
    /// current UTC time.
    pub fn with_clock(source: Box<dyn MetricsSource>, clock: Clock) -> Self {
        Self { source, clock }
    }

    /// Collector over the real host, sampling the filesystem that holds `mount`.
    pub fn system(mount: &Path) -> Self {
        Self::new(Box::new(SysinfoSource::new(mount)))
    }

    /// Take one sample. All three readings come from the same call.
    pub fn collect(&mut self) -> Result<RawSample, CollectionError> {
        let usage = self.source.snapshot()?;
        let sample = RawSample {
            collected_at: (self.clock)(),
            cpu_percent: usage.cpu_percent,
            memory_percent: usage.memory_percent,
            disk_percent: usage.disk_percent,
        };
        tracing::info!(
            timestamp = %sample.collected_at,
            cpu_percent = sample.cpu_percent,
            memory_percent = sample.memory_percent,
            disk_percent = sample.disk_percent,
            "collected system sample"
        );
        Ok(sample)
    }
}
