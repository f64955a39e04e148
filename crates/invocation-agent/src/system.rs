//! Host and process statistics attached to each report.
//!
//! Statistics are only read when a report is finalised, never during the
//! handler's run. [`ProcSystemReader`] reads them from `/proc`; the root is
//! configurable so fixtures can stand in for a real kernel.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

const DEFAULT_PROC_ROOT: &str = "/proc";
const DEFAULT_TMP_PATH: &str = "/tmp";
const MIB: f64 = 1024.0 * 1024.0;
// Clock ticks are reported in USER_HZ, which is 100 on Lambda hosts.
const MS_PER_TICK: u64 = 10;

/// Cumulative CPU times for one logical CPU, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuTimes {
    pub idle: u64,
    pub irq: u64,
    pub nice: u64,
    pub sys: u64,
    pub user: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total: u64,
    pub free: u64,
}

/// Fields of `/proc/self/stat`, in clock ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcStat {
    pub utime: u64,
    pub stime: u64,
    pub cutime: u64,
    pub cstime: u64,
}

/// Fields of `/proc/self/status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcStatus {
    #[serde(rename = "VmRSS")]
    pub vm_rss: u64,
    #[serde(rename = "Threads")]
    pub threads: u64,
    #[serde(rename = "FDSize")]
    pub fd_size: u64,
}

/// Usage of the writable scratch filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DiskStats {
    #[serde(rename = "totalMiB")]
    pub total_mib: f64,
    #[serde(rename = "usedMiB")]
    pub used_mib: f64,
    #[serde(rename = "usedPercentage")]
    pub used_percentage: f64,
}

impl DiskStats {
    /// Computes usage from a block size, total block count and free block count.
    pub fn from_blocks(block_size: f64, blocks: f64, available: f64) -> Self {
        let total_mib = block_size * blocks / MIB;
        let used_mib = block_size * (blocks - available) / MIB;
        let used_percentage = if total_mib > 0.0 {
            used_mib / total_mib * 100.0
        } else {
            0.0
        };

        Self {
            total_mib,
            used_mib,
            used_percentage,
        }
    }
}

/// Everything the reader knows at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemSnapshot {
    pub boot_id: String,
    pub hostname: String,
    pub memory: Option<MemoryStats>,
    pub cpus: Vec<CpuTimes>,
    pub stat: Option<ProcStat>,
    pub status: Option<ProcStatus>,
    pub disk: Option<DiskStats>,
}

/// Source of host statistics for reports.
pub trait SystemReader: Send + Sync {
    /// CPU usage of this process, sampled when an invocation starts.
    fn process_stat(&self) -> Option<ProcStat>;

    /// Full snapshot, taken when a report is finalised.
    fn snapshot(&self) -> SystemSnapshot;
}

/// Reads statistics from the Linux proc filesystem.
#[derive(Debug)]
pub struct ProcSystemReader {
    proc_root: PathBuf,
    tmp_path: PathBuf,
    boot_id: OnceLock<String>,
    hostname: OnceLock<String>,
}

impl ProcSystemReader {
    pub fn new() -> Self {
        Self::with_paths(DEFAULT_PROC_ROOT, DEFAULT_TMP_PATH)
    }

    /// Reads from an alternative proc root and scratch directory.
    pub fn with_paths(proc_root: impl Into<PathBuf>, tmp_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            tmp_path: tmp_path.into(),
            boot_id: OnceLock::new(),
            hostname: OnceLock::new(),
        }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.proc_root.join(relative)
    }

    fn read(&self, relative: &str) -> Option<String> {
        let path = self.path(relative);
        match fs::read_to_string(&path) {
            Ok(contents) => Some(contents),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Could not read proc file");
                None
            }
        }
    }

    /// Kernel boot id. Read once per process.
    pub fn boot_id(&self) -> &str {
        self.boot_id.get_or_init(|| {
            self.read("sys/kernel/random/boot_id")
                .map(|s| s.trim().to_string())
                .unwrap_or_default()
        })
    }

    /// Host name. Read once per process.
    pub fn hostname(&self) -> &str {
        self.hostname.get_or_init(|| {
            if let Ok(name) = std::env::var("HOSTNAME")
                && !name.is_empty()
            {
                return name;
            }
            self.read("sys/kernel/hostname")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "unknown".to_string())
        })
    }

    fn memory(&self) -> Option<MemoryStats> {
        parse_meminfo(&self.read("meminfo")?)
    }

    fn cpus(&self) -> Vec<CpuTimes> {
        self.read("stat")
            .map(|contents| parse_cpu_times(&contents))
            .unwrap_or_default()
    }

    fn status(&self) -> Option<ProcStatus> {
        parse_status(&self.read("self/status")?)
    }

    fn disk(&self) -> Option<DiskStats> {
        match statfs_blocks(&self.tmp_path) {
            Ok((block_size, blocks, available)) => {
                Some(DiskStats::from_blocks(block_size, blocks, available))
            }
            Err(e) => {
                debug!(path = %self.tmp_path.display(), error = %e, "Could not stat scratch filesystem");
                None
            }
        }
    }
}

impl Default for ProcSystemReader {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemReader for ProcSystemReader {
    fn process_stat(&self) -> Option<ProcStat> {
        parse_stat(&self.read("self/stat")?)
    }

    fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot {
            boot_id: self.boot_id().to_string(),
            hostname: self.hostname().to_string(),
            memory: self.memory(),
            cpus: self.cpus(),
            stat: self.process_stat(),
            status: self.status(),
            disk: self.disk(),
        }
    }
}

#[cfg(unix)]
fn statfs_blocks(path: &Path) -> std::io::Result<(f64, f64, f64)> {
    let stat = nix::sys::statfs::statfs(path).map_err(std::io::Error::from)?;
    Ok((
        stat.block_size() as f64,
        stat.blocks() as f64,
        stat.blocks_available() as f64,
    ))
}

#[cfg(not(unix))]
fn statfs_blocks(_path: &Path) -> std::io::Result<(f64, f64, f64)> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "statfs is not available on this platform",
    ))
}

fn parse_meminfo(contents: &str) -> Option<MemoryStats> {
    let mut total = None;
    let mut free = None;
    let mut available = None;

    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let kib = value
            .trim()
            .trim_end_matches("kB")
            .trim()
            .parse::<u64>()
            .ok();
        match key {
            "MemTotal" => total = kib,
            "MemFree" => free = kib,
            "MemAvailable" => available = kib,
            _ => {}
        }
    }

    Some(MemoryStats {
        total: total? * 1024,
        free: available.or(free)? * 1024,
    })
}

fn parse_cpu_times(contents: &str) -> Vec<CpuTimes> {
    contents
        .lines()
        .filter(|line| {
            line.strip_prefix("cpu")
                .and_then(|rest| rest.chars().next())
                .is_some_and(|c| c.is_ascii_digit())
        })
        .filter_map(|line| {
            let fields: Vec<u64> = line
                .split_whitespace()
                .skip(1)
                .map(|f| f.parse().ok())
                .collect::<Option<_>>()?;
            // user nice system idle iowait irq ...
            if fields.len() < 6 {
                return None;
            }
            Some(CpuTimes {
                user: fields[0] * MS_PER_TICK,
                nice: fields[1] * MS_PER_TICK,
                sys: fields[2] * MS_PER_TICK,
                idle: fields[3] * MS_PER_TICK,
                irq: fields[5] * MS_PER_TICK,
            })
        })
        .collect()
}

fn parse_stat(contents: &str) -> Option<ProcStat> {
    // The command name may contain spaces, so fields are counted after the
    // closing parenthesis. The first field there is the process state (3).
    let (_, rest) = contents.rsplit_once(')')?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let field = |n: usize| fields.get(n - 3)?.parse::<u64>().ok();

    Some(ProcStat {
        utime: field(14)?,
        stime: field(15)?,
        cutime: field(16)?,
        cstime: field(17)?,
    })
}

fn parse_status(contents: &str) -> Option<ProcStatus> {
    let mut status = ProcStatus::default();
    let mut seen = false;

    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Some(number) = value
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
        else {
            continue;
        };
        match key {
            "VmRSS" => status.vm_rss = number,
            "Threads" => status.threads = number,
            "FDSize" => status.fd_size = number,
            _ => continue,
        }
        seen = true;
    }

    seen.then_some(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const STAT: &str = "4242 (my (odd) handler) S 1 4242 4242 0 -1 4194560 \
        1200 0 0 0 37 11 5 3 20 0 4 0 100 2000000 512 18446744073709551615";

    fn fake_proc() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("sys/kernel/random")).unwrap();
        fs::create_dir_all(root.join("self")).unwrap();
        fs::write(
            root.join("sys/kernel/random/boot_id"),
            "0f9a2c3e-1111-4222-8333-444455556666\n",
        )
        .unwrap();
        fs::write(root.join("sys/kernel/hostname"), "sandbox-host\n").unwrap();
        fs::write(
            root.join("meminfo"),
            "MemTotal:        2048000 kB\nMemFree:          512000 kB\nMemAvailable:    1024000 kB\n",
        )
        .unwrap();
        fs::write(
            root.join("stat"),
            "cpu  200 10 100 5000 3 7 1 0 0 0\n\
             cpu0 100 5 50 2500 1 4 0 0 0 0\n\
             cpu1 100 5 50 2500 2 3 1 0 0 0\n\
             intr 12345\n",
        )
        .unwrap();
        fs::write(root.join("self/stat"), STAT).unwrap();
        fs::write(
            root.join("self/status"),
            "Name:\thandler\nVmRSS:\t   20480 kB\nThreads:\t4\nFDSize:\t64\n",
        )
        .unwrap();
        dir
    }

    #[test]
    #[serial]
    fn test_snapshot_reads_all_sources() {
        let proc_dir = fake_proc();
        let tmp_dir = TempDir::new().unwrap();
        let reader = ProcSystemReader::with_paths(proc_dir.path(), tmp_dir.path());

        let snapshot =
            temp_env::with_var_unset("HOSTNAME", || reader.snapshot());

        assert_eq!(snapshot.boot_id, "0f9a2c3e-1111-4222-8333-444455556666");
        assert_eq!(snapshot.hostname, "sandbox-host");
        assert_eq!(
            snapshot.memory,
            Some(MemoryStats {
                total: 2048000 * 1024,
                free: 1024000 * 1024,
            })
        );
        assert_eq!(snapshot.cpus.len(), 2);
        assert_eq!(
            snapshot.cpus[1],
            CpuTimes {
                user: 1000,
                nice: 50,
                sys: 500,
                idle: 25000,
                irq: 30,
            }
        );
        assert_eq!(
            snapshot.stat,
            Some(ProcStat {
                utime: 37,
                stime: 11,
                cutime: 5,
                cstime: 3,
            })
        );
        assert_eq!(
            snapshot.status,
            Some(ProcStatus {
                vm_rss: 20480,
                threads: 4,
                fd_size: 64,
            })
        );
        #[cfg(unix)]
        assert!(snapshot.disk.is_some_and(|d| d.total_mib > 0.0));
    }

    #[test]
    #[serial]
    fn test_hostname_prefers_env() {
        let proc_dir = fake_proc();
        let reader = ProcSystemReader::with_paths(proc_dir.path(), "/nonexistent");

        temp_env::with_var("HOSTNAME", Some("from-env"), || {
            assert_eq!(reader.hostname(), "from-env");
        });
    }

    #[test]
    #[serial]
    fn test_missing_proc_falls_back() {
        let reader = ProcSystemReader::with_paths("/nonexistent/proc", "/nonexistent/tmp");

        let snapshot = temp_env::with_var_unset("HOSTNAME", || reader.snapshot());

        assert_eq!(snapshot.boot_id, "");
        assert_eq!(snapshot.hostname, "unknown");
        assert!(snapshot.memory.is_none());
        assert!(snapshot.cpus.is_empty());
        assert!(snapshot.stat.is_none());
        assert!(snapshot.status.is_none());
        assert!(snapshot.disk.is_none());
    }

    #[test]
    fn test_disk_stats_from_blocks() {
        let disk = DiskStats::from_blocks(4096.0, 131072.0, 98304.0);
        assert_eq!(disk.total_mib, 512.0);
        assert_eq!(disk.used_mib, 128.0);
        assert_eq!(disk.used_percentage, 25.0);

        let empty = DiskStats::from_blocks(4096.0, 0.0, 0.0);
        assert_eq!(empty.used_percentage, 0.0);
    }

    #[test]
    fn test_parse_stat_rejects_truncated_line() {
        assert!(parse_stat("1 (x) S 1 2 3").is_none());
    }
}
