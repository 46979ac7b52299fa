//! Live process table
//!
//! The scorer reads processes through [`ProcessTable`]; the Linux backend
//! parses `/proc/<pid>/stat`.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// One process as seen at snapshot time
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSample {
    pub pid: u32,
    /// Command name as reported by the OS
    pub name: String,
    /// Cumulative user + system CPU time
    pub cpu_time: Duration,
    pub threads: u32,
    /// Time since the process started, when known
    pub age: Option<Duration>,
}

/// Source of process snapshots
pub trait ProcessTable: Send + Sync {
    /// Every readable process; unreadable ones are left out
    fn snapshot(&self) -> Vec<ProcessSample>;
}

/// `/proc` reader
#[derive(Debug, Clone)]
pub struct ProcfsTable {
    root: PathBuf,
    ticks_per_sec: u64,
}

impl ProcfsTable {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from an alternate proc mount
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let ticks_per_sec = nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
            .ok()
            .flatten()
            .and_then(|t| u64::try_from(t).ok())
            .filter(|t| *t > 0)
            .unwrap_or(100);

        Self {
            root: root.into(),
            ticks_per_sec,
        }
    }

    fn uptime(&self) -> Option<Duration> {
        let content = std::fs::read_to_string(self.root.join("uptime")).ok()?;
        let secs: f64 = content.split_whitespace().next()?.parse().ok()?;
        Some(Duration::from_secs_f64(secs))
    }

    fn read_process(&self, pid: u32, uptime: Option<Duration>) -> Option<ProcessSample> {
        let stat = std::fs::read_to_string(self.root.join(pid.to_string()).join("stat")).ok()?;
        let parsed = parse_stat(&stat)?;

        let cpu_ticks = parsed.utime + parsed.stime;
        let cpu_time = Duration::from_millis(cpu_ticks * 1000 / self.ticks_per_sec);
        let started = Duration::from_millis(parsed.start_ticks * 1000 / self.ticks_per_sec);
        let age = uptime.and_then(|up| up.checked_sub(started));

        Some(ProcessSample {
            pid,
            name: parsed.comm,
            cpu_time,
            threads: parsed.threads,
            age,
        })
    }
}

impl Default for ProcfsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcfsTable {
    fn snapshot(&self) -> Vec<ProcessSample> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list {:?}: {}", self.root, e);
                return Vec::new();
            }
        };

        let uptime = self.uptime();
        entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            // A process can exit between listing and reading
            .filter_map(|pid| self.read_process(pid, uptime))
            .collect()
    }
}

/// Fields of `/proc/<pid>/stat` the scorer needs
#[derive(Debug, PartialEq, Eq)]
struct StatFields {
    comm: String,
    state: char,
    utime: u64,
    stime: u64,
    threads: u32,
    start_ticks: u64,
}

/// Parse a stat line
///
/// Format: `pid (comm) state ppid ...`; comm may contain spaces and
/// parentheses, so it runs to the last `)`.
fn parse_stat(stat: &str) -> Option<StatFields> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?.to_string();

    let rest: Vec<&str> = stat.get(close + 1..)?.split_whitespace().collect();
    let field = |i: usize| rest.get(i).copied();

    Some(StatFields {
        comm,
        state: field(0)?.chars().next()?,
        utime: field(11)?.parse().ok()?,
        stime: field(12)?.parse().ok()?,
        threads: field(17)?.parse().ok()?,
        start_ticks: field(19)?.parse().ok()?,
    })
}

/// Single-letter scheduler state of a process (`T` = stopped, `Z` = zombie)
pub fn process_state(proc_root: &Path, pid: u32) -> Option<char> {
    let stat = std::fs::read_to_string(proc_root.join(pid.to_string()).join("stat")).ok()?;
    parse_stat(&stat).map(|f| f.state)
}
