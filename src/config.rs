//! Configuration management for ransomwatch

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors raised while validating a configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid exclude pattern {pattern:?}: {source}")]
    BadExclude {
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("scoring.sample_interval_ms must be greater than zero")]
    ZeroSampleInterval,
    #[error("engine.tick_ms must be greater than zero")]
    ZeroTick,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directories to watch
    #[serde(default = "default_watch")]
    pub watch: Vec<PathBuf>,

    /// Glob patterns for paths whose events are ignored
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Which event feeds to start
    #[serde(default)]
    pub sources: SourceConfig,

    /// Window thresholds
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Fast-path rename inspection
    #[serde(default)]
    pub sentinel: SentinelConfig,

    /// Process scoring
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Orchestration loop
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch: default_watch(),
            exclude: default_exclude(),
            sources: SourceConfig::default(),
            detection: DetectionConfig::default(),
            sentinel: SentinelConfig::default(),
            scoring: ScoringConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config.validate()?)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Clamp and normalize values so the rest of the agent can trust them
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        self.detection.window_secs = self.detection.window_secs.max(1);
        self.detection.event_threshold = self.detection.event_threshold.max(1);
        self.detection.max_events_per_scope = self
            .detection
            .max_events_per_scope
            .max(self.detection.event_threshold);

        if self.scoring.sample_interval_ms == 0 {
            return Err(ConfigError::ZeroSampleInterval);
        }
        if self.engine.tick_ms == 0 {
            return Err(ConfigError::ZeroTick);
        }

        self.sentinel.suspicious_extensions = self
            .sentinel
            .suspicious_extensions
            .iter()
            .filter(|e| !e.trim().trim_start_matches('.').is_empty())
            .map(|e| format!(".{}", e.trim().trim_start_matches('.').to_lowercase()))
            .collect();
        self.scoring.suspicious_names = lowercase_all(&self.scoring.suspicious_names);
        self.scoring.allowlist = lowercase_all(&self.scoring.allowlist);

        self.exclude_set()?;
        Ok(self)
    }

    /// Compile the exclude patterns into a single matcher
    pub fn exclude_set(&self) -> Result<GlobSet, ConfigError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.exclude {
            let glob = Glob::new(pattern).map_err(|source| ConfigError::BadExclude {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        builder.build().map_err(|source| ConfigError::BadExclude {
            pattern: self.exclude.join(","),
            source,
        })
    }

    /// Check if a (lowercased) process name is allow-listed
    pub fn is_allowlisted(&self, process_name: &str) -> bool {
        self.scoring.allowlist.iter().any(|p| {
            if let Some(prefix) = p.strip_suffix('*') {
                process_name.starts_with(prefix)
            } else {
                process_name == p
            }
        })
    }
}

/// Event feed selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Path-only directory watch feed
    #[serde(default = "default_true")]
    pub inotify: bool,

    /// Kernel feed with pid attribution (needs CAP_SYS_ADMIN)
    #[serde(default = "default_true")]
    pub fanotify: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            inotify: true,
            fanotify: true,
        }
    }
}

/// Which windowed counters are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// One counter across every monitored directory
    Global,
    /// One counter per attributed pid
    PerProcess,
    /// Both at once
    Both,
}

impl Topology {
    pub fn global(self) -> bool {
        matches!(self, Topology::Global | Topology::Both)
    }

    pub fn per_process(self) -> bool {
        matches!(self, Topology::PerProcess | Topology::Both)
    }
}

/// Detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Sliding window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Events inside the window that fire a trigger
    #[serde(default = "default_event_threshold")]
    pub event_threshold: usize,

    /// Counter topology
    #[serde(default = "default_topology")]
    pub topology: Topology,

    /// Hard cap on retained events per scope
    #[serde(default = "default_max_events")]
    pub max_events_per_scope: usize,
}

impl DetectionConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            event_threshold: default_event_threshold(),
            topology: default_topology(),
            max_events_per_scope: default_max_events(),
        }
    }
}

/// Fast-path rename inspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// Destination extensions that fire immediately (with leading dot)
    #[serde(default = "default_extensions")]
    pub suspicious_extensions: Vec<String>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            suspicious_extensions: default_extensions(),
        }
    }
}

/// Candidate scoring parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Name fragments that suggest ransomware
    #[serde(default = "default_suspicious_names")]
    pub suspicious_names: Vec<String>,

    /// Process names never scored (trailing `*` matches a prefix)
    #[serde(default = "default_allowlist")]
    pub allowlist: Vec<String>,

    /// CPU sampling interval
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Minimum top score for an automatic suspend
    #[serde(default = "default_action_threshold")]
    pub action_threshold: f64,

    /// Candidates kept per pass
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// CPU percent below which no CPU points are given
    #[serde(default = "default_cpu_baseline")]
    pub cpu_baseline_percent: f64,

    /// CPU percent above baseline worth one point
    #[serde(default = "default_cpu_divisor")]
    pub cpu_points_divisor: f64,

    /// Maximum CPU points
    #[serde(default = "default_cpu_cap")]
    pub cpu_score_cap: f64,

    /// Processes younger than this are weighted as new
    #[serde(default = "default_new_process_secs")]
    pub new_process_secs: u64,
}

impl ScoringConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            suspicious_names: default_suspicious_names(),
            allowlist: default_allowlist(),
            sample_interval_ms: default_sample_interval_ms(),
            action_threshold: default_action_threshold(),
            top_k: default_top_k(),
            cpu_baseline_percent: default_cpu_baseline(),
            cpu_points_divisor: default_cpu_divisor(),
            cpu_score_cap: default_cpu_cap(),
            new_process_secs: default_new_process_secs(),
        }
    }
}

/// Orchestration loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Window poll cadence
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// How long a manual kill waits for the process to exit
    #[serde(default = "default_kill_wait_ms")]
    pub kill_wait_ms: u64,
}

impl EngineConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            kill_wait_ms: default_kill_wait_ms(),
        }
    }
}

fn lowercase_all(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_watch() -> Vec<PathBuf> {
    vec![PathBuf::from("/home"), PathBuf::from("/srv")]
}

fn default_exclude() -> Vec<String> {
    strings(&["**/*.swp", "**/*.tmp", "**/.cache/**", "/var/log/**"])
}

fn default_window_secs() -> u64 {
    1
}

fn default_event_threshold() -> usize {
    10
}

fn default_topology() -> Topology {
    Topology::Both
}

fn default_max_events() -> usize {
    10_000
}

fn default_extensions() -> Vec<String> {
    strings(&[".locked", ".encrypted", ".wncry", ".wnry", ".crypt", ".enc"])
}

fn default_suspicious_names() -> Vec<String> {
    strings(&[
        "ransom", "crypt", "encrypt", "locker", "evil", "payload", "wannacry", "locky",
    ])
}

fn default_allowlist() -> Vec<String> {
    strings(&[
        "systemd",
        "init",
        "kthreadd",
        "sshd",
        "bash",
        "zsh",
        "code",
        "vim",
        "nvim",
        "rsync",
        "backup",
        "ransomwatch",
    ])
}

fn default_sample_interval_ms() -> u64 {
    200
}

fn default_action_threshold() -> f64 {
    3.5
}

fn default_top_k() -> usize {
    10
}

fn default_cpu_baseline() -> f64 {
    5.0
}

fn default_cpu_divisor() -> f64 {
    5.0
}

fn default_cpu_cap() -> f64 {
    4.0
}

fn default_new_process_secs() -> u64 {
    60
}

fn default_tick_ms() -> u64 {
    250
}

fn default_kill_wait_ms() -> u64 {
    3000
}
