//! flotilla.toml configuration.
//!
//! ```toml
//! [daemon]
//! port = 8480
//! data_dir = "/var/lib/flotilla"
//! tick_interval = "10s"
//!
//! [[sources]]
//! name = "sim-general"
//! kind = "simulated"
//! labels = ["linux", "gpu"]
//!
//! [access.grants]
//! alice = ["*"]
//! ```
//!
//! Sources are evaluated in the order they appear.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use flotilla_provision::{Label, SourceName};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlotillaConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub demand: DemandConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub access: AccessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,
    #[serde(default = "default_retention_interval")]
    pub retention_interval: String,
    /// Give up on planned capacity after this long. Unset waits forever.
    pub completion_timeout: Option<String>,
    #[serde(default = "default_event_history")]
    pub event_history: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
            tick_interval: default_tick_interval(),
            retention_interval: default_retention_interval(),
            completion_timeout: None,
            event_history: default_event_history(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DemandConfig {
    /// EMA decay in `[0, 1)`; 0 disables smoothing.
    #[serde(default)]
    pub smoothing: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Simulated,
}

/// When a provisioned node goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionMode {
    /// Remove after `idle_timeout` without work.
    #[default]
    Idle,
    /// Never remove automatically.
    Always,
    /// Remove once the node has run work and is idle again.
    Once,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Whether the source also serves untagged demand.
    #[serde(default = "default_true")]
    pub untagged: bool,
    #[serde(default = "default_executors_per_node")]
    pub executors_per_node: u32,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: u32,
    #[serde(default = "default_boot_delay")]
    pub boot_delay: String,
    #[serde(default)]
    pub retention: RetentionMode,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Actor → source names (`"*"` for all). Without a table every actor
    /// may mutate every source.
    pub grants: Option<HashMap<String, Vec<String>>>,
}

fn default_port() -> u16 {
    8480
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/flotilla")
}

fn default_tick_interval() -> String {
    "10s".to_string()
}

fn default_retention_interval() -> String {
    "30s".to_string()
}

fn default_event_history() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_executors_per_node() -> u32 {
    1
}

fn default_max_nodes() -> u32 {
    10
}

fn default_boot_delay() -> String {
    "5s".to_string()
}

fn default_idle_timeout() -> String {
    "10m".to_string()
}

impl FlotillaConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse and validate.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: FlotillaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        duration_field("daemon.tick_interval", &self.daemon.tick_interval)?;
        duration_field("daemon.retention_interval", &self.daemon.retention_interval)?;
        if let Some(timeout) = &self.daemon.completion_timeout {
            duration_field("daemon.completion_timeout", timeout)?;
        }
        if !(0.0..1.0).contains(&self.demand.smoothing) {
            bail!("demand.smoothing must be in [0, 1), got {}", self.demand.smoothing);
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            SourceName::new(source.name.as_str())?;
            if !seen.insert(source.name.as_str()) {
                bail!("duplicate source name: {}", source.name);
            }
            for label in &source.labels {
                Label::new(label.as_str())?;
            }
            if source.executors_per_node == 0 {
                bail!("source {}: executors_per_node must be at least 1", source.name);
            }
            duration_field(&format!("source {} boot_delay", source.name), &source.boot_delay)?;
            duration_field(&format!("source {} idle_timeout", source.name), &source.idle_timeout)?;
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        parse_duration(&self.daemon.tick_interval).unwrap_or(Duration::from_secs(10))
    }

    pub fn retention_interval(&self) -> Duration {
        parse_duration(&self.daemon.retention_interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        self.daemon.completion_timeout.as_deref().and_then(parse_duration)
    }
}

impl SourceConfig {
    pub fn boot_delay(&self) -> Duration {
        parse_duration(&self.boot_delay).unwrap_or(Duration::from_secs(5))
    }

    pub fn idle_timeout(&self) -> Duration {
        parse_duration(&self.idle_timeout).unwrap_or(Duration::from_secs(600))
    }
}

fn duration_field(field: &str, value: &str) -> anyhow::Result<Duration> {
    parse_duration(value).with_context(|| format!("{field}: invalid duration {value:?}"))
}

/// Parse a duration like "500ms", "30s", "10m", "2h" or bare seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[daemon]
port = 9000
data_dir = "/tmp/flotilla"
tick_interval = "2s"
retention_interval = "1m"
completion_timeout = "15m"
event_history = 32

[demand]
smoothing = 0.5

[[sources]]
name = "sim-general"
kind = "simulated"
labels = ["linux", "gpu"]
executors_per_node = 2
max_nodes = 4
boot_delay = "500ms"
idle_timeout = "10m"

[[sources]]
name = "sim-burst"
untagged = false
labels = ["gpu"]
retention = "once"

[access.grants]
alice = ["*"]
bob = ["sim-general"]
"#;

    #[test]
    fn parse_full_config() {
        let config = FlotillaConfig::parse(FULL).unwrap();
        assert_eq!(config.daemon.port, 9000);
        assert_eq!(config.tick_interval(), Duration::from_secs(2));
        assert_eq!(config.retention_interval(), Duration::from_secs(60));
        assert_eq!(config.completion_timeout(), Some(Duration::from_secs(900)));
        assert_eq!(config.demand.smoothing, 0.5);

        let names: Vec<&str> = config.sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["sim-general", "sim-burst"]);
        assert_eq!(config.sources[0].boot_delay(), Duration::from_millis(500));
        assert!(config.sources[0].untagged);
        assert!(!config.sources[1].untagged);
        assert_eq!(config.sources[1].retention, RetentionMode::Once);
        assert_eq!(config.sources[1].executors_per_node, 1);

        let grants = config.access.grants.unwrap();
        assert_eq!(grants["alice"], vec!["*".to_string()]);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = FlotillaConfig::parse("").unwrap();
        assert_eq!(config.daemon.port, 8480);
        assert_eq!(config.tick_interval(), Duration::from_secs(10));
        assert_eq!(config.completion_timeout(), None);
        assert!(config.sources.is_empty());
        assert!(config.access.grants.is_none());
    }

    #[test]
    fn rejects_duplicate_source_names() {
        let err = FlotillaConfig::parse(
            r#"
[[sources]]
name = "a"
[[sources]]
name = "a"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_invalid_source_name() {
        assert!(FlotillaConfig::parse("[[sources]]\nname = \"has space\"\n").is_err());
    }

    #[test]
    fn rejects_bad_duration() {
        assert!(FlotillaConfig::parse("[daemon]\ntick_interval = \"soon\"\n").is_err());
    }

    #[test]
    fn rejects_out_of_range_smoothing() {
        assert!(FlotillaConfig::parse("[demand]\nsmoothing = 1.0\n").is_err());
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = FlotillaConfig::parse(FULL).unwrap();
        let again = FlotillaConfig::parse(&config.to_toml_string().unwrap()).unwrap();
        assert_eq!(again.sources.len(), 2);
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("fast"), None);
    }
}
