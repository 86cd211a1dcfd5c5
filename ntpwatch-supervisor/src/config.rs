use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Polling interval handed to a remote sampler when the server entry has none.
pub const DEFAULT_INTERVAL_MS: u64 = 5000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration source unavailable at {path:?}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("missing configuration section: {0}")]
    MissingSection(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Anything able to hand out the current monitoring configuration.
///
/// The source is read once at startup and again on every reconciliation
/// cycle, so implementations must reflect edits made while running.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<MonitorConfig, ConfigError>;
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct MonitorConfig {
    pub output: Option<OutputConf>,
    /// Configured server name -> optional sampling interval.
    pub servers: Option<BTreeMap<String, Option<IntervalSetting>>>,
    #[serde(default)]
    pub supervisor: SupervisorConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutputConf {
    pub base_path: PathBuf,
}

/// Interval values may be written as numbers or as (possibly empty) strings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum IntervalSetting {
    Millis(u64),
    Text(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SupervisorConf {
    pub refresh_interval_secs: u64,
    pub poll_interval_ms: u64,
    pub run_duration_secs: u64,
    /// `None` waits for every sampler without bound on shutdown.
    pub drain_timeout_secs: Option<u64>,
    pub remote_sampler: SamplerCommand,
    pub local_sampler: SamplerCommand,
}

/// Executable plus the arguments placed before the sampler contract arguments.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SamplerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One desired server as read from the `servers` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub name: String,
    pub interval_ms: u64,
}

impl Default for SupervisorConf {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
            poll_interval_ms: 250,
            run_duration_secs: 3600,
            drain_timeout_secs: None,
            remote_sampler: SamplerCommand::new("ntpsampler"),
            local_sampler: SamplerCommand::new("ntpwatch-timesampler"),
        }
    }
}

impl SamplerCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl IntervalSetting {
    /// Resolves the setting to milliseconds; empty text means "use the default".
    fn millis(&self, server: &str) -> u64 {
        match self {
            IntervalSetting::Millis(ms) => *ms,
            IntervalSetting::Text(text) if text.trim().is_empty() => DEFAULT_INTERVAL_MS,
            IntervalSetting::Text(text) => text.trim().parse().unwrap_or_else(|_| {
                warn!("interval {text:?} for server {server} is not a number, using {DEFAULT_INTERVAL_MS}ms");
                DEFAULT_INTERVAL_MS
            }),
        }
    }
}

impl MonitorConfig {
    pub fn from_yaml(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(txt)?)
    }

    /// Base directory for output files; required at startup.
    pub fn base_path(&self) -> Result<&Path, ConfigError> {
        match &self.output {
            Some(output) if !output.base_path.as_os_str().is_empty() => Ok(&output.base_path),
            _ => Err(ConfigError::MissingSection("output.base_path")),
        }
    }

    /// Desired servers with their effective intervals.
    pub fn server_entries(&self) -> Result<Vec<ServerEntry>, ConfigError> {
        let servers = self.servers.as_ref().ok_or(ConfigError::MissingSection("servers"))?;
        Ok(servers
            .iter()
            .map(|(name, interval)| ServerEntry {
                name: name.clone(),
                interval_ms: interval
                    .as_ref()
                    .map(|i| i.millis(name))
                    .unwrap_or(DEFAULT_INTERVAL_MS),
            })
            .collect())
    }
}

impl SupervisorConf {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid("supervisor.refresh_interval_secs must be > 0".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("supervisor.poll_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(Duration::from_secs)
    }
}

/// YAML file on disk, re-read on every `load`.
#[derive(Debug, Clone)]
pub struct YamlConfigSource {
    path: PathBuf,
}

impl YamlConfigSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Resolves the config path: explicit argument, then `NTPWATCH_CONFIG`, then `ntpwatch.yaml`.
    pub fn from_env(arg: Option<String>) -> Self {
        let path = arg
            .or_else(|| std::env::var("NTPWATCH_CONFIG").ok())
            .unwrap_or_else(|| "ntpwatch.yaml".into());
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for YamlConfigSource {
    fn load(&self) -> Result<MonitorConfig, ConfigError> {
        let txt = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Unavailable {
            path: self.path.clone(),
            source,
        })?;
        MonitorConfig::from_yaml(&txt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
output:
  base_path: /tmp/ntpwatch
servers:
  localhost:
  pool.ntp.org: 1000
  time.example.org: ""
  odd.example.org: "2500"
  broken.example.org: "soon"
supervisor:
  refresh_interval_secs: 30
  remote_sampler: { program: /usr/local/bin/ntpsampler, args: ["--quiet"] }
"#;

    #[test]
    fn test_parse_servers_with_interval_defaults() {
        let cfg = MonitorConfig::from_yaml(SAMPLE).unwrap();
        let entries = cfg.server_entries().unwrap();
        let interval = |name: &str| entries.iter().find(|e| e.name == name).unwrap().interval_ms;

        assert_eq!(entries.len(), 5);
        assert_eq!(interval("localhost"), DEFAULT_INTERVAL_MS);
        assert_eq!(interval("pool.ntp.org"), 1000);
        assert_eq!(interval("time.example.org"), DEFAULT_INTERVAL_MS);
        assert_eq!(interval("odd.example.org"), 2500);
        assert_eq!(interval("broken.example.org"), DEFAULT_INTERVAL_MS);
    }

    #[test]
    fn test_supervisor_section_partial_override() {
        let cfg = MonitorConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.supervisor.refresh_interval_secs, 30);
        assert_eq!(cfg.supervisor.poll_interval_ms, 250);
        assert_eq!(cfg.supervisor.remote_sampler.args, vec!["--quiet".to_string()]);
        assert_eq!(cfg.supervisor.local_sampler, SamplerCommand::new("ntpwatch-timesampler"));
        assert!(cfg.supervisor.drain_timeout().is_none());
    }

    #[test]
    fn test_missing_sections() {
        let cfg = MonitorConfig::from_yaml("supervisor: {}\n").unwrap();
        assert!(matches!(cfg.base_path(), Err(ConfigError::MissingSection("output.base_path"))));
        assert!(matches!(cfg.server_entries(), Err(ConfigError::MissingSection("servers"))));
    }

    #[test]
    fn test_validate_rejects_zero_periods() {
        let conf = SupervisorConf { poll_interval_ms: 0, ..Default::default() };
        assert!(matches!(conf.validate(), Err(ConfigError::Invalid(_))));
        assert!(SupervisorConf::default().validate().is_ok());
    }

    #[test]
    fn test_yaml_source_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = YamlConfigSource::new(dir.path().join("absent.yaml"));
        assert!(matches!(source.load(), Err(ConfigError::Unavailable { .. })));

        std::fs::write(dir.path().join("present.yaml"), SAMPLE).unwrap();
        let source = YamlConfigSource::new(dir.path().join("present.yaml"));
        assert_eq!(source.load().unwrap().base_path().unwrap(), Path::new("/tmp/ntpwatch"));
    }
}
