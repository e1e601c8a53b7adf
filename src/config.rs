//! Configuration management for mcsupervisor.
use regex::{Captures, Regex};
use serde::{Deserialize, Deserializer};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    constants::{
        DEFAULT_JAVA, DEFAULT_MEMORY_MB, DEFAULT_PORT, SHUTDOWN_POLL_INTERVAL, SHUTDOWN_TIMEOUT,
    },
    download::{CacheOptions, default_cache_dir, expand_home},
    error::ServerError,
    properties::Properties,
};

/// Everything needed to supervise one server, as read from a YAML file or built in code.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Server name. Generated from the version on first start when empty.
    pub name: String,
    /// Version id, `latest`, `latest-snapshot`, or a direct jar URL.
    pub version: String,
    /// Working directory of the server process.
    pub directory: PathBuf,
    /// Port written to `server-port` unless the properties set one.
    pub port: u32,
    /// Heap size passed to the JVM.
    pub memory_mb: u64,
    /// Whether the Minecraft EULA has been accepted.
    pub eula: bool,
    /// Java executable used to launch the server.
    pub java: String,
    /// Extra JVM arguments placed before `-jar`.
    pub jvm_args: Vec<String>,
    /// Environment passed to the server process.
    pub env: EnvConfig,
    /// Entries merged into `server.properties` on start.
    pub properties: Properties,
    pub cache: CacheConfig,
    /// Optional scheduled backups.
    pub backup: Option<BackupSchedule>,
    /// Grace period between SIGTERM and SIGKILL.
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,
    /// How often liveness is checked while waiting for a graceful exit.
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: "latest".into(),
            directory: PathBuf::from("."),
            port: u32::from(DEFAULT_PORT),
            memory_mb: DEFAULT_MEMORY_MB,
            eula: false,
            java: DEFAULT_JAVA.into(),
            jvm_args: Vec::new(),
            env: EnvConfig::default(),
            properties: Properties::new(),
            cache: CacheConfig::default(),
            backup: None,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
            shutdown_poll_interval: SHUTDOWN_POLL_INTERVAL,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration whose directory is `./<name>` resolved against the current
    /// working directory.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let name = name.into();
        let directory = std::path::absolute(&name).unwrap_or_else(|_| PathBuf::from(&name));
        Self {
            name,
            version: version.into(),
            directory,
            ..Self::default()
        }
    }
}

/// Represents environment variables for the server process.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct EnvConfig {
    /// Optional path to an environment file.
    pub file: Option<String>,
    /// Key-value pairs of environment variables. Entries here win over the file.
    pub vars: HashMap<String, String>,
}

impl EnvConfig {
    /// Resolves the full path to the env file based on a base directory.
    pub fn path(&self, base: &Path) -> Option<PathBuf> {
        self.file.as_ref().map(|f| {
            let path = Path::new(f);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        })
    }
}

/// Artifact cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Cache location; `~` is expanded. Defaults to the user cache directory.
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

impl CacheConfig {
    pub fn options(&self) -> CacheOptions {
        CacheOptions {
            enabled: self.enabled,
            dir: self
                .dir
                .as_deref()
                .map(expand_home)
                .unwrap_or_else(default_cache_dir),
        }
    }
}

/// Cron-driven backup settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BackupSchedule {
    /// Six or seven field cron expression (seconds first).
    pub schedule: String,
    /// IANA timezone the expression is evaluated in. Defaults to UTC.
    pub timezone: Option<String>,
    /// Number of archives to keep after each scheduled backup.
    pub retain: Option<usize>,
}

/// Parses a shutdown timing such as `30s`, `2m` or `250ms`. A bare number is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ServerError> {
    let value = raw.trim();
    let invalid = || {
        ServerError::Config(format!(
            "Invalid duration '{raw}' (expected e.g. 30s, 2m, 250ms)"
        ))
    };

    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits.parse().map_err(|_| invalid())?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(amount)),
        "" | "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(amount.saturating_mul(3600))),
        _ => Err(invalid()),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(raw) => parse_duration(&raw).map_err(serde::de::Error::custom),
    }
}

/// Expands `${VAR}` references using `lookup`. Every unresolved name is reported at once.
fn expand_env_vars(
    input: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ServerError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ServerError::Config(e.to_string()))?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &Captures| {
        let var_name = &caps[1];
        lookup(var_name).unwrap_or_else(|| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        return Err(ServerError::Config(format!(
            "Missing environment variable(s): {}",
            missing.join(", ")
        )));
    }
    Ok(result.into_owned())
}

/// Reads `KEY=VALUE` lines from an `.env` file.
fn load_env_file(path: &Path) -> Result<HashMap<String, String>, ServerError> {
    let content = fs::read_to_string(path).map_err(|e| {
        ServerError::Config(format!("Failed to read env file {}: {e}", path.display()))
    })?;

    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let mut value = value.trim();
            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }
            vars.insert(key.trim().to_string(), value.to_string());
        }
    }
    Ok(vars)
}

/// Pulls `env.file` out of the unexpanded document so its variables can feed expansion.
fn env_file_reference(content: &str) -> Option<String> {
    let document: serde_yaml::Value = serde_yaml::from_str(content).ok()?;
    document
        .get("env")?
        .get("file")?
        .as_str()
        .map(str::to_string)
}

/// Loads and parses the configuration file, expanding environment variables.
///
/// Relative `directory` and `env.file` paths are resolved against the file's own directory.
pub fn load_config(config_path: &Path) -> Result<ServerConfig, ServerError> {
    let content = fs::read_to_string(config_path).map_err(|e| {
        ServerError::Config(format!("Failed to read {}: {e}", config_path.display()))
    })?;

    let base_path = std::path::absolute(config_path.parent().unwrap_or_else(|| Path::new(".")))?;

    let file_vars = match env_file_reference(&content) {
        Some(file) => {
            let env = EnvConfig {
                file: Some(file),
                vars: HashMap::new(),
            };
            match env.path(&base_path) {
                Some(path) => load_env_file(&path)?,
                None => HashMap::new(),
            }
        }
        None => HashMap::new(),
    };

    let expanded = expand_env_vars(&content, |name| {
        file_vars.get(name).cloned().or_else(|| env::var(name).ok())
    })?;

    let mut config: ServerConfig = serde_yaml::from_str(&expanded).map_err(|e| {
        ServerError::Config(format!("Failed to parse {}: {e}", config_path.display()))
    })?;

    if config.directory.is_relative() {
        config.directory = base_path.join(&config.directory);
    }

    for (key, value) in file_vars {
        config.env.vars.entry(key).or_insert(value);
    }

    Ok(config)
}
