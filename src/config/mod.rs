//! Harness configuration
//!
//! Loaded from TOML (or JSON, chosen by a `.json` extension):
//! - `version`: automation agent target version
//! - `[vars]`: extra placeholder values for suite templates
//! - `[device]`, `[timeouts]`, `[agent]`, `[host_check]`
//! - `[suites.<id>]`: ordered suite definitions; file order is run order
//!
//! Every suite template is parsed and checked against the known placeholder
//! names at load time.

mod template;

pub use template::{Template, TemplateError};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::failure::FailureKind;
use crate::timeout::{TimeoutConfig, TimeoutValidationError};

/// Placeholder for the per-suite temporary directory
pub const TEMP_DIR_VAR: &str = "temp_dir";

/// Placeholder for the configured target version
pub const VERSION_VAR: &str = "version";

/// Default config file name, looked up beside the executable
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Top-level harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// Target software version used by the agent install step
    pub version: String,

    /// Extra shared placeholder values
    #[serde(default)]
    pub vars: BTreeMap<String, String>,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub host_check: HostCheckConfig,

    /// Suite definitions in run order
    #[serde(default)]
    pub suites: IndexMap<String, SuiteConfig>,
}

/// Device selection and the state saved around each suite
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Device serial (default: the only attached device)
    pub serial: Option<String>,

    /// Directories backed up before the run and restored after each suite
    pub backup_dirs: Vec<String>,

    /// Files backed up before the run and restored after each suite
    pub backup_files: Vec<String>,

    /// Directory holding `profiles.ini`
    pub profile_base: String,

    /// adb executable (default: `ADB_PATH`, the Android SDK, then `PATH`)
    pub adb_path: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial: None,
            backup_dirs: vec!["/data/local".to_string(), "/data/b2g/mozilla".to_string()],
            backup_files: vec!["/system/etc/hosts".to_string()],
            profile_base: "/data/b2g/mozilla".to_string(),
            adb_path: None,
        }
    }
}

/// Automation agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Helper executable that installs and drives the agent
    pub command: PathBuf,

    /// Device port the agent listens on (forwarded to the same local port)
    pub port: u16,

    /// Device settings applied before any suite runs
    pub settings: IndexMap<String, serde_json::Value>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let mut settings = IndexMap::new();
        settings.insert("screen.automatic-brightness".to_string(), serde_json::Value::Bool(false));
        settings.insert("screen.brightness".to_string(), serde_json::json!(1.0));
        settings.insert("screen.timeout".to_string(), serde_json::json!(0.0));
        Self {
            command: PathBuf::from("certsuite-agent"),
            port: 2828,
            settings,
        }
    }
}

/// What to do when the device has no HTTP client for the reachability probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingClientPolicy {
    /// Count the check as passed
    Pass,
    /// Report the check as skipped and warn
    #[default]
    Skip,
    /// Fail the check
    Fail,
}

/// Host reachability check settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostCheckConfig {
    /// Local ports tried in order; an in-use port moves on to the next
    pub ports: Vec<u16>,

    /// Address the device uses to reach this host (default: detected)
    pub host_ip: Option<String>,

    pub missing_client: MissingClientPolicy,
}

impl Default for HostCheckConfig {
    fn default() -> Self {
        Self {
            ports: vec![8000, 8001],
            host_ip: None,
            missing_client: MissingClientPolicy::Skip,
        }
    }
}

/// One suite definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    /// Suite executable
    pub cmd: Template,

    /// Arguments that depend on the run (temp dir, version)
    #[serde(default)]
    pub run_args: Vec<Template>,

    /// Arguments passed to every invocation, including group listing
    #[serde(default)]
    pub common_args: Vec<Template>,

    /// Extra output files the suite writes, collected into the archive
    #[serde(default)]
    pub extra_files: Vec<Template>,

    /// Wall-clock limit for the suite process (default: none)
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl SuiteConfig {
    pub fn new(cmd: &str) -> Self {
        Self {
            cmd: Template::literal(cmd),
            run_args: Vec::new(),
            common_args: Vec::new(),
            extra_files: Vec::new(),
            timeout_seconds: None,
        }
    }

    fn templates(&self) -> impl Iterator<Item = (&'static str, &Template)> {
        std::iter::once(("cmd", &self.cmd))
            .chain(self.run_args.iter().map(|t| ("run_args", t)))
            .chain(self.common_args.iter().map(|t| ("common_args", t)))
            .chain(self.extra_files.iter().map(|t| ("extra_files", t)))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("suite '{suite}': missing required field '{field}'")]
    MissingField { suite: String, field: &'static str },

    #[error("suite '{suite}': {field} uses unknown placeholder '%({name})s'")]
    UnknownPlaceholder {
        suite: String,
        field: &'static str,
        name: String,
    },

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("invalid timeouts: {0}")]
    Timeouts(#[from] TimeoutValidationError),
}

impl ConfigError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::Configuration
    }
}

/// A loaded config with its provenance
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: HarnessConfig,
    pub path: PathBuf,
    /// sha256 of the raw file bytes, hex encoded
    pub digest: String,
}

impl HarnessConfig {
    /// `config.toml` beside the running executable, or in the working
    /// directory when the executable path is unknown
    pub fn default_path() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_CONFIG_FILE)))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<LoadedConfig, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let content = String::from_utf8_lossy(&bytes);

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let config = if is_json {
            Self::parse_json(&content)?
        } else {
            Self::parse_toml(&content)?
        };

        Ok(LoadedConfig {
            config,
            path: path.to_path_buf(),
            digest: hex::encode(Sha256::digest(&bytes)),
        })
    }

    /// Parse and validate a TOML config
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON config
    pub fn parse_json(content: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Whether `name` resolves in suite templates
    pub fn is_known_placeholder(&self, name: &str) -> bool {
        name == TEMP_DIR_VAR || name == VERSION_VAR || self.vars.contains_key(name)
    }

    /// Shared placeholder values: `version` plus `[vars]`. `temp_dir` is
    /// added per suite.
    pub fn shared_values(&self) -> BTreeMap<String, String> {
        let mut values = self.vars.clone();
        values.insert(VERSION_VAR.to_string(), self.version.clone());
        values
    }

    pub fn suite(&self, id: &str) -> Option<&SuiteConfig> {
        self.suites.get(id)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts.validate()?;

        if self.version.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "version".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        for reserved in [TEMP_DIR_VAR, VERSION_VAR] {
            if self.vars.contains_key(reserved) {
                return Err(ConfigError::InvalidValue {
                    field: format!("vars.{}", reserved),
                    reason: "reserved placeholder name".to_string(),
                });
            }
        }
        if self.host_check.ports.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "host_check.ports".to_string(),
                reason: "at least one port is required".to_string(),
            });
        }

        for (id, suite) in &self.suites {
            if id.is_empty() || id.contains(':') || id.contains('/') {
                return Err(ConfigError::InvalidValue {
                    field: format!("suites.{}", id),
                    reason: "suite ids must be non-empty and contain no ':' or '/'".to_string(),
                });
            }
            if suite.cmd.as_str().trim().is_empty() {
                return Err(ConfigError::MissingField {
                    suite: id.clone(),
                    field: "cmd",
                });
            }
            if suite.timeout_seconds == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: format!("suites.{}.timeout_seconds", id),
                    reason: "must be positive".to_string(),
                });
            }
            for (field, template) in suite.templates() {
                if let Some(name) = template
                    .unknown_placeholders(|name| self.is_known_placeholder(name))
                    .first()
                {
                    return Err(ConfigError::UnknownPlaceholder {
                        suite: id.clone(),
                        field,
                        name: name.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}
