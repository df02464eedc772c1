//! Daemon settings

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use pihw_io::InstallationConfig;
use serde::{Deserialize, Serialize};

/// Facilities that can be switched individually, each mapped to a tracing
/// target of the same name under `pihw::`
pub const FACILITIES: &[&str] = &[
    "protocol",
    "bus",
    "board",
    "le",
    "scheduler",
    "expander",
    "device",
];

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogSettings {
    /// Level for everything not named in `facilities`
    #[serde(default = "default_level")]
    pub level: String,
    /// Per-facility level, or `off`
    #[serde(default)]
    pub facilities: BTreeMap<String, String>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            facilities: BTreeMap::new(),
        }
    }
}

impl LogSettings {
    /// Filter directives in `EnvFilter` syntax
    ///
    /// Unknown facilities and levels are rejected so a typo does not
    /// silently hide a subsystem's output.
    pub fn directives(&self) -> anyhow::Result<String> {
        check_level(&self.level)?;
        let mut directives = vec![
            format!("pihw={}", self.level),
            format!("pihw_daemon={}", self.level),
        ];
        for (facility, level) in &self.facilities {
            if !FACILITIES.contains(&facility.as_str()) {
                bail!("unknown log facility '{}'", facility);
            }
            check_level(level)?;
            directives.push(format!("pihw::{}={}", facility, level));
        }
        Ok(directives.join(","))
    }
}

fn check_level(level: &str) -> anyhow::Result<()> {
    match level {
        "off" | "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
        other => bail!("unknown log level '{}'", other),
    }
}

/// Daemon settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Settings {
    /// Transports and devices to run
    #[serde(default)]
    pub installation: InstallationConfig,
    #[serde(default)]
    pub log: LogSettings,
}

impl Settings {
    /// Get the config directory for pihw
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("pihw"))
    }

    /// Default settings file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings from `path`, or from the default location
    ///
    /// A missing file at the default location yields default settings; a
    /// missing file that was asked for explicitly is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let settings: Settings = serde_json::from_str(text)?;
        settings.installation.validate()?;
        Ok(settings)
    }
}
