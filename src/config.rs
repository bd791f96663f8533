//! Dashboard configuration and highlight-rule profiles.
//!
//! Neither is allowed to stop the process: a missing or broken file is
//! logged and replaced by an empty configuration or an empty rule set.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One entry of the `logs` list, as written in the file.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct LogEntry {
    pub path: String,
    pub profile: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DashboardConfig {
    pub server_password: Option<String>,
    pub logs: Vec<LogEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Document {
    Legacy(Vec<LogEntry>),
    Full(DashboardConfig),
}

impl DashboardConfig {
    /// Parses either the object form or the legacy bare list of entries.
    /// Blank input is an empty configuration.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(DashboardConfig::default());
        }

        let config = match serde_json::from_str(text)? {
            Document::Full(config) => config,
            Document::Legacy(logs) => {
                info!("legacy list configuration detected");
                DashboardConfig {
                    server_password: None,
                    logs,
                }
            }
        };

        Ok(config)
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Reads the configuration, falling back to an empty one on any error.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let config = match Self::read(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "starting with an empty configuration");
                DashboardConfig::default()
            }
        };

        if config.logs.is_empty() {
            warn!("no logs configured");
        }
        config
    }

    /// The password, if one is actually set.
    pub fn password(&self) -> Option<&str> {
        self.server_password.as_deref().filter(|p| !p.is_empty())
    }

    /// Resolves every entry into a [`Source`], filling in names and profiles.
    pub fn sources(&self) -> Vec<Source> {
        self.logs
            .iter()
            .enumerate()
            .map(|(index, entry)| Source::from_entry(index, entry))
            .collect()
    }
}

/// A configured file, identified by its position in the configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Source {
    pub index: usize,
    /// `None` when the entry has no path; such a source is listed but never
    /// followed.
    pub path: Option<PathBuf>,
    pub name: String,
    pub profile: String,
}

impl Source {
    fn from_entry(index: usize, entry: &LogEntry) -> Self {
        let path = Some(entry.path.trim())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let name = if !entry.name.is_empty() {
            entry.name.clone()
        } else {
            path.as_deref()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("Unnamed log #{}", index + 1))
        };

        let profile = if entry.profile.is_empty() {
            DEFAULT_PROFILE.to_string()
        } else {
            entry.profile.clone()
        };

        Source {
            index,
            path,
            name,
            profile,
        }
    }
}

/// How to display lines matching `keyword`. Rules are applied in the
/// browser.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct HighlightRule {
    pub keyword: String,
    pub color: String,
    pub dot: String,
    /// Treat `keyword` as a regular expression.
    pub use_regex: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub blink: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_msg: Option<String>,
}

/// Rule sets by profile name, loaded once at startup.
#[derive(Clone, Debug, Default)]
pub struct Profiles {
    rules: HashMap<String, Vec<HighlightRule>>,
}

impl Profiles {
    pub fn from_map(rules: HashMap<String, Vec<HighlightRule>>) -> Self {
        Profiles { rules }
    }

    /// Loads `<dir>/<name>.json` for every profile the sources refer to.
    ///
    /// A profile without a file takes the `default` rules; a missing
    /// `default` is an empty rule set. A file that doesn't parse is an empty
    /// rule set for that profile.
    pub fn load(dir: impl AsRef<Path>, sources: &[Source]) -> Self {
        let dir = dir.as_ref();
        let mut profiles = Profiles::default();

        for source in sources {
            profiles.resolve(dir, &source.profile);
        }
        profiles
    }

    fn resolve(&mut self, dir: &Path, name: &str) {
        if self.rules.contains_key(name) {
            return;
        }

        let path = dir.join(format!("{}.json", name));
        let rules = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Vec<HighlightRule>>(&text) {
                Ok(rules) => rules,
                Err(e) => {
                    warn!(profile = name, error = %e, "unparseable profile, using no rules");
                    Vec::new()
                }
            },
            Err(_) if name != DEFAULT_PROFILE => {
                warn!(profile = name, "profile not found, falling back to '{}'", DEFAULT_PROFILE);
                self.resolve(dir, DEFAULT_PROFILE);
                self.default_rules().to_vec()
            }
            Err(_) => {
                warn!(path = %path.display(), "default profile not found, using no rules");
                Vec::new()
            }
        };

        info!(profile = name, rules = rules.len(), "profile loaded");
        self.rules.insert(name.to_string(), rules);
    }

    fn default_rules(&self) -> &[HighlightRule] {
        self.rules
            .get(DEFAULT_PROFILE)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Rules for `name`, or the `default` rules if it was never loaded.
    pub fn rules(&self, name: &str) -> &[HighlightRule] {
        self.rules
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_else(|| self.default_rules())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
