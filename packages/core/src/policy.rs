//! Local mount policy.
//!
//! Typed view over the unit's configuration (`mountpoint`, `noexec`,
//! `nosuid`, `nodev`, `read-only`). An unusable mountpoint makes the whole
//! policy unset; it is never replaced by a default.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};
use crate::options::MountOptions;

/// Raw configuration values as delivered by the host framework.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub mountpoint: Option<String>,
    #[serde(default)]
    pub noexec: bool,
    #[serde(default)]
    pub nosuid: bool,
    #[serde(default)]
    pub nodev: bool,
    #[serde(default, rename = "read-only")]
    pub read_only: bool,
}

/// A validated mount policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountPolicy {
    pub mountpoint: PathBuf,
    pub options: MountOptions,
}

/// Source of the local mount policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    config: Option<PolicyConfig>,
}

impl PolicyStore {
    /// Store over an already parsed configuration.
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config: Some(config),
        }
    }

    /// A store with no configuration at all.
    pub fn unset() -> Self {
        Self::default()
    }

    /// Parses configuration JSON. Malformed input yields an unset store.
    pub fn from_json(content: &str) -> Self {
        match serde_json::from_str::<PolicyConfig>(content) {
            Ok(config) => Self::new(config),
            Err(e) => {
                warn!(error = %e, "ignoring malformed mount configuration");
                Self::unset()
            }
        }
    }

    /// Loads configuration JSON from a file. A missing file is an unset store.
    pub fn from_path(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Self::from_json(&content)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no mount configuration file");
                Ok(Self::unset())
            }
            Err(e) => Err(e).input_context(path),
        }
    }

    /// The raw configuration, if any was supplied.
    pub fn config(&self) -> Option<&PolicyConfig> {
        self.config.as_ref()
    }

    /// Validates the configuration into a [`MountPolicy`].
    pub fn validate(&self) -> Result<MountPolicy> {
        let config = self.config.as_ref().ok_or_else(|| Error::InvalidPolicy {
            message: "no configuration".to_string(),
        })?;
        let raw = config.mountpoint.as_deref().unwrap_or_default();
        let mountpoint = validate_mountpoint(raw)?;

        Ok(MountPolicy {
            mountpoint,
            options: MountOptions {
                noexec: config.noexec,
                nosuid: config.nosuid,
                nodev: config.nodev,
                read_only: config.read_only,
            },
        })
    }

    /// Returns the policy, or `None` when it is unset or invalid.
    pub fn policy(&self) -> Option<MountPolicy> {
        match self.validate() {
            Ok(policy) => Some(policy),
            Err(e) => {
                if self.config.is_some() {
                    warn!(error = %e, "mount policy unusable; treating as unset");
                }
                None
            }
        }
    }
}

/// Checks that a configured mountpoint can be managed safely.
///
/// The path must be absolute, must not be `/`, must not contain `..`, and
/// must not contain whitespace or control characters.
pub fn validate_mountpoint(raw: &str) -> Result<PathBuf> {
    let invalid = |message: &str| Error::InvalidPolicy {
        message: format!("{message}: {raw:?}"),
    };

    if raw.is_empty() {
        return Err(Error::InvalidPolicy {
            message: "mountpoint is empty".to_string(),
        });
    }
    if !raw.starts_with('/') {
        return Err(invalid("mountpoint must be an absolute path"));
    }
    if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("mountpoint contains whitespace or control characters"));
    }

    let path = Path::new(raw);
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(invalid("mountpoint must not contain '..'"));
    }

    let normalized: PathBuf = path
        .components()
        .filter(|c| *c != Component::CurDir)
        .collect();
    if normalized == Path::new("/") {
        return Err(invalid("refusing to manage the root directory"));
    }

    Ok(normalized)
}
