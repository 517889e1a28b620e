//! Connection facts published over the share relation.
//!
//! The provider side publishes plain string values. This module turns them
//! into a [`ConnectionFacts`] value or nothing at all: a partially filled
//! structure is never handed to the reconciler.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};

/// Relation key holding the JSON list of monitor endpoints.
pub const MONITOR_ADDRESSES: &str = "monitor_addresses";
/// Relation key holding the Ceph cluster fsid.
pub const FS_ID: &str = "fs_id";
/// Relation key holding the cephx secret.
pub const AUTH_KEY: &str = "auth_key";
/// Relation key holding the exported path inside the filesystem.
pub const EXPORT_PATH: &str = "export_path";
/// Optional relation key naming the cephx client.
pub const AUTH_USER: &str = "auth_user";
/// Optional relation key selecting a named filesystem.
pub const FS_NAME: &str = "fs_name";

/// Client name used when the provider does not publish one.
pub const DEFAULT_AUTH_USER: &str = "admin";

/// A Ceph monitor endpoint (`ip:port`, IPv6 as `[addr]:port`).
///
/// Hostnames are rejected: `mount.ceph` resolves them before calling the
/// kernel, so the mount table would never show the source we asked for.
/// The address is kept in the form the kernel prints it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorAddr {
    pub host: String,
    pub port: u16,
}

impl FromStr for MonitorAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidFacts {
            message: format!("monitor address {s:?} is not ip:port"),
        };

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
            let host = host.parse::<Ipv6Addr>().map_err(|_| invalid())?;
            (host.to_string(), port)
        } else {
            let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
            let host = host.parse::<Ipv4Addr>().map_err(|_| invalid())?;
            (host.to_string(), port)
        };

        let port = port.parse::<u16>().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }

        Ok(Self { host, port })
    }
}

impl fmt::Display for MonitorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A cephx secret. Never shown by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthKey(String);

impl AuthKey {
    /// Wraps a raw cephx secret.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The secret in clear text.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthKey(<redacted>)")
    }
}

/// Everything needed to reach the exported share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFacts {
    pub monitor_addresses: Vec<MonitorAddr>,
    pub fs_id: String,
    pub auth_key: AuthKey,
    pub export_path: String,
    pub auth_user: String,
    pub fs_name: Option<String>,
}

/// Inbound share relation data.
///
/// `None` means there is no remote unit on the relation (never joined, or
/// departed).
#[derive(Debug, Clone, Default)]
pub struct ConnectionFactStore {
    remote: Option<BTreeMap<String, String>>,
}

impl ConnectionFactStore {
    /// Store over the remote data bag; `None` when no remote unit is present.
    pub fn new(remote: Option<BTreeMap<String, String>>) -> Self {
        Self { remote }
    }

    /// A relation with no remote unit.
    pub fn departed() -> Self {
        Self::default()
    }

    /// Parses the remote application's data bag from JSON.
    ///
    /// String values are taken verbatim; any other JSON value is kept in its
    /// serialized form, so `monitor_addresses` may arrive either as a JSON
    /// array or as a string holding one. A body that is not a JSON object is
    /// treated as "no usable data" and yields an empty bag.
    pub fn from_json(content: &str) -> Self {
        let object = match serde_json::from_str::<Value>(content) {
            Ok(Value::Object(object)) => object,
            Ok(_) | Err(_) => {
                warn!("share relation data is not a JSON object; ignoring it");
                return Self::new(Some(BTreeMap::new()));
            }
        };

        let data = object
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect();

        Self::new(Some(data))
    }

    /// Loads relation data from a file. A missing file means no remote unit.
    pub fn from_path(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Self::from_json(&content)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no share relation data file");
                Ok(Self::departed())
            }
            Err(e) => Err(e).input_context(path),
        }
    }

    /// Whether a remote unit is present on the relation.
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Returns the connection facts, or `None` unless every field is usable.
    pub fn facts(&self) -> Option<ConnectionFacts> {
        let Some(data) = &self.remote else {
            debug!("share relation has no remote unit");
            return None;
        };

        match parse_facts(data) {
            Ok(facts) => Some(facts),
            Err(e @ Error::IncompleteFacts { .. }) => {
                debug!(reason = %e, "share relation data incomplete");
                None
            }
            Err(e) => {
                warn!(error = %e, "share relation data rejected");
                None
            }
        }
    }
}

/// Validates a relation data bag into [`ConnectionFacts`].
pub fn parse_facts(data: &BTreeMap<String, String>) -> Result<ConnectionFacts> {
    let monitors_raw = required(data, MONITOR_ADDRESSES)?;
    let fs_id = required(data, FS_ID)?;
    let auth_key = required(data, AUTH_KEY)?;
    let export_path = required(data, EXPORT_PATH)?;

    let monitors: Vec<String> =
        serde_json::from_str(monitors_raw).map_err(|e| Error::InvalidFacts {
            message: format!("{MONITOR_ADDRESSES} is not a JSON list of strings: {e}"),
        })?;
    if monitors.is_empty() {
        return Err(Error::InvalidFacts {
            message: format!("{MONITOR_ADDRESSES} is empty"),
        });
    }
    let monitor_addresses = monitors
        .iter()
        .map(|m| m.parse::<MonitorAddr>())
        .collect::<Result<Vec<_>>>()?;

    if !export_path.starts_with('/') || export_path.chars().any(char::is_whitespace) {
        return Err(Error::InvalidFacts {
            message: format!("{EXPORT_PATH} {export_path:?} must be an absolute path"),
        });
    }

    let auth_user = match data.get(AUTH_USER).filter(|v| !v.is_empty()) {
        Some(user) => option_value(AUTH_USER, user)?,
        None => DEFAULT_AUTH_USER.to_string(),
    };
    let fs_name = data
        .get(FS_NAME)
        .filter(|v| !v.is_empty())
        .map(|name| option_value(FS_NAME, name))
        .transpose()?;

    Ok(ConnectionFacts {
        monitor_addresses,
        fs_id: option_value(FS_ID, fs_id)?,
        auth_key: AuthKey::new(option_value(AUTH_KEY, auth_key)?),
        export_path: export_path.to_string(),
        auth_user,
        fs_name,
    })
}

fn required<'a>(data: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
    data.get(key)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::IncompleteFacts {
            key: key.to_string(),
        })
}

/// Values that end up inside the comma separated mount data string.
fn option_value(key: &str, value: &str) -> Result<String> {
    let unsafe_char = |c: char| c == ',' || c.is_whitespace() || c.is_control();
    if value.chars().any(unsafe_char) {
        return Err(Error::InvalidFacts {
            message: format!("{key} contains characters not allowed in mount options"),
        });
    }
    Ok(value.to_string())
}
