//! Mount state probing.
//!
//! The kernel mount table is the only authority on what is mounted. Nothing
//! here is cached; every call re-reads the table so that state left behind by
//! a crashed or restarted agent is seen as it really is.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};
use crate::options::MountOptions;

/// Default location of the calling process's mount table.
pub const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Filesystem type reported by the kernel CephFS client.
pub const CEPH_FSTYPE: &str = "ceph";

/// A single line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
    pub options: Vec<String>,
}

impl MountEntry {
    /// Parses one mount table line.
    ///
    /// Returns `None` for blank or truncated lines.
    pub fn from_line(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let source = fields.next()?;
        let mountpoint = fields.next()?;
        let fstype = fields.next()?;
        let options = fields.next()?;

        Some(Self {
            source: unescape_mount_field(source),
            mountpoint: PathBuf::from(unescape_mount_field(mountpoint)),
            fstype: fstype.to_string(),
            options: options.split(',').map(str::to_string).collect(),
        })
    }

    /// Whether the entry is a kernel CephFS mount (`ceph`, or a `ceph.*` subtype).
    pub fn is_ceph(&self) -> bool {
        is_ceph_fstype(&self.fstype)
    }
}

fn is_ceph_fstype(fstype: &str) -> bool {
    fstype == CEPH_FSTYPE || fstype.starts_with("ceph.")
}

/// Unescapes the octal sequences the kernel uses in mount table fields.
///
/// Space, tab, newline and backslash appear as `\040`, `\011`, `\012` and `\134`.
fn unescape_mount_field(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
            && let Ok(byte) = u8::from_str_radix(&input[i + 1..=i + 3], 8)
        {
            result.push(byte);
            i += 4;
            continue;
        }
        result.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&result).into_owned()
}

/// Parses the full contents of a mount table.
pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content.lines().filter_map(MountEntry::from_line).collect()
}

/// Observed state of one mountpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedMountState {
    pub mountpoint: PathBuf,
    pub mounted: bool,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub fstype: String,
    #[serde(default)]
    pub options: BTreeSet<String>,
}

impl ObservedMountState {
    /// Nothing mounted at `mountpoint`.
    pub fn unmounted(mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            mounted: false,
            source: String::new(),
            fstype: String::new(),
            options: BTreeSet::new(),
        }
    }

    /// Observed state from a mount table entry.
    pub fn from_entry(entry: &MountEntry) -> Self {
        Self {
            mountpoint: entry.mountpoint.clone(),
            mounted: true,
            source: entry.source.clone(),
            fstype: entry.fstype.clone(),
            options: entry.options.iter().cloned().collect(),
        }
    }

    /// Whether a CephFS share is mounted here.
    pub fn is_ceph(&self) -> bool {
        self.mounted && is_ceph_fstype(&self.fstype)
    }

    /// The policy-controlled flags currently in effect.
    pub fn policy_options(&self) -> MountOptions {
        MountOptions::from_kernel_options(self.options.iter().map(String::as_str))
    }
}

/// Read-only view of host mount state.
pub trait MountProbe {
    /// Observes what is mounted at `mountpoint`.
    fn observe(&self, mountpoint: &Path) -> Result<ObservedMountState>;

    /// Lists every CephFS mount on the host.
    fn ceph_mounts(&self) -> Result<Vec<MountEntry>>;
}

/// Probe backed by a kernel mount table file.
#[derive(Debug, Clone)]
pub struct MountTable {
    path: PathBuf,
}

impl MountTable {
    /// Probe over [`PROC_MOUNTS`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a different mount table (e.g. `/proc/1/mounts` or a test fixture).
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The mount table file being read.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entries(&self) -> Result<Vec<MountEntry>> {
        let content = fs::read_to_string(&self.path).mount_table_context(&self.path)?;
        Ok(parse_mount_table(&content))
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::with_path(PROC_MOUNTS)
    }
}

impl MountProbe for MountTable {
    fn observe(&self, mountpoint: &Path) -> Result<ObservedMountState> {
        // Later lines are mounted on top of earlier ones.
        let observed = self
            .entries()?
            .iter()
            .rev()
            .find(|entry| entry.mountpoint == mountpoint)
            .map(ObservedMountState::from_entry)
            .unwrap_or_else(|| ObservedMountState::unmounted(mountpoint));
        Ok(observed)
    }

    fn ceph_mounts(&self) -> Result<Vec<MountEntry>> {
        Ok(self.entries()?.into_iter().filter(MountEntry::is_ceph).collect())
    }
}
