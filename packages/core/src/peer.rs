//! Peer-shared unit mount records.
//!
//! Every unit owns exactly one record and is the only writer of it; every
//! unit may read all records. Records are advisory: they feed diagnostics and
//! tell a restarted unit which mountpoint it managed before, but the mount
//! table always decides what is actually mounted.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::error::{IoResultExt, PeerRecordEncodeSnafu, PeerRecordParseSnafu, Result};
use crate::probe::ObservedMountState;

/// Shared record directory used when the agent runs as root.
pub const SYSTEM_PEER_DIR: &str = "/var/lib/cephfs-client/peers";

/// Default record directory: [`SYSTEM_PEER_DIR`] for root, the user's state
/// directory otherwise.
pub fn default_peer_dir() -> PathBuf {
    if nix::unistd::geteuid().is_root() {
        return PathBuf::from(SYSTEM_PEER_DIR);
    }
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join("cephfs-client").join("peers"))
        .unwrap_or_else(|| PathBuf::from(SYSTEM_PEER_DIR))
}

/// The host operation a unit last attempted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastAction {
    #[default]
    None,
    Mount,
    Unmount,
    Remount,
}

/// One unit's view of its own mount, as last published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMountRecord {
    pub unit_id: String,
    /// Mountpoint the unit is responsible for, if any.
    #[serde(default)]
    pub mountpoint: Option<PathBuf>,
    /// Fingerprint of the desired spec; `None` when no mount is desired.
    #[serde(default)]
    pub desired_spec_hash: Option<String>,
    /// Mount table view right after the last reconciliation.
    #[serde(default)]
    pub observed: Option<ObservedMountState>,
    /// Derived state name (`idle`, `mounted`, `error`, ...).
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub last_action: LastAction,
    #[serde(default)]
    pub last_error: Option<String>,
    pub generation: u64,
}

impl UnitMountRecord {
    /// An empty record for `unit_id` at generation zero.
    pub fn new(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            mountpoint: None,
            desired_spec_hash: None,
            observed: None,
            state: String::new(),
            last_action: LastAction::None,
            last_error: None,
            generation: 0,
        }
    }

    /// Whether the unit reported its desired mount as in place.
    pub fn is_converged(&self) -> bool {
        self.last_error.is_none()
            && self.desired_spec_hash.is_some()
            && self.observed.as_ref().is_some_and(|o| o.mounted)
    }
}

/// Key-value store of unit records.
pub trait PeerStore {
    /// Writes (replaces) the record keyed by `record.unit_id`.
    fn publish(&mut self, record: &UnitMountRecord) -> Result<()>;

    /// Reads every unit's record.
    fn read_all(&self) -> Result<BTreeMap<String, UnitMountRecord>>;

    /// Reads a single unit's record.
    fn read(&self, unit_id: &str) -> Result<Option<UnitMountRecord>> {
        Ok(self.read_all()?.remove(unit_id))
    }
}

/// In-process store, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryPeerStore {
    records: BTreeMap<String, UnitMountRecord>,
}

impl MemoryPeerStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerStore for MemoryPeerStore {
    fn publish(&mut self, record: &UnitMountRecord) -> Result<()> {
        self.records.insert(record.unit_id.clone(), record.clone());
        Ok(())
    }

    fn read_all(&self) -> Result<BTreeMap<String, UnitMountRecord>> {
        Ok(self.records.clone())
    }
}

/// Store keeping one JSON file per unit in a shared directory.
///
/// Writes go to a temporary file that is renamed into place, so readers see
/// either the old or the new record.
#[derive(Debug, Clone)]
pub struct FilePeerStore {
    dir: PathBuf,
}

impl FilePeerStore {
    /// Store rooted at `dir`; the directory is created on first publish.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The record directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the record of `unit_id` (`app/0` is stored as `app-0.json`).
    pub fn record_path(&self, unit_id: &str) -> PathBuf {
        let name: String = unit_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    fn read_record(path: &Path) -> Result<UnitMountRecord> {
        let content = fs::read_to_string(path).peer_read_context(path)?;
        serde_json::from_str(&content).context(PeerRecordParseSnafu { path })
    }
}

impl PeerStore for FilePeerStore {
    fn publish(&mut self, record: &UnitMountRecord) -> Result<()> {
        fs::create_dir_all(&self.dir).peer_write_context(&self.dir)?;

        let path = self.record_path(&record.unit_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record).context(PeerRecordEncodeSnafu {
            unit: record.unit_id.clone(),
        })?;

        let mut file = fs::File::create(&tmp).peer_write_context(&tmp)?;
        file.write_all(&body).peer_write_context(&tmp)?;
        file.sync_all().peer_write_context(&tmp)?;
        fs::rename(&tmp, &path).peer_write_context(&path)?;

        debug!(unit = %record.unit_id, generation = record.generation, "published unit record");
        Ok(())
    }

    fn read_all(&self) -> Result<BTreeMap<String, UnitMountRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e).peer_read_context(&self.dir),
        };

        let mut records = BTreeMap::new();
        for entry in entries {
            let path = entry.peer_read_context(&self.dir)?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            // A torn or foreign file must not hide every other unit's record.
            match Self::read_record(&path) {
                Ok(record) => {
                    records.insert(record.unit_id.clone(), record);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable unit record"),
            }
        }
        Ok(records)
    }

    fn read(&self, unit_id: &str) -> Result<Option<UnitMountRecord>> {
        let path = self.record_path(unit_id);
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .context(PeerRecordParseSnafu { path }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).peer_read_context(&path),
        }
    }
}

/// A unit's handle on the peer group.
#[derive(Debug)]
pub struct PeerCoordinator<S> {
    unit_id: String,
    store: S,
}

impl<S: PeerStore> PeerCoordinator<S> {
    /// Coordinator for `unit_id` backed by `store`.
    pub fn new(unit_id: impl Into<String>, store: S) -> Self {
        Self {
            unit_id: unit_id.into(),
            store,
        }
    }

    /// This unit's identifier.
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    /// The underlying record store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// This unit's last published record. Read failures count as "no record".
    pub fn previous(&self) -> Option<UnitMountRecord> {
        match self.store.read(&self.unit_id) {
            Ok(record) => record,
            Err(e) => {
                warn!(unit = %self.unit_id, error = %e, "could not read own unit record");
                None
            }
        }
    }

    /// Publishes `record` for this unit with the next generation number.
    pub fn record(&mut self, mut record: UnitMountRecord) -> Result<UnitMountRecord> {
        let generation = self.previous().map_or(0, |r| r.generation);
        record.unit_id = self.unit_id.clone();
        record.generation = generation + 1;
        self.store.publish(&record)?;
        Ok(record)
    }

    /// Every unit's record, this unit included.
    pub fn read_all(&self) -> Result<BTreeMap<String, UnitMountRecord>> {
        self.store.read_all()
    }

    /// Other units whose desired spec differs from `desired_hash`.
    pub fn divergent_units(&self, desired_hash: Option<&str>) -> Vec<String> {
        match self.store.read_all() {
            Ok(records) => records
                .values()
                .filter(|r| r.unit_id != self.unit_id)
                .filter(|r| r.desired_spec_hash.as_deref() != desired_hash)
                .map(|r| r.unit_id.clone())
                .collect(),
            Err(e) => {
                warn!(error = %e, "could not read peer records");
                Vec::new()
            }
        }
    }
}
