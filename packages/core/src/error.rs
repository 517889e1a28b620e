//! Errors of the cephfs-client-core library.
//!
//! Most I/O happens against a handful of well-known files (the mount table,
//! peer records, input files), so each gets its own SNAFU context.

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::fmt;
use std::path::PathBuf;

/// Library result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classified cause of a failed mount or unmount call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountFailureKind {
    /// The caller lacks the privileges to (un)mount.
    PermissionDenied,
    /// The monitors or the exported path could not be reached.
    Unreachable,
    /// The target is in use.
    Busy,
    /// Something is already mounted on the target.
    AlreadyMounted,
    /// Nothing is mounted on the target.
    NotMounted,
    /// The host cannot mount CephFS at all (e.g. an unprivileged container).
    Unsupported,
    /// Anything the mount helper reported that we do not recognise.
    Other,
}

impl MountFailureKind {
    /// Short human-readable label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission denied",
            Self::Unreachable => "target unreachable",
            Self::Busy => "device busy",
            Self::AlreadyMounted => "already mounted",
            Self::NotMounted => "not mounted",
            Self::Unsupported => "unsupported host",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for MountFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the core library can fail with.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A host command could not be spawned.
    #[snafu(display("failed to run '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// A host command exited non-zero.
    #[snafu(display("'{command}' exited with code {code}: {stderr}"))]
    CommandExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The polkit prompt was dismissed.
    #[snafu(display("authentication was cancelled"))]
    AuthenticationCancelled,

    /// The kernel mount table could not be read.
    #[snafu(display("failed to read mount table at {}", path.display()))]
    MountTableRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The mountpoint directory could not be created.
    #[snafu(display("failed to create mountpoint {}", path.display()))]
    MountPointCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The cephx secret could not be written for `mount.ceph`.
    #[snafu(display("failed to write secret file {}", path.display()))]
    SecretFileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// `mount` failed.
    #[snafu(display("failed to mount {} ({kind}): {message}", target.display()))]
    Mount {
        target: PathBuf,
        kind: MountFailureKind,
        message: String,
    },

    /// `umount` failed.
    #[snafu(display("failed to unmount {} ({kind}): {message}", path.display()))]
    Unmount {
        path: PathBuf,
        kind: MountFailureKind,
        message: String,
    },

    /// A required relation key is missing.
    #[snafu(display("share relation is missing '{key}'"))]
    IncompleteFacts { key: String },

    /// Relation data is present but malformed.
    #[snafu(display("invalid share relation data: {message}"))]
    InvalidFacts { message: String },

    /// Local configuration holds an unusable value.
    #[snafu(display("invalid mount policy: {message}"))]
    InvalidPolicy { message: String },

    /// An input file could not be read.
    #[snafu(display("failed to read input at {}", path.display()))]
    InputRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to read a peer record.
    #[snafu(display("failed to read peer record at {}", path.display()))]
    PeerStoreRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write a peer record.
    #[snafu(display("failed to write peer record at {}", path.display()))]
    PeerStoreWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A peer record on disk is not valid JSON.
    #[snafu(display("failed to parse peer record at {}", path.display()))]
    PeerRecordParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// A peer record could not be encoded.
    #[snafu(display("failed to encode peer record for {unit}"))]
    PeerRecordEncode {
        unit: String,
        source: serde_json::Error,
    },
}

impl Error {
    /// Returns the failure classification for mount and unmount errors.
    pub fn failure_kind(&self) -> Option<MountFailureKind> {
        match self {
            Error::Mount { kind, .. } | Error::Unmount { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Short cause suitable for the unit status line.
    ///
    /// Mount helpers already phrase their own messages, so those are passed
    /// through as-is; everything else uses the display form.
    pub fn cause(&self) -> String {
        match self {
            Error::Mount { message, .. } | Error::Unmount { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Attaches the file or command an `io::Error` came from.
pub trait IoResultExt<T> {
    /// Spawning `command` failed.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for mount table read errors.
    fn mount_table_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Creating the mountpoint at `path` failed.
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Writing the secret file at `path` failed.
    fn secret_file_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for relation/config input read errors.
    fn input_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for peer record read errors.
    fn peer_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for peer record write errors.
    fn peer_write_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn mount_table_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountTableReadSnafu { path: path.into() })
    }

    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointCreationSnafu { path: path.into() })
    }

    fn secret_file_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(SecretFileWriteSnafu { path: path.into() })
    }

    fn input_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(InputReadSnafu { path: path.into() })
    }

    fn peer_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(PeerStoreReadSnafu { path: path.into() })
    }

    fn peer_write_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(PeerStoreWriteSnafu { path: path.into() })
    }
}
