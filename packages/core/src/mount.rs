//! Mount operations module.
//!
//! This module is the effect boundary towards the host: one call is one
//! `mount` or `umount` invocation. Failures are classified but never retried
//! here; the next event re-runs reconciliation instead.

use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::desired::DesiredMountSpec;
use crate::error::{Error, IoResultExt, MountFailureKind, Result};
use crate::executor::ExecutionContext;

/// Secret file directory used when the agent runs as root.
pub const SYSTEM_SECRET_DIR: &str = "/etc/ceph/cephfs-client";

/// Default secret file directory: [`SYSTEM_SECRET_DIR`] for root, the user's
/// runtime or state directory otherwise.
pub fn default_secret_dir() -> PathBuf {
    if nix::unistd::geteuid().is_root() {
        return PathBuf::from(SYSTEM_SECRET_DIR);
    }
    dirs::runtime_dir()
        .or_else(dirs::state_dir)
        .map(|dir| dir.join("cephfs-client").join("secrets"))
        .unwrap_or_else(|| PathBuf::from(SYSTEM_SECRET_DIR))
}

/// Issues mount and unmount calls to the host.
pub trait MountExecutor {
    /// Mounts `spec.source` on `spec.target`.
    fn mount(&mut self, spec: &DesiredMountSpec) -> Result<()>;

    /// Unmounts whatever is mounted on `mountpoint`.
    fn unmount(&mut self, mountpoint: &Path) -> Result<()>;
}

/// Executor backed by `mount(8)` and `umount(8)`.
///
/// The cephx secret is written to a 0600 file under the secret directory for
/// the duration of the `mount` call and passed as `secretfile=`.
#[derive(Debug, Clone)]
pub struct SystemMounter {
    ctx: ExecutionContext,
    secret_dir: PathBuf,
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self::new(ExecutionContext::default())
    }
}

impl SystemMounter {
    /// Mounter using `ctx` for host commands and [`default_secret_dir`].
    pub fn new(ctx: ExecutionContext) -> Self {
        Self {
            ctx,
            secret_dir: default_secret_dir(),
        }
    }

    /// Keeps secret files in `dir` instead. The path must not contain commas.
    pub fn with_secret_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.secret_dir = dir.into();
        self
    }

    /// The command execution context.
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Directory holding secret files while a mount is in progress.
    pub fn secret_dir(&self) -> &Path {
        &self.secret_dir
    }

    fn create_mount_point(&self, path: &Path) -> Result<()> {
        if path.is_dir() {
            debug!(mountpoint = %path.display(), "mountpoint already exists");
            return Ok(());
        }
        if self.ctx.is_direct() {
            fs::create_dir_all(path).mount_point_context(path)?;
        } else {
            self.ctx.create_dir(&path.to_string_lossy())?;
        }
        debug!(mountpoint = %path.display(), "created mountpoint");
        Ok(())
    }

    /// Removes the (now empty) mountpoint directory. Non-empty or busy
    /// directories are left alone.
    fn remove_mount_point(&self, path: &Path) {
        let removed = if self.ctx.is_direct() {
            fs::remove_dir(path).map_err(|e| e.to_string())
        } else {
            self.ctx
                .remove_dir(&path.to_string_lossy())
                .map_err(|e| e.to_string())
        };
        if let Err(reason) = removed {
            debug!(mountpoint = %path.display(), %reason, "left mountpoint directory in place");
        }
    }

    /// One file per mountpoint, named after a digest of its path.
    fn secret_path(&self, target: &Path) -> PathBuf {
        let digest = hex::encode(Sha256::digest(target.to_string_lossy().as_bytes()));
        self.secret_dir.join(format!("{}.secret", &digest[..16]))
    }

    fn write_secret_file(&self, spec: &DesiredMountSpec) -> Result<PathBuf> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.secret_dir)
            .secret_file_context(&self.secret_dir)?;

        let path = self.secret_path(&spec.target);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .secret_file_context(&path)?;
        // An existing file keeps its old mode on open
        file.set_permissions(Permissions::from_mode(0o600))
            .secret_file_context(&path)?;
        file.write_all(spec.connection.secret.expose().as_bytes())
            .secret_file_context(&path)?;
        Ok(path)
    }

    fn remove_secret_file(&self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove secret file"),
        }
    }

    fn run_mount(&self, spec: &DesiredMountSpec, secret_file: &Path) -> Result<()> {
        let target = spec.target.to_string_lossy();
        info!(
            source = %spec.source,
            mountpoint = %target,
            options = %spec.options,
            "mounting CephFS share"
        );
        let data = spec.mount_data(secret_file);
        let output = self.ctx.run(
            "mount",
            &[
                "-t",
                spec.fstype.as_str(),
                spec.source.as_str(),
                target.as_ref(),
                "-o",
                data.as_str(),
            ],
        )?;

        if !output.success() {
            let mut kind = MountFailureKind::classify(&output.stderr);
            let mut message = output.failure_message("mount");

            if kind == MountFailureKind::PermissionDenied && inside_container() {
                kind = MountFailureKind::Unsupported;
                message = "Mounting CephFS shares not supported inside containers".to_string();
            }

            warn!(mountpoint = %target, %kind, %message, "mount failed");
            return Err(Error::Mount {
                target: spec.target.clone(),
                kind,
                message,
            });
        }
        Ok(())
    }
}

impl MountExecutor for SystemMounter {
    fn mount(&mut self, spec: &DesiredMountSpec) -> Result<()> {
        self.create_mount_point(&spec.target)
            .map_err(|e| as_mount_error(&spec.target, e))?;
        let secret_file = self
            .write_secret_file(spec)
            .map_err(|e| as_mount_error(&spec.target, e))?;

        // mount.ceph hands the key to the kernel; the file is not needed after.
        let mounted = self.run_mount(spec, &secret_file);
        self.remove_secret_file(&secret_file);
        mounted.map_err(|e| as_mount_error(&spec.target, e))
    }

    fn unmount(&mut self, mountpoint: &Path) -> Result<()> {
        let target = mountpoint.to_string_lossy();
        info!(mountpoint = %target, "unmounting CephFS share");

        let output = match self.ctx.run("umount", &[target.as_ref()]) {
            Ok(output) => output,
            Err(e) => {
                let (kind, message) = classify_error(&e);
                return Err(Error::Unmount {
                    path: mountpoint.to_path_buf(),
                    kind,
                    message,
                });
            }
        };
        if !output.success() {
            let kind = MountFailureKind::classify(&output.stderr);
            let message = output.failure_message("umount");

            warn!(mountpoint = %target, %kind, %message, "unmount failed");
            return Err(Error::Unmount {
                path: mountpoint.to_path_buf(),
                kind,
                message,
            });
        }

        self.remove_mount_point(mountpoint);
        Ok(())
    }
}

/// Turns a local failure around a mount call into [`Error::Mount`].
fn as_mount_error(target: &Path, e: Error) -> Error {
    if matches!(e, Error::Mount { .. }) {
        return e;
    }
    let (kind, message) = classify_error(&e);
    Error::Mount {
        target: target.to_path_buf(),
        kind,
        message,
    }
}

fn classify_error(e: &Error) -> (MountFailureKind, String) {
    match e {
        // The helper binary (or the escalation wrapper) is missing
        Error::CommandExecution { source, .. } if source.kind() == ErrorKind::NotFound => {
            (MountFailureKind::Unsupported, format!("{e}: {source}"))
        }
        Error::CommandExecution { source, .. }
        | Error::SecretFileWrite { source, .. } => {
            let message = format!("{e}: {source}");
            (MountFailureKind::classify(&message), message)
        }
        Error::MountPointCreation { path, source } => {
            let message = format!("cannot create mountpoint {}: {source}", path.display());
            (MountFailureKind::classify(&message), message)
        }
        Error::AuthenticationCancelled => (MountFailureKind::PermissionDenied, e.to_string()),
        other => {
            let message = other.cause();
            (MountFailureKind::classify(&message), message)
        }
    }
}

impl MountFailureKind {
    /// Classifies a mount helper's error output.
    pub fn classify(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if any(&[
            "permission denied",
            "operation not permitted",
            "must be superuser",
            "only root",
        ]) {
            Self::PermissionDenied
        } else if any(&["target is busy", "device or resource busy", "device busy"]) {
            Self::Busy
        } else if any(&["already mounted"]) {
            Self::AlreadyMounted
        } else if any(&["not mounted", "no mount point specified"]) {
            Self::NotMounted
        } else if any(&[
            "connection timed out",
            "connection refused",
            "no route to host",
            "host is down",
            "network is unreachable",
            "unable to get monitor info",
            "no such file or directory",
            "no mds server is up",
        ]) {
            Self::Unreachable
        } else {
            Self::Other
        }
    }
}

/// Whether the agent runs inside a container, where the kernel refuses
/// CephFS mounts regardless of privileges.
pub fn inside_container() -> bool {
    match ExecutionContext::new().run("systemd-detect-virt", &["--container"]) {
        Ok(output) => output.success() && !output.stdout.is_empty() && output.stdout != "none",
        Err(e) => {
            warn!(error = %e, "could not detect container virtualization");
            false
        }
    }
}
