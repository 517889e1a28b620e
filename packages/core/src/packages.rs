//! Host helper packages needed by the kernel CephFS client.

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::executor::ExecutionContext;

/// Packages providing `mount.ceph` and friends.
pub const HELPER_PACKAGES: [&str; 1] = ["ceph-common"];

/// Installs the helper packages from the apt archive.
pub fn install(ctx: &ExecutionContext) -> Result<()> {
    info!(packages = ?HELPER_PACKAGES, "installing helper packages");
    ctx.run_checked("apt-get", &["-q", "update"])?;

    let mut args = vec!["-q", "-y", "install"];
    args.extend(HELPER_PACKAGES);
    ctx.run_checked("apt-get", &args)?;
    Ok(())
}

/// Removes the helper packages. Packages apt does not know are skipped.
pub fn remove(ctx: &ExecutionContext) -> Result<()> {
    info!(packages = ?HELPER_PACKAGES, "removing helper packages");

    let mut args = vec!["-q", "-y", "remove"];
    args.extend(HELPER_PACKAGES);
    match ctx.run_checked("apt-get", &args) {
        Ok(_) => Ok(()),
        Err(Error::CommandExit { stderr, .. }) if is_unknown_package(&stderr) => {
            warn!(%stderr, "skipping packages that are not installed");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn is_unknown_package(stderr: &str) -> bool {
    stderr.contains("Unable to locate package") || stderr.contains("is not installed")
}
