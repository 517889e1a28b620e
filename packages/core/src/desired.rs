//! Desired mount specification.
//!
//! A [`DesiredMountSpec`] is derived from the connection facts and the mount
//! policy and from nothing else. If either input is missing there is no
//! desired mount.

use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::facts::{AuthKey, ConnectionFacts};
use crate::options::MountOptions;
use crate::policy::MountPolicy;
use crate::probe::{CEPH_FSTYPE, ObservedMountState};

/// Connection-level mount data (`name=`, `secretfile=`, `fsid=`, `mds_namespace=`).
///
/// The secret itself is handed to `mount.ceph` through a file, never on the
/// command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionOptions {
    pub name: String,
    #[serde(skip)]
    pub secret: AuthKey,
    pub fsid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mds_namespace: Option<String>,
}

impl ConnectionOptions {
    fn to_options(&self, secret_file: &Path) -> Vec<String> {
        let mut opts = vec![
            format!("name={}", self.name),
            format!("secretfile={}", secret_file.display()),
            format!("fsid={}", self.fsid),
        ];
        if let Some(namespace) = &self.mds_namespace {
            opts.push(format!("mds_namespace={namespace}"));
        }
        opts
    }
}

/// The mount that should exist on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DesiredMountSpec {
    /// Kernel device string: `mon1:port,mon2:port:/export/path`.
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    /// Policy flags, compared against the mount table.
    pub options: MountOptions,
    pub connection: ConnectionOptions,
}

impl DesiredMountSpec {
    /// Builds the spec, or `None` when either input is absent.
    pub fn from_inputs(
        facts: Option<&ConnectionFacts>,
        policy: Option<&MountPolicy>,
    ) -> Option<Self> {
        let (facts, policy) = (facts?, policy?);

        let monitors = facts
            .monitor_addresses
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        Some(Self {
            source: format!("{}:{}", monitors, facts.export_path),
            target: policy.mountpoint.clone(),
            fstype: CEPH_FSTYPE.to_string(),
            options: policy.options,
            connection: ConnectionOptions {
                name: facts.auth_user.clone(),
                secret: facts.auth_key.clone(),
                fsid: facts.fs_id.clone(),
                mds_namespace: facts.fs_name.clone(),
            },
        })
    }

    /// Full `-o` argument for `mount`: connection data first, then the
    /// policy flags in canonical order. `secret_file` must hold the secret.
    pub fn mount_data(&self, secret_file: &Path) -> String {
        let mut opts = self.connection.to_options(secret_file);
        opts.extend(self.options.flags().into_iter().map(str::to_string));
        opts.join(",")
    }

    /// Whether `observed` already satisfies this spec.
    ///
    /// Only the source and the policy flags are compared; the kernel adds
    /// options of its own and hides the secret.
    pub fn is_satisfied_by(&self, observed: &ObservedMountState) -> bool {
        observed.is_ceph()
            && observed.source == self.source
            && observed.policy_options() == self.options
    }

    /// Stable fingerprint of the spec, shared with peers.
    ///
    /// The secret contributes only through its own digest.
    pub fn fingerprint(&self) -> String {
        let secret_digest = hex::encode(Sha256::digest(self.connection.secret.expose().as_bytes()));
        let target = self.target.to_string_lossy();
        let options = self.options.to_option_string();

        let mut hasher = Sha256::new();
        for field in [
            self.source.as_str(),
            target.as_ref(),
            self.fstype.as_str(),
            options.as_str(),
            self.connection.name.as_str(),
            self.connection.fsid.as_str(),
            self.connection.mds_namespace.as_deref().unwrap_or_default(),
            secret_digest.as_str(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}
