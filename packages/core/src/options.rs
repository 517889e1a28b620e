//! Mount option encoding for the local mount policy.
//!
//! The policy flags are rendered in a fixed canonical order so that the
//! options handed to `mount` are stable across invocations, and the kernel's
//! option list can be folded back into the same shape for comparison.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical order of the managed flags.
pub const MANAGED_FLAGS: [&str; 4] = ["noexec", "nosuid", "nodev", "ro"];

/// Policy-controlled mount flags.
///
/// All flags off means "no flags appended", so the encoded option string is
/// empty rather than `exec,suid,dev,rw`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountOptions {
    pub noexec: bool,
    pub nosuid: bool,
    pub nodev: bool,
    pub read_only: bool,
}

impl MountOptions {
    /// Returns the enabled flags in canonical order.
    pub fn flags(&self) -> Vec<&'static str> {
        let enabled = [self.noexec, self.nosuid, self.nodev, self.read_only];
        MANAGED_FLAGS
            .iter()
            .zip(enabled)
            .filter_map(|(flag, on)| on.then_some(*flag))
            .collect()
    }

    /// Encodes the enabled flags as a comma separated option string.
    pub fn to_option_string(&self) -> String {
        self.flags().join(",")
    }

    /// Folds a kernel option list into the managed flags.
    ///
    /// Options the policy does not control (`relatime`, `name=`, `acl`, ...)
    /// are ignored; `rw` simply leaves `read_only` unset.
    pub fn from_kernel_options<'a, I>(options: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut result = Self::default();
        for option in options {
            match option {
                "noexec" => result.noexec = true,
                "nosuid" => result.nosuid = true,
                "nodev" => result.nodev = true,
                "ro" => result.read_only = true,
                _ => {}
            }
        }
        result
    }

    /// Lists the managed flags whose value differs between `self` and `other`.
    pub fn differing_flags(&self, other: &MountOptions) -> Vec<&'static str> {
        let ours = [self.noexec, self.nosuid, self.nodev, self.read_only];
        let theirs = [other.noexec, other.nosuid, other.nodev, other.read_only];
        MANAGED_FLAGS
            .iter()
            .zip(ours.iter().zip(theirs))
            .filter_map(|(flag, (a, b))| (*a != b).then_some(*flag))
            .collect()
    }
}

impl fmt::Display for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_option_string())
    }
}
