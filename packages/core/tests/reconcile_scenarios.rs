//! End-to-end reconciliation scenarios against a simulated host.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cephfs_client_core::desired::DesiredMountSpec;
use cephfs_client_core::error::{Error, MountFailureKind, Result};
use cephfs_client_core::facts::ConnectionFactStore;
use cephfs_client_core::mount::MountExecutor;
use cephfs_client_core::peer::{
    FilePeerStore, LastAction, MemoryPeerStore, PeerCoordinator, PeerStore, UnitMountRecord,
};
use cephfs_client_core::policy::{PolicyConfig, PolicyStore};
use cephfs_client_core::probe::{MountEntry, MountProbe, ObservedMountState};
use cephfs_client_core::reconcile::{Reconciler, UnitState, UnitStatus};

const UNIT: &str = "cephfs-client/0";

// ============================================================================
// Simulated host
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Mount {
        source: String,
        target: PathBuf,
        options: String,
    },
    Unmount(PathBuf),
}

#[derive(Debug, Default)]
struct HostState {
    mounts: BTreeMap<PathBuf, ObservedMountState>,
    calls: Vec<Call>,
    mount_failures: Vec<Error>,
    unmount_failures: Vec<Error>,
    probe_broken: bool,
}

/// Shared host state behind both the probe and the executor.
#[derive(Debug, Clone, Default)]
struct FakeHost(Arc<Mutex<HostState>>);

impl FakeHost {
    fn new() -> Self {
        Self::default()
    }

    fn preload(&self, path: &str, fstype: &str, source: &str, options: &[&str]) {
        let state = ObservedMountState {
            mountpoint: PathBuf::from(path),
            mounted: true,
            source: source.to_string(),
            fstype: fstype.to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
        };
        self.0.lock().unwrap().mounts.insert(PathBuf::from(path), state);
    }

    fn fail_next_mount(&self, message: &str, kind: MountFailureKind) {
        self.0.lock().unwrap().mount_failures.push(Error::Mount {
            target: PathBuf::from("/data"),
            kind,
            message: message.to_string(),
        });
    }

    fn fail_next_unmount(&self, path: &str, message: &str) {
        self.0.lock().unwrap().unmount_failures.push(Error::Unmount {
            path: PathBuf::from(path),
            kind: MountFailureKind::classify(message),
            message: message.to_string(),
        });
    }

    fn break_probe(&self) {
        self.0.lock().unwrap().probe_broken = true;
    }

    fn repair_probe(&self) {
        self.0.lock().unwrap().probe_broken = false;
    }

    fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().calls.clone()
    }

    fn clear_calls(&self) {
        self.0.lock().unwrap().calls.clear();
    }

    fn is_mounted(&self, path: &str) -> bool {
        self.0.lock().unwrap().mounts.contains_key(Path::new(path))
    }
}

impl MountProbe for FakeHost {
    fn observe(&self, mountpoint: &Path) -> Result<ObservedMountState> {
        let host = self.0.lock().unwrap();
        if host.probe_broken {
            return Err(Error::MountTableRead {
                path: PathBuf::from("/proc/self/mounts"),
                source: std::io::Error::other("probe broken"),
            });
        }
        Ok(host
            .mounts
            .get(mountpoint)
            .cloned()
            .unwrap_or_else(|| ObservedMountState::unmounted(mountpoint)))
    }

    fn ceph_mounts(&self) -> Result<Vec<MountEntry>> {
        let host = self.0.lock().unwrap();
        Ok(host
            .mounts
            .values()
            .filter(|m| m.is_ceph())
            .map(|m| MountEntry {
                source: m.source.clone(),
                mountpoint: m.mountpoint.clone(),
                fstype: m.fstype.clone(),
                options: m.options.iter().cloned().collect(),
            })
            .collect())
    }
}

impl MountExecutor for FakeHost {
    fn mount(&mut self, spec: &DesiredMountSpec) -> Result<()> {
        let mut host = self.0.lock().unwrap();
        host.calls.push(Call::Mount {
            source: spec.source.clone(),
            target: spec.target.clone(),
            options: spec.options.to_option_string(),
        });
        if !host.mount_failures.is_empty() {
            return Err(host.mount_failures.remove(0));
        }

        let mut options: Vec<String> = spec.options.flags().iter().map(|f| f.to_string()).collect();
        if !spec.options.read_only {
            options.push("rw".to_string());
        }
        options.push("relatime".to_string());
        options.push(format!("name={}", spec.connection.name));
        host.mounts.insert(
            spec.target.clone(),
            ObservedMountState {
                mountpoint: spec.target.clone(),
                mounted: true,
                source: spec.source.clone(),
                fstype: spec.fstype.clone(),
                options: options.into_iter().collect(),
            },
        );
        Ok(())
    }

    fn unmount(&mut self, mountpoint: &Path) -> Result<()> {
        let mut host = self.0.lock().unwrap();
        host.calls.push(Call::Unmount(mountpoint.to_path_buf()));
        if !host.unmount_failures.is_empty() {
            return Err(host.unmount_failures.remove(0));
        }
        match host.mounts.remove(mountpoint) {
            Some(_) => Ok(()),
            None => Err(Error::Unmount {
                path: mountpoint.to_path_buf(),
                kind: MountFailureKind::NotMounted,
                message: "not mounted".to_string(),
            }),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn share() -> ConnectionFactStore {
    share_with_key("AQBsecret==")
}

fn share_with_key(key: &str) -> ConnectionFactStore {
    let data = [
        ("monitor_addresses", r#"["10.0.0.1:6789"]"#),
        ("fs_id", "abc"),
        ("auth_key", key),
        ("export_path", "/export/data"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    ConnectionFactStore::new(Some(data))
}

fn policy(mountpoint: &str) -> PolicyStore {
    PolicyStore::new(PolicyConfig {
        mountpoint: Some(mountpoint.to_string()),
        ..Default::default()
    })
}

fn reconciler(host: &FakeHost) -> Reconciler<FakeHost, FakeHost, MemoryPeerStore> {
    Reconciler::new(
        host.clone(),
        host.clone(),
        PeerCoordinator::new(UNIT, MemoryPeerStore::new()),
    )
}

fn mount_call(target: &str, options: &str) -> Call {
    Call::Mount {
        source: "10.0.0.1:6789:/export/data".to_string(),
        target: PathBuf::from(target),
        options: options.to_string(),
    }
}

fn unmount_call(target: &str) -> Call {
    Call::Unmount(PathBuf::from(target))
}

// ============================================================================
// Properties
// ============================================================================

#[test]
fn test_single_mount_with_default_options() {
    let host = FakeHost::new();
    let mut reconciler = reconciler(&host);

    let report = reconciler.reconcile(&share(), &policy("/data"));

    assert_eq!(host.calls(), vec![mount_call("/data", "")]);
    assert_eq!(report.state, UnitState::Mounted);
    assert_eq!(
        report.status,
        UnitStatus::Mounted {
            mountpoint: PathBuf::from("/data")
        }
    );
    assert_eq!(report.executed, 1);

    let record = report.record.unwrap();
    assert_eq!(record.generation, 1);
    assert_eq!(record.last_action, LastAction::Mount);
    assert_eq!(record.mountpoint, Some(PathBuf::from("/data")));
    assert!(record.is_converged());
}

#[test]
fn test_reconcile_is_idempotent() {
    let host = FakeHost::new();
    let mut reconciler = reconciler(&host);

    reconciler.reconcile(&share(), &policy("/data"));
    let second = reconciler.reconcile(&share(), &policy("/data"));

    assert_eq!(host.calls().len(), 1);
    assert!(second.actions.is_empty());
    assert_eq!(second.state, UnitState::Mounted);
    let record = second.record.unwrap();
    assert_eq!(record.generation, 2);
    assert_eq!(record.last_action, LastAction::Mount);
}

#[test]
fn test_absent_facts_unmount_once() {
    let host = FakeHost::new();
    host.preload("/data", "ceph", "10.0.0.1:6789:/export/data", &["rw", "relatime"]);
    let mut reconciler = reconciler(&host);

    let report = reconciler.reconcile(&ConnectionFactStore::departed(), &policy("/data"));

    assert_eq!(host.calls(), vec![unmount_call("/data")]);
    assert_eq!(report.state, UnitState::Idle);
    assert_eq!(
        report.status,
        UnitStatus::Idle {
            reason: "Waiting for CephFS share".to_string()
        }
    );
}

#[test]
fn test_mount_uses_canonical_option_order() {
    let host = FakeHost::new();
    let mut reconciler = reconciler(&host);
    let policy = PolicyStore::from_json(
        r#"{"mountpoint": "/data", "read-only": true, "nodev": true, "noexec": true, "nosuid": true}"#,
    );

    reconciler.reconcile(&share(), &policy);

    assert_eq!(host.calls(), vec![mount_call("/data", "noexec,nosuid,nodev,ro")]);
}

#[test]
fn test_option_change_unmounts_before_mounting() {
    let host = FakeHost::new();
    host.preload("/data", "ceph", "10.0.0.1:6789:/export/data", &["ro", "relatime"]);
    let mut reconciler = reconciler(&host);
    let policy = PolicyStore::from_json(r#"{"mountpoint": "/data", "read-only": true, "noexec": true}"#);

    let report = reconciler.reconcile(&share(), &policy);

    assert_eq!(report.planned, UnitState::NeedsRemount);
    assert_eq!(
        host.calls(),
        vec![unmount_call("/data"), mount_call("/data", "noexec,ro")]
    );
    assert_eq!(report.record.unwrap().last_action, LastAction::Remount);
}

#[test]
fn test_credential_rotation_does_not_remount() {
    let host = FakeHost::new();
    let mut reconciler = reconciler(&host);

    let first = reconciler.reconcile(&share(), &policy("/data"));
    let rotated = reconciler.reconcile(&share_with_key("AQBrotated=="), &policy("/data"));

    assert_eq!(host.calls().len(), 1);
    assert_ne!(
        first.record.unwrap().desired_spec_hash,
        rotated.record.unwrap().desired_spec_hash
    );
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_scenario_a_first_mount() {
    let host = FakeHost::new();
    let mut reconciler = reconciler(&host);
    let policy = PolicyStore::from_json(r#"{"mountpoint": "/data", "read-only": false}"#);

    reconciler.reconcile(&share(), &policy);

    assert_eq!(host.calls(), vec![mount_call("/data", "")]);
    assert!(host.is_mounted("/data"));
}

#[test]
fn test_scenario_b_relation_departs() {
    let host = FakeHost::new();
    let mut reconciler = reconciler(&host);
    let policy = PolicyStore::from_json(r#"{"mountpoint": "/data", "noexec": true}"#);

    reconciler.reconcile(&share(), &policy);
    assert_eq!(host.calls(), vec![mount_call("/data", "noexec")]);
    host.clear_calls();

    let report = reconciler.reconcile(&ConnectionFactStore::departed(), &policy);
    assert_eq!(host.calls(), vec![unmount_call("/data")]);
    assert!(!host.is_mounted("/data"));

    let record = report.record.unwrap();
    assert_eq!(record.last_action, LastAction::Unmount);
    assert_eq!(record.desired_spec_hash, None);
    assert_eq!(record.mountpoint, None);
}

#[test]
fn test_scenario_c_empty_mountpoint() {
    let host = FakeHost::new();
    let mut reconciler = reconciler(&host);

    let report = reconciler.reconcile(&share(), &policy(""));

    assert!(host.calls().is_empty());
    assert_eq!(report.state, UnitState::Idle);
    assert_eq!(
        report.status,
        UnitStatus::Idle {
            reason: "No configured mountpoint".to_string()
        }
    );
}

#[test]
fn test_scenario_d_failure_then_retry() {
    let host = FakeHost::new();
    host.fail_next_mount("device busy", MountFailureKind::Busy);
    let mut reconciler = reconciler(&host);

    let failed = reconciler.reconcile(&share(), &policy("/data"));
    assert_eq!(failed.state, UnitState::Error("device busy".to_string()));
    assert_eq!(failed.status.to_string(), "Error: device busy");
    assert_eq!(failed.executed, 0);
    assert_eq!(failed.record.unwrap().last_error.as_deref(), Some("device busy"));
    assert_eq!(
        reconciler.status(&share(), &policy("/data")),
        UnitStatus::Error {
            cause: "device busy".to_string()
        }
    );

    let retried = reconciler.reconcile(&share(), &policy("/data"));
    assert_eq!(
        host.calls(),
        vec![mount_call("/data", ""), mount_call("/data", "")]
    );
    assert_eq!(retried.state, UnitState::Mounted);
    assert_eq!(retried.record.unwrap().last_error, None);
}

// ============================================================================
// Edge cases
// ============================================================================

#[test]
fn test_mountpoint_change_unmounts_previous() {
    let host = FakeHost::new();
    let mut reconciler = reconciler(&host);

    reconciler.reconcile(&share(), &policy("/data"));
    host.clear_calls();

    let report = reconciler.reconcile(&share(), &policy("/srv/data"));
    assert_eq!(
        host.calls(),
        vec![unmount_call("/data"), mount_call("/srv/data", "")]
    );
    assert_eq!(report.state, UnitState::Mounted);
    assert_eq!(
        report.record.unwrap().mountpoint,
        Some(PathBuf::from("/srv/data"))
    );
}

#[test]
fn test_cleared_policy_unmounts_previous() {
    let host = FakeHost::new();
    let mut reconciler = reconciler(&host);

    reconciler.reconcile(&share(), &policy("/data"));
    host.clear_calls();

    let report = reconciler.reconcile(&share(), &PolicyStore::unset());
    assert_eq!(host.calls(), vec![unmount_call("/data")]);
    assert_eq!(
        report.status,
        UnitStatus::Idle {
            reason: "No configured mountpoint".to_string()
        }
    );

    reconciler.reconcile(&share(), &PolicyStore::unset());
    assert_eq!(host.calls().len(), 1);
}

#[test]
fn test_failed_unmount_keeps_previous_mountpoint() {
    let host = FakeHost::new();
    let mut reconciler = reconciler(&host);

    reconciler.reconcile(&share(), &policy("/data"));
    host.clear_calls();
    host.fail_next_unmount("/data", "umount: /data: target is busy.");

    let report = reconciler.reconcile(&share(), &policy("/srv/data"));
    assert_eq!(host.calls(), vec![unmount_call("/data")]);
    assert_eq!(
        report.state,
        UnitState::Error("umount: /data: target is busy.".to_string())
    );
    assert_eq!(report.record.unwrap().mountpoint, Some(PathBuf::from("/data")));
    host.clear_calls();

    let report = reconciler.reconcile(&share(), &policy("/srv/data"));
    assert_eq!(
        host.calls(),
        vec![unmount_call("/data"), mount_call("/srv/data", "")]
    );
    assert_eq!(report.state, UnitState::Mounted);
}

#[test]
fn test_foreign_filesystem_is_left_alone() {
    let host = FakeHost::new();
    host.preload("/data", "ext4", "/dev/sdb1", &["rw", "relatime"]);
    let mut reconciler = reconciler(&host);

    let report = reconciler.reconcile(&share(), &policy("/data"));
    assert!(host.calls().is_empty());
    assert_eq!(
        report.status,
        UnitStatus::Error {
            cause: "mountpoint occupied by ext4".to_string()
        }
    );

    let report = reconciler.reconcile(&ConnectionFactStore::departed(), &policy("/data"));
    assert!(host.calls().is_empty());
    assert_eq!(report.state, UnitState::Idle);
}

#[test]
fn test_probe_failure_takes_no_action() {
    let host = FakeHost::new();
    host.break_probe();
    let mut reconciler = reconciler(&host);

    let report = reconciler.reconcile(&share(), &policy("/data"));
    assert!(host.calls().is_empty());
    assert!(report.status.is_error());
    assert!(report.actions.is_empty());
    assert!(report.record.is_some());
}

#[test]
fn test_probe_failure_keeps_managed_mountpoint() {
    let host = FakeHost::new();
    let mut reconciler = reconciler(&host);

    reconciler.reconcile(&share(), &policy("/data"));
    host.clear_calls();
    host.break_probe();

    let report = reconciler.reconcile(&share(), &PolicyStore::unset());
    assert!(host.calls().is_empty());
    assert!(report.status.is_error());
    let record = report.record.unwrap();
    assert_eq!(record.mountpoint, Some(PathBuf::from("/data")));
    assert!(record.observed.is_some_and(|o| o.mounted));
    assert_eq!(record.last_action, LastAction::Mount);

    host.repair_probe();
    let report = reconciler.reconcile(&share(), &PolicyStore::unset());
    assert_eq!(host.calls(), vec![unmount_call("/data")]);
    assert!(!host.is_mounted("/data"));
    assert_eq!(report.state, UnitState::Idle);
}

#[test]
fn test_failed_mount_after_unmount_resumes_with_mount() {
    let host = FakeHost::new();
    host.preload("/data", "ceph", "10.0.0.1:6789:/export/data", &["ro", "relatime"]);
    let mut reconciler = reconciler(&host);
    let policy = PolicyStore::from_json(r#"{"mountpoint": "/data", "read-only": true, "noexec": true}"#);
    host.fail_next_mount("device busy", MountFailureKind::Busy);

    let failed = reconciler.reconcile(&share(), &policy);
    assert_eq!(failed.planned, UnitState::NeedsRemount);
    assert_eq!(failed.executed, 1);
    assert_eq!(failed.state, UnitState::Error("device busy".to_string()));
    assert!(!host.is_mounted("/data"));

    let resumed = reconciler.reconcile(&share(), &policy);
    assert_eq!(resumed.planned, UnitState::Mounting);
    assert_eq!(resumed.state, UnitState::Mounted);
    assert_eq!(
        host.calls(),
        vec![
            unmount_call("/data"),
            mount_call("/data", "noexec,ro"),
            mount_call("/data", "noexec,ro")
        ]
    );
    assert_eq!(resumed.record.unwrap().last_error, None);
}

#[test]
fn test_teardown_unmounts_and_reports_helpers() {
    let host = FakeHost::new();
    let mut reconciler = reconciler(&host);

    reconciler.reconcile(&share(), &policy("/data"));
    host.clear_calls();

    let teardown = reconciler.teardown(&policy("/data"));
    assert_eq!(host.calls(), vec![unmount_call("/data")]);
    assert!(teardown.helpers_removable);
    assert_eq!(
        teardown.report.status,
        UnitStatus::Idle {
            reason: "Unit stopping".to_string()
        }
    );
}

#[test]
fn test_teardown_keeps_helpers_for_other_mounts() {
    let host = FakeHost::new();
    host.preload("/backup", "ceph", "10.0.0.9:6789:/backup", &["rw"]);
    let mut reconciler = reconciler(&host);

    reconciler.reconcile(&share(), &policy("/data"));
    let teardown = reconciler.teardown(&PolicyStore::unset());

    assert!(!host.is_mounted("/data"));
    assert!(host.is_mounted("/backup"));
    assert!(!teardown.helpers_removable);
}

// ============================================================================
// Peer records
// ============================================================================

#[test]
fn test_divergent_peers_are_reported() {
    let host = FakeHost::new();
    let mut store = MemoryPeerStore::new();
    store
        .publish(&UnitMountRecord {
            desired_spec_hash: Some("deadbeef".to_string()),
            ..UnitMountRecord::new("cephfs-client/1")
        })
        .unwrap();
    let mut reconciler = Reconciler::new(host.clone(), host.clone(), PeerCoordinator::new(UNIT, store));

    let report = reconciler.reconcile(&share(), &policy("/data"));
    assert_eq!(report.divergent_peers, vec!["cephfs-client/1".to_string()]);
}

#[test]
fn test_restart_resumes_from_file_records() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new();

    let mut first = Reconciler::new(
        host.clone(),
        host.clone(),
        PeerCoordinator::new(UNIT, FilePeerStore::new(dir.path())),
    );
    first.reconcile(&share(), &policy("/data"));
    drop(first);

    // A fresh process with no memory: only the record says /data was ours.
    let mut restarted = Reconciler::new(
        host.clone(),
        host.clone(),
        PeerCoordinator::new(UNIT, FilePeerStore::new(dir.path())),
    );
    let report = restarted.reconcile(&share(), &PolicyStore::unset());

    assert_eq!(
        host.calls(),
        vec![mount_call("/data", ""), unmount_call("/data")]
    );
    assert_eq!(report.record.unwrap().generation, 2);
    assert!(dir.path().join("cephfs-client-0.json").exists());
}
