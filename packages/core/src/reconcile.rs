//! The reconciliation state machine.
//!
//! [`plan`] is a pure function from the desired spec and freshly probed host
//! state to an ordered list of actions. [`Reconciler`] wires it to the
//! stores, the probe, the executor and the peer group: one call, one pass,
//! no retries and no memory carried between calls other than the unit's own
//! peer record.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::desired::DesiredMountSpec;
use crate::error::Result;
use crate::facts::{ConnectionFactStore, ConnectionFacts};
use crate::mount::MountExecutor;
use crate::peer::{LastAction, PeerCoordinator, PeerStore, UnitMountRecord};
use crate::policy::{MountPolicy, PolicyStore};
use crate::probe::{MountProbe, ObservedMountState};

const NO_MOUNTPOINT: &str = "No configured mountpoint";
const WAITING_FOR_SHARE: &str = "Waiting for CephFS share";
const STOPPING: &str = "Unit stopping";

/// A single host operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Mount { spec: DesiredMountSpec },
    Unmount { mountpoint: PathBuf },
}

impl Action {
    /// The mountpoint the action operates on.
    pub fn mountpoint(&self) -> &Path {
        match self {
            Action::Mount { spec } => &spec.target,
            Action::Unmount { mountpoint } => mountpoint,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Mount { spec } => write!(f, "mount {} on {}", spec.source, spec.target.display()),
            Action::Unmount { mountpoint } => write!(f, "unmount {}", mountpoint.display()),
        }
    }
}

/// Derived unit state. Never stored, always recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "cause", rename_all = "snake_case")]
pub enum UnitState {
    /// Nothing desired and nothing of ours mounted.
    Idle,
    /// Desired but not mounted; a mount is planned.
    Mounting,
    /// Mounted with the desired source and options.
    Mounted,
    /// Mounted, but source or options differ; unmount then mount.
    NeedsRemount,
    /// Mounted but no longer desired.
    Unmounting,
    Error(String),
}

impl UnitState {
    /// Stable snake_case name, as stored in the unit record.
    pub fn name(&self) -> &'static str {
        match self {
            UnitState::Idle => "idle",
            UnitState::Mounting => "mounting",
            UnitState::Mounted => "mounted",
            UnitState::NeedsRemount => "needs_remount",
            UnitState::Unmounting => "unmounting",
            UnitState::Error(_) => "error",
        }
    }

    /// The state reached once every planned action has succeeded.
    fn settled(self) -> Self {
        match self {
            UnitState::Mounting | UnitState::NeedsRemount => UnitState::Mounted,
            UnitState::Unmounting => UnitState::Idle,
            other => other,
        }
    }
}

/// Operator-facing status line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitStatus {
    Idle { reason: String },
    Mounted { mountpoint: PathBuf },
    Error { cause: String },
}

impl UnitStatus {
    /// Whether the unit is in the error state.
    pub fn is_error(&self) -> bool {
        matches!(self, UnitStatus::Error { .. })
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Idle { reason } => write!(f, "Idle: {reason}"),
            UnitStatus::Mounted { mountpoint } => write!(f, "Mounted: {}", mountpoint.display()),
            UnitStatus::Error { cause } => write!(f, "Error: {cause}"),
        }
    }
}

/// Outcome of [`plan`]: the state implied by the inputs and the actions
/// needed to converge, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub state: UnitState,
    pub actions: Vec<Action>,
}

impl Plan {
    fn idle() -> Self {
        Self {
            state: UnitState::Idle,
            actions: Vec::new(),
        }
    }

    /// How the plan is summarised in the unit record.
    pub fn last_action(&self) -> Option<LastAction> {
        let mounts = self.actions.iter().any(|a| matches!(a, Action::Mount { .. }));
        let unmounts = self.actions.iter().any(|a| matches!(a, Action::Unmount { .. }));
        match (mounts, unmounts) {
            (true, true) => Some(LastAction::Remount),
            (true, false) => Some(LastAction::Mount),
            (false, true) => Some(LastAction::Unmount),
            (false, false) => None,
        }
    }
}

/// Decides what to do.
///
/// `observed` is the probed state of the current target (the desired
/// mountpoint, or when nothing is desired the configured or previously
/// managed one). `stale` is a mountpoint this unit managed before that is no
/// longer the target.
///
/// Only CephFS mounts are ever unmounted; another filesystem on the target
/// is reported and left alone.
pub fn plan(
    desired: Option<&DesiredMountSpec>,
    observed: Option<&ObservedMountState>,
    stale: Option<&ObservedMountState>,
) -> Plan {
    let mut actions = Vec::new();
    if let Some(stale) = stale.filter(|s| s.is_ceph()) {
        actions.push(Action::Unmount {
            mountpoint: stale.mountpoint.clone(),
        });
    }

    let Some(spec) = desired else {
        if let Some(observed) = observed.filter(|o| o.is_ceph()) {
            actions.push(Action::Unmount {
                mountpoint: observed.mountpoint.clone(),
            });
        }
        if actions.is_empty() {
            return Plan::idle();
        }
        return Plan {
            state: UnitState::Unmounting,
            actions,
        };
    };

    let observed = match observed {
        Some(observed) if observed.mounted => observed,
        _ => {
            actions.push(Action::Mount { spec: spec.clone() });
            return Plan {
                state: UnitState::Mounting,
                actions,
            };
        }
    };

    if !observed.is_ceph() {
        return Plan {
            state: UnitState::Error(format!("mountpoint occupied by {}", observed.fstype)),
            actions: Vec::new(),
        };
    }

    if spec.is_satisfied_by(observed) {
        return Plan {
            state: UnitState::Mounted,
            actions,
        };
    }

    actions.push(Action::Unmount {
        mountpoint: spec.target.clone(),
    });
    actions.push(Action::Mount { spec: spec.clone() });
    Plan {
        state: UnitState::NeedsRemount,
        actions,
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub unit_id: String,
    /// State implied by the inputs before anything was executed.
    pub planned: UnitState,
    /// State after execution.
    pub state: UnitState,
    pub status: UnitStatus,
    pub actions: Vec<Action>,
    /// Number of actions that completed successfully.
    pub executed: usize,
    /// The published record, or `None` when publishing failed.
    pub record: Option<UnitMountRecord>,
    /// Peers whose desired spec differs from this unit's.
    pub divergent_peers: Vec<String>,
}

/// Result of the stop-event teardown.
#[derive(Debug, Clone, Serialize)]
pub struct TeardownReport {
    #[serde(flatten)]
    pub report: ReconcileReport,
    /// No CephFS mount is left on the host, so helper packages may go.
    pub helpers_removable: bool,
}

/// Drives [`plan`] against a probe, an executor and the peer group.
#[derive(Debug)]
pub struct Reconciler<P, X, S> {
    probe: P,
    executor: X,
    peers: PeerCoordinator<S>,
}

impl<P, X, S> Reconciler<P, X, S>
where
    P: MountProbe,
    X: MountExecutor,
    S: PeerStore,
{
    /// Creates a reconciler over the given host and peer group.
    pub fn new(probe: P, executor: X, peers: PeerCoordinator<S>) -> Self {
        Self {
            probe,
            executor,
            peers,
        }
    }

    /// The mount state probe.
    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// The mount executor.
    pub fn executor(&self) -> &X {
        &self.executor
    }

    /// The peer coordinator holding this unit's record.
    pub fn peers(&self) -> &PeerCoordinator<S> {
        &self.peers
    }

    /// Converges the host towards the mount implied by `facts` and `policy`.
    ///
    /// Never fails: every problem ends up in the report's status.
    pub fn reconcile(
        &mut self,
        facts: &ConnectionFactStore,
        policy: &PolicyStore,
    ) -> ReconcileReport {
        let facts = facts.facts();
        let policy = policy.policy();
        let reason = match (&policy, &facts) {
            (None, _) => NO_MOUNTPOINT,
            (Some(_), None) => WAITING_FOR_SHARE,
            (Some(_), Some(_)) => "Not mounted",
        };
        self.run(facts.as_ref(), policy.as_ref(), reason)
    }

    /// Stop event: unmounts whatever this unit manages and reports whether
    /// any CephFS mount remains on the host.
    pub fn teardown(&mut self, policy: &PolicyStore) -> TeardownReport {
        let policy = policy.policy();
        let report = self.run(None, policy.as_ref(), STOPPING);

        let helpers_removable = match self.probe.ceph_mounts() {
            Ok(mounts) => {
                if !mounts.is_empty() {
                    info!(remaining = mounts.len(), "CephFS mounts remain on host");
                }
                mounts.is_empty()
            }
            Err(e) => {
                warn!(error = %e, "could not list CephFS mounts");
                false
            }
        };

        TeardownReport {
            report,
            helpers_removable,
        }
    }

    /// Probes the current status without executing or publishing anything.
    pub fn status(&self, facts: &ConnectionFactStore, policy: &PolicyStore) -> UnitStatus {
        let facts = facts.facts();
        let policy = policy.policy();
        let desired = DesiredMountSpec::from_inputs(facts.as_ref(), policy.as_ref());
        let previous = self.peers.previous();

        let plan = match self.observe(desired.as_ref(), policy.as_ref(), previous.as_ref()) {
            Ok((observed, stale)) => plan(desired.as_ref(), observed.as_ref(), stale.as_ref()),
            Err(e) => Plan {
                state: UnitState::Error(e.cause()),
                actions: Vec::new(),
            },
        };

        match plan.state {
            UnitState::Error(cause) => UnitStatus::Error { cause },
            UnitState::Mounted => UnitStatus::Mounted {
                mountpoint: desired.map(|d| d.target).unwrap_or_default(),
            },
            _ => {
                // A failed attempt stays an error until something converges.
                if let Some(cause) = previous.and_then(|r| r.last_error) {
                    return UnitStatus::Error { cause };
                }
                let reason = match (&policy, &facts) {
                    (None, _) => NO_MOUNTPOINT,
                    (Some(_), None) => WAITING_FOR_SHARE,
                    (Some(_), Some(_)) => "Not mounted",
                };
                UnitStatus::Idle {
                    reason: reason.to_string(),
                }
            }
        }
    }

    fn run(
        &mut self,
        facts: Option<&ConnectionFacts>,
        policy: Option<&MountPolicy>,
        idle_reason: &str,
    ) -> ReconcileReport {
        let desired = DesiredMountSpec::from_inputs(facts, policy);
        let previous = self.peers.previous();
        let unit = self.peers.unit_id().to_string();

        let probed = self.observe(desired.as_ref(), policy, previous.as_ref());
        let probe_failed = probed.is_err();
        let (plan, observed, stale) = match probed {
            Ok((observed, stale)) => {
                if let (Some(prev), Some(obs)) = (&previous, &observed)
                    && prev.last_action == LastAction::Mount
                    && prev.last_error.is_none()
                    && !obs.mounted
                {
                    warn!(unit = %unit, mountpoint = %obs.mountpoint.display(), "previously mounted share is gone");
                }
                let plan = plan(desired.as_ref(), observed.as_ref(), stale.as_ref());
                (plan, observed, stale)
            }
            Err(e) => {
                error!(unit = %unit, error = %e, "failed to probe mount state");
                let plan = Plan {
                    state: UnitState::Error(e.cause()),
                    actions: Vec::new(),
                };
                (plan, None, None)
            }
        };
        debug!(unit = %unit, state = plan.state.name(), actions = plan.actions.len(), "planned");

        let (state, executed) = self.execute(&plan, &unit);
        let status = match &state {
            UnitState::Error(cause) => UnitStatus::Error {
                cause: cause.clone(),
            },
            UnitState::Mounted => UnitStatus::Mounted {
                mountpoint: desired.as_ref().map(|d| d.target.clone()).unwrap_or_default(),
            },
            _ => UnitStatus::Idle {
                reason: idle_reason.to_string(),
            },
        };

        let (managed, observed) = if probe_failed {
            // Nothing is known about the host; keep what the last record says.
            previous
                .as_ref()
                .map(|r| (r.mountpoint.clone(), r.observed.clone()))
                .unwrap_or_default()
        } else {
            let (stale, observed) = self.observe_after(&plan, stale, observed);
            // A stale mountpoint that is still mounted stays ours until it is gone.
            let managed = stale
                .as_ref()
                .filter(|o| o.is_ceph())
                .or_else(|| observed.as_ref().filter(|o| desired.is_some() || o.is_ceph()))
                .map(|o| o.mountpoint.clone());
            (managed, observed)
        };
        let last_action = plan
            .last_action()
            .or_else(|| previous.as_ref().map(|r| r.last_action))
            .unwrap_or_default();

        let desired_hash = desired.as_ref().map(DesiredMountSpec::fingerprint);
        let record = UnitMountRecord {
            mountpoint: managed,
            desired_spec_hash: desired_hash.clone(),
            observed,
            state: state.name().to_string(),
            last_action,
            last_error: match &state {
                UnitState::Error(cause) => Some(cause.clone()),
                _ => None,
            },
            ..UnitMountRecord::new(unit.as_str())
        };
        let record = match self.peers.record(record) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(unit = %unit, error = %e, "failed to publish unit record");
                None
            }
        };

        let divergent_peers = self.peers.divergent_units(desired_hash.as_deref());
        if !divergent_peers.is_empty() {
            debug!(unit = %unit, peers = ?divergent_peers, "peers report a different desired mount");
        }

        info!(unit = %unit, %status, "reconciled");
        ReconcileReport {
            unit_id: unit,
            planned: plan.state,
            state,
            status,
            actions: plan.actions,
            executed,
            record,
            divergent_peers,
        }
    }

    /// Probes the target and, when it differs, the previously managed mountpoint.
    fn observe(
        &self,
        desired: Option<&DesiredMountSpec>,
        policy: Option<&MountPolicy>,
        previous: Option<&UnitMountRecord>,
    ) -> Result<(Option<ObservedMountState>, Option<ObservedMountState>)> {
        let previous = previous.and_then(|r| r.mountpoint.clone());
        let target = desired
            .map(|d| d.target.clone())
            .or_else(|| policy.map(|p| p.mountpoint.clone()))
            .or_else(|| previous.clone());

        let observed = target
            .as_deref()
            .map(|path| self.probe.observe(path))
            .transpose()?;
        let stale = previous
            .filter(|path| Some(path) != target.as_ref())
            .map(|path| self.probe.observe(&path))
            .transpose()?;
        Ok((observed, stale))
    }

    /// Re-probes after execution, falling back to what was seen before when
    /// nothing ran or the table cannot be read.
    fn observe_after(
        &self,
        plan: &Plan,
        stale: Option<ObservedMountState>,
        observed: Option<ObservedMountState>,
    ) -> (Option<ObservedMountState>, Option<ObservedMountState>) {
        let reprobe = |before: ObservedMountState| {
            if plan.actions.is_empty() {
                return before;
            }
            match self.probe.observe(&before.mountpoint) {
                Ok(after) => after,
                Err(e) => {
                    warn!(mountpoint = %before.mountpoint.display(), error = %e, "failed to re-probe mount state");
                    before
                }
            }
        };
        (stale.map(reprobe), observed.map(reprobe))
    }

    /// Runs the plan in order, stopping at the first failure.
    fn execute(&mut self, plan: &Plan, unit: &str) -> (UnitState, usize) {
        for (done, action) in plan.actions.iter().enumerate() {
            info!(unit, action = %action, "executing");
            let outcome = match action {
                Action::Mount { spec } => self.executor.mount(spec),
                Action::Unmount { mountpoint } => self.executor.unmount(mountpoint),
            };
            if let Err(e) = outcome {
                error!(unit, action = %action, error = %e, "action failed");
                return (UnitState::Error(e.cause()), done);
            }
        }
        (plan.state.clone().settled(), plan.actions.len())
    }
}
