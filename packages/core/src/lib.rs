//! cephfs-client-core: Core library for the CephFS client unit agent.
//!
//! This library keeps one CephFS share mounted on the host according to two
//! independently changing inputs: the connection facts published over the
//! share relation and the unit's local mount policy.
//!
//! # Modules
//!
//! - [`facts`]: Share relation data and its validation
//! - [`policy`]: Local mount policy (mountpoint and flags)
//! - [`options`]: Canonical encoding of the policy flags
//! - [`desired`]: The desired mount derived from facts and policy
//! - [`probe`]: Kernel mount table inspection
//! - [`reconcile`]: Decision function and reconciliation driver
//! - [`peer`]: Per-unit records shared with the peer group
//! - [`mount`]: Mount/unmount operations
//! - [`executor`]: Host command execution with privilege escalation
//! - [`packages`]: Host helper package management
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use cephfs_client_core::{
//!     ConnectionFactStore, ExecutionContext, FilePeerStore, MountTable, PeerCoordinator,
//!     PolicyStore, Reconciler, SystemMounter,
//! };
//!
//! let facts = ConnectionFactStore::from_path("relation.json".as_ref()).unwrap();
//! let policy = PolicyStore::from_json(r#"{"mountpoint": "/data", "nodev": true}"#);
//!
//! let mut reconciler = Reconciler::new(
//!     MountTable::new(),
//!     SystemMounter::new(ExecutionContext::auto()),
//!     PeerCoordinator::new("cephfs-client/0", FilePeerStore::new("/var/lib/cephfs-client/peers")),
//! );
//!
//! let report = reconciler.reconcile(&facts, &policy);
//! println!("{}", report.status);
//! ```

pub mod desired;
pub mod error;
pub mod executor;
pub mod facts;
pub mod mount;
pub mod options;
pub mod packages;
pub mod peer;
pub mod policy;
pub mod probe;
pub mod reconcile;

// Re-export commonly used types
pub use desired::DesiredMountSpec;
pub use error::{Error, MountFailureKind, Result};
pub use executor::{ExecutionContext, PrivilegeEscalation};
pub use facts::{ConnectionFactStore, ConnectionFacts};
pub use mount::{MountExecutor, SystemMounter};
pub use options::MountOptions;
pub use peer::{FilePeerStore, MemoryPeerStore, PeerCoordinator, PeerStore, UnitMountRecord};
pub use policy::{MountPolicy, PolicyStore};
pub use probe::{MountProbe, MountTable, ObservedMountState};
pub use reconcile::{Reconciler, ReconcileReport, TeardownReport, UnitState, UnitStatus};
