//! Controllers for in-place upgrades.
//!
//! Three tiers cooperate through the custom resources they create:
//! - `detector`: KubeadmControlPlane and MachineDeployment controllers that
//!   turn the in-place-upgrade annotation into an upgrade group
//! - `upgrade_group`: ControlPlaneUpgrade and MachineDeploymentUpgrade
//!   controllers that fan out one NodeUpgrade per machine
//! - `node_upgrade`: runs the upgrader Pod on the workload cluster node
//!
//! `capi_sync` keeps the Cluster API objects of upgraded machines in line
//! and pauses their health checks. `provider` holds the dispatch seam of the
//! top-level cluster reconciler.

// Shared modules
pub mod capi_sync;
pub mod common;
pub mod context;
pub mod error;
pub mod status;

// Controllers
pub mod detector;
pub mod node_upgrade;
pub mod upgrade_group;

pub mod provider;

pub use detector::{
    InPlaceUpgradeDetector, KubeadmControlPlaneReconciler, MachineDeploymentReconciler,
    UpgradeTrigger,
};
pub use error::{Error, Result};
pub use node_upgrade::NodeUpgradeReconciler;
pub use provider::{ProviderClusterReconciler, ProviderReconcilerRegistry};
pub use upgrade_group::{
    ControlPlaneUpgradeReconciler, MachineDeploymentUpgradeReconciler, UpgradeGroup,
    UpgradeGroupReconciler,
};
