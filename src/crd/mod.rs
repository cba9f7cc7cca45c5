//! Custom Resource Definitions for the in-place upgrade operator.
//!
//! Owned kinds (group `anywhere.eks.amazonaws.com/v1alpha1`):
//! - `ControlPlaneUpgrade`: fans out in-place upgrades to every control-plane machine
//! - `MachineDeploymentUpgrade`: fans out in-place upgrades to every worker machine
//! - `NodeUpgrade`: drives the upgrader Pod on a single node
//!
//! Cluster API kinds (`capi`) are partial views: only the fields the
//! operator reads or patches are modelled.

pub mod capi;
mod common;
mod control_plane_upgrade;
mod machine_deployment_upgrade;
mod node_upgrade;

pub use common::*;
pub use control_plane_upgrade::*;
pub use machine_deployment_upgrade::*;
pub use node_upgrade::*;
