//! Resource generation module.
//!
//! Contains utilities for generating the Kubernetes objects the controllers create.
//!
//! ## Resources Generated
//!
//! | Resource | Created by | Purpose |
//! |----------|------------|---------|
//! | ControlPlaneUpgrade / MachineDeploymentUpgrade | detectors | group of machines to upgrade |
//! | NodeUpgrade | group controllers | one machine to upgrade |
//! | Pod (upgrader) | node upgrade controller | runs the upgrade steps on the node |

pub mod common;
pub mod upgrader_pod;

// Re-export commonly used items from common
pub use common::{
    control_plane_health_check_name, control_plane_upgrade_name,
    machine_deployment_health_check_name, machine_deployment_upgrade_name, node_upgrade_name,
    owner_reference, standard_labels, upgrader_pod_name,
};
pub use upgrader_pod::{DefaultPodBuilder, UpgraderPodBuilder, UpgraderPodParams};
