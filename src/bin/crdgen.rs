//! Prints the CustomResourceDefinitions of the operator as a multi-document
//! YAML stream.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/bases/upgrades.yaml
//! ```

use kube::CustomResourceExt;

use inplace_upgrade_operator::crd::{ControlPlaneUpgrade, MachineDeploymentUpgrade, NodeUpgrade};

fn main() -> anyhow::Result<()> {
    let crds = [
        ControlPlaneUpgrade::crd(),
        MachineDeploymentUpgrade::crd(),
        NodeUpgrade::crd(),
    ];
    for crd in crds {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("---\n{yaml}");
    }
    Ok(())
}
