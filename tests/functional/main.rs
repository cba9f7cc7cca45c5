// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Functional tests for the in-place upgrade controllers.
//!
//! These tests drive the detector, upgrade group and node upgrade
//! reconcilers against in-memory management and workload clusters, so the
//! whole annotation -> group -> node upgrade -> Pod chain runs WITHOUT a
//! live Kubernetes cluster.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run a single flow
//! cargo test --test functional test_control_plane_upgrade_end_to_end
//! ```
//!
//! ## Test Categories
//!
//! - **Control plane flows**: KubeadmControlPlane annotation through to
//!   annotation removal, including serial rollout and the etcd leader node
//! - **Machine deployment flows**: the worker node equivalent
//! - **Scenario tests**: failures, deletion mid-upgrade and restarts

mod control_plane_flow;
mod harness;
mod machine_deployment_flow;
mod scenario_tests;

pub use harness::*;
