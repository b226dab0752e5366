//! End-to-end storage scenarios for Kubernetes and OpenShift clusters.
//!
//! The crate drives a live cluster through its CLI: resources are rendered
//! from manifest templates, created, observed through bounded polling and
//! torn down again. Scenarios cover NFS and iSCSI volumes, ConfigMap
//! subPath mounts, ephemeral-storage eviction, volume metrics and
//! VolumeAttributesClass handling.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Error docs are carried by the E2eError variants
#![allow(clippy::missing_errors_doc)]

pub mod cluster;
pub mod consts;
pub mod monitor;
pub mod node;
pub mod quantity;
pub mod resources;
pub mod runner;
pub mod scenarios;

pub use runner::{Outcome, RunReport, ScenarioReport};
pub use scenarios::Scenario;
