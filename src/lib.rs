//! Block-Storage Manager
//!
//! Control-plane core of a distributed block-storage system running on
//! Kubernetes. Every cluster node runs one manager instance; the instances
//! cooperate through the API server to keep three kinds of state converged:
//!
//! - storage node health and per-disk capacity and schedulability
//! - engine images: their binary deployment, API compatibility, instance
//!   managers and reference-counted expiry
//! - volume workload status, and detaching volumes from failed nodes
//!
//! # Modules
//!
//! - [`controller`]: work queues, reconcilers and the event fan-out
//! - [`crd`]: Custom Resource Definitions
//! - [`datastore`]: cached, compare-and-write object repositories
//! - [`domain`]: ports, naming and version compatibility
//! - [`hardware`]: node-local disk probe and engine binary inspector
//! - [`config`]: manager configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod controller;
pub mod crd;
pub mod datastore;
pub mod domain;
pub mod error;
pub mod hardware;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::ManagerConfig;

pub use controller::{
    Controller, ControllerMetrics, EngineImageController, EventFanout, NodeController,
    Reconciler, WorkloadStatusController,
};

pub use crd::{
    EngineImage, EngineImageSpec, EngineImageStatus, InstanceManager, StorageNode,
    StorageNodeSpec, StorageNodeStatus, Volume,
};

pub use datastore::{Datastore, ObjectKey, Repository};

pub use error::{Error, ErrorAction, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
