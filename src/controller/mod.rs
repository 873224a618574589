//! Controllers
//!
//! Three reconcilers share one [`Datastore`](crate::datastore::Datastore):
//!
//! - [`NodeController`]: node readiness, mount propagation and disk status
//! - [`EngineImageController`]: binary deployment, compatibility, instance
//!   managers, reference counting and expiry
//! - [`WorkloadStatusController`]: persistent volume, claim and pod linkage
//!   of volumes, plus detaching volumes from nodes that are down
//!
//! Each runs behind its own [`WorkQueue`] through a [`Controller`]; watch
//! events reach the queues through the [`EventFanout`].

pub mod engine_image;
pub mod events;
pub mod metrics;
pub mod node;
pub mod recorder;
pub mod runner;
pub mod workload_status;
pub mod workqueue;

pub use engine_image::{ensure_default_engine_image, EngineImageController};
pub use events::{drive, EventFanout, Fanout};
pub use metrics::ControllerMetrics;
pub use node::NodeController;
pub use recorder::{KubeEventRecorder, MemoryEventRecorder};
pub use runner::{Controller, Reconciler};
pub use workload_status::{WorkloadRef, WorkloadStatusController};
pub use workqueue::WorkQueue;
