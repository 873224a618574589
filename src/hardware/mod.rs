//! Hardware Module
//!
//! Node-local adapters: the statvfs disk probe and the engine binary
//! inspector. Both only make sense on the node that owns the disk or binary.

pub mod disk_probe;
pub mod engine_binary;

pub use disk_probe::StatvfsProbe;
pub use engine_binary::HostBinaryInspector;
