//! Domain layer - Port definitions and pure domain helpers
//!
//! This module defines the traits (ports) that adapters implement, plus the
//! deterministic naming and version-compatibility rules shared by the
//! controllers.

pub mod compat;
pub mod naming;
pub mod ports;

pub use compat::ApiRangeChecker;
pub use ports::*;
