//! Domain Ports - Core trait definitions for the block-storage manager
//!
//! These traits define the boundaries between the reconcilers and the
//! outside world. Adapters implement them for production (statvfs, engine
//! binaries, the Kubernetes event API, the wall clock) and tests substitute
//! scripted versions.

use crate::crd::EngineVersionDetails;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use serde::{Deserialize, Serialize};

// =============================================================================
// Disk Probe
// =============================================================================

/// Filesystem identity and capacity of a disk path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Filesystem identifier; changes when the backing device is replaced
    pub filesystem_id: String,
    /// Total capacity in bytes
    pub storage_maximum: i64,
    /// Free capacity in bytes
    pub storage_available: i64,
}

/// Port for probing a disk's backing filesystem
#[async_trait]
pub trait DiskProbe: Send + Sync {
    /// Probe the filesystem mounted at `path`
    async fn probe(&self, path: &str) -> Result<DiskInfo>;
}

// =============================================================================
// Engine Versions
// =============================================================================

/// API version range the manager can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiVersionRange {
    /// Oldest engine CLI API the manager still speaks
    pub min_version: i32,
    /// Newest engine CLI API the manager speaks
    pub current_version: i32,
}

/// Port for deciding whether a reported engine version is usable
pub trait VersionChecker: Send + Sync {
    fn is_compatible(&self, reported: &EngineVersionDetails, expected: &ApiVersionRange) -> bool;
}

/// Port for asking an engine binary which version it is
#[async_trait]
pub trait EngineBinaryInspector: Send + Sync {
    async fn version(&self, image: &str) -> Result<EngineVersionDetails>;
}

// =============================================================================
// Events
// =============================================================================

/// Severity of a published event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    Normal,
    Warning,
}

impl std::fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSeverity::Normal => write!(f, "Normal"),
            EventSeverity::Warning => write!(f, "Warning"),
        }
    }
}

/// A diagnostic event attached to an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticEvent {
    pub severity: EventSeverity,
    /// CamelCase machine-readable reason
    pub reason: String,
    /// Human-readable detail
    pub note: String,
    /// Short verb describing what the controller did
    pub action: String,
}

/// Port for publishing events on objects.
///
/// Publishing is best-effort: implementations log failures instead of
/// returning them so an unreachable event sink never stalls a reconcile.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, target: &ObjectReference, event: DiagnosticEvent);
}

// =============================================================================
// Clock
// =============================================================================

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a settable instant, for tests and replay
#[derive(Debug, Default)]
pub struct FixedClock {
    now: parking_lot::RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.write();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_fixed_clock_advances() {
        let start = Utc::now();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));
    }

    #[test]
    fn test_event_severity_display() {
        assert_eq!(EventSeverity::Warning.to_string(), "Warning");
    }
}
