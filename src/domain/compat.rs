//! Engine API compatibility

use super::ports::{ApiVersionRange, VersionChecker};
use crate::crd::EngineVersionDetails;

/// Checks the engine's CLI API window against the range the manager speaks.
///
/// The two windows must overlap: the engine's oldest supported API may not be
/// newer than what the manager speaks, and the engine's current API may not
/// be older than what the manager still supports.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiRangeChecker;

impl VersionChecker for ApiRangeChecker {
    fn is_compatible(&self, reported: &EngineVersionDetails, expected: &ApiVersionRange) -> bool {
        if !reported.is_reported() {
            return false;
        }
        reported.cli_api_min_version <= expected.current_version
            && reported.cli_api_version >= expected.min_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(current: i32, min: i32) -> EngineVersionDetails {
        EngineVersionDetails {
            version: "v1.0.0".into(),
            cli_api_version: current,
            cli_api_min_version: min,
            ..Default::default()
        }
    }

    const RANGE: ApiVersionRange = ApiVersionRange {
        min_version: 3,
        current_version: 4,
    };

    #[test]
    fn test_overlapping_windows_are_compatible() {
        let checker = ApiRangeChecker;
        assert!(checker.is_compatible(&details(4, 3), &RANGE));
        assert!(checker.is_compatible(&details(3, 1), &RANGE));
        assert!(checker.is_compatible(&details(6, 4), &RANGE));
    }

    #[test]
    fn test_disjoint_windows_are_incompatible() {
        let checker = ApiRangeChecker;
        // Engine too old for the manager
        assert!(!checker.is_compatible(&details(2, 1), &RANGE));
        // Engine dropped support for what the manager speaks
        assert!(!checker.is_compatible(&details(7, 5), &RANGE));
        // Never inspected
        assert!(!checker.is_compatible(&EngineVersionDetails::default(), &RANGE));
    }
}
