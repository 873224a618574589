//! Disk Probe
//!
//! Reads filesystem identity and capacity of a disk path with `statvfs(3)`.
//! The syscall can hang on a dead mount, so it runs on the blocking pool
//! under a timeout.

use crate::domain::ports::{DiskInfo, DiskProbe};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// statvfs-backed disk probe
#[derive(Debug, Clone)]
pub struct StatvfsProbe {
    timeout: Duration,
}

impl StatvfsProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn stat(path: PathBuf) -> Result<DiskInfo> {
        let display = path.display().to_string();
        let stat = nix::sys::statvfs::statvfs(path.as_path()).map_err(|e| Error::ProbeFailure {
            target: display.clone(),
            reason: format!("statvfs: {}", e),
        })?;

        let fragment = stat.fragment_size() as u64;
        let total = (stat.blocks() as u64).saturating_mul(fragment);
        let available = (stat.blocks_available() as u64).saturating_mul(fragment);

        Ok(DiskInfo {
            filesystem_id: format!("{:x}", stat.filesystem_id()),
            storage_maximum: i64::try_from(total).unwrap_or(i64::MAX),
            storage_available: i64::try_from(available).unwrap_or(i64::MAX),
        })
    }
}

#[async_trait]
impl DiskProbe for StatvfsProbe {
    async fn probe(&self, path: &str) -> Result<DiskInfo> {
        let owned = PathBuf::from(path);
        let task = tokio::task::spawn_blocking(move || Self::stat(owned));

        let info = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join)) => {
                return Err(Error::ProbeFailure {
                    target: path.to_string(),
                    reason: format!("probe task failed: {}", join),
                })
            }
            Err(_) => {
                return Err(Error::ProbeFailure {
                    target: path.to_string(),
                    reason: format!("timed out after {:?}", self.timeout),
                })
            }
        };

        debug!(
            "Probed {}: fsid={} max={} available={}",
            path, info.filesystem_id, info.storage_maximum, info.storage_available
        );
        Ok(info)
    }
}
