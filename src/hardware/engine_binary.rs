//! Engine Binary Inspection
//!
//! The engine-image DaemonSet copies each image's engine binary to a host
//! directory named after the image. Once the DaemonSet is available the
//! manager runs `<binary> version --client-only` and records what it reports.

use crate::crd::EngineVersionDetails;
use crate::domain::naming::engine_image_name;
use crate::domain::ports::EngineBinaryInspector;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// File name of the engine binary inside each image directory
pub const ENGINE_BINARY_NAME: &str = "blockstore-engine";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionOutput {
    client_version: ClientVersion,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientVersion {
    #[serde(default)]
    version: String,
    #[serde(default)]
    git_commit: String,
    #[serde(default)]
    build_date: String,
    #[serde(rename = "cliAPIVersion")]
    cli_api_version: i32,
    #[serde(rename = "cliAPIMinVersion")]
    cli_api_min_version: i32,
    #[serde(rename = "controllerAPIVersion")]
    controller_api_version: i32,
    #[serde(rename = "controllerAPIMinVersion")]
    controller_api_min_version: i32,
    #[serde(rename = "dataFormatVersion")]
    data_format_version: i32,
    #[serde(rename = "dataFormatMinVersion")]
    data_format_min_version: i32,
}

impl From<ClientVersion> for EngineVersionDetails {
    fn from(v: ClientVersion) -> Self {
        EngineVersionDetails {
            version: v.version,
            git_commit: v.git_commit,
            build_date: v.build_date,
            cli_api_version: v.cli_api_version,
            cli_api_min_version: v.cli_api_min_version,
            controller_api_version: v.controller_api_version,
            controller_api_min_version: v.controller_api_min_version,
            data_format_version: v.data_format_version,
            data_format_min_version: v.data_format_min_version,
        }
    }
}

/// Parse the JSON printed by `version --client-only`
pub fn parse_version_output(stdout: &[u8]) -> Result<EngineVersionDetails> {
    let output: VersionOutput = serde_json::from_slice(stdout)?;
    Ok(output.client_version.into())
}

/// Runs engine binaries deployed on the host
#[derive(Debug, Clone)]
pub struct HostBinaryInspector {
    binaries_dir: PathBuf,
    timeout: Duration,
}

impl HostBinaryInspector {
    pub fn new(binaries_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binaries_dir: binaries_dir.into(),
            timeout,
        }
    }

    /// Location of the binary for an image
    pub fn binary_path(&self, image: &str) -> PathBuf {
        self.binaries_dir
            .join(engine_image_name(image))
            .join(ENGINE_BINARY_NAME)
    }

    async fn run(&self, binary: &Path) -> Result<Vec<u8>> {
        let failure = |reason: String| Error::ProbeFailure {
            target: binary.display().to_string(),
            reason,
        };

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(binary)
                .args(["version", "--client-only"])
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| failure(format!("timed out after {:?}", self.timeout)))?
        .map_err(|e| failure(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failure(stderr.trim().to_string()));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl EngineBinaryInspector for HostBinaryInspector {
    async fn version(&self, image: &str) -> Result<EngineVersionDetails> {
        let binary = self.binary_path(image);
        let stdout = self.run(&binary).await?;
        let details = parse_version_output(&stdout)?;
        debug!(
            "Engine binary for {} reports version {} (cli api {}..={})",
            image, details.version, details.cli_api_min_version, details.cli_api_version
        );
        Ok(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const OUTPUT: &str = r#"{
        "clientVersion": {
            "version": "v1.4.0",
            "gitCommit": "0a1b2c3",
            "buildDate": "2026-03-01T10:00:00Z",
            "cliAPIVersion": 4,
            "cliAPIMinVersion": 3,
            "controllerAPIVersion": 2,
            "controllerAPIMinVersion": 2,
            "dataFormatVersion": 1,
            "dataFormatMinVersion": 1
        },
        "serverVersion": null
    }"#;

    #[test]
    fn test_parse_version_output() {
        let details = parse_version_output(OUTPUT.as_bytes()).unwrap();
        assert_eq!(details.version, "v1.4.0");
        assert_eq!(details.cli_api_version, 4);
        assert_eq!(details.cli_api_min_version, 3);
        assert!(details.is_reported());
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert_matches!(
            parse_version_output(b"engine v1.4.0"),
            Err(Error::JsonParse(_))
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_probe_failure() {
        let dir = tempfile::tempdir().unwrap();
        let inspector = HostBinaryInspector::new(dir.path(), Duration::from_secs(2));

        let binary = inspector.binary_path("registry.local/engine:v1");
        assert!(binary.starts_with(dir.path()));
        assert!(binary.ends_with(ENGINE_BINARY_NAME));

        let result = inspector.version("registry.local/engine:v1").await;
        assert_matches!(result, Err(Error::ProbeFailure { .. }));
    }
}
