//! Custom Resource Definitions for the Block-Storage Manager
//!
//! This module contains all CRD types:
//! - EngineImage: engine binary deployed cluster-wide
//! - StorageNode: declared disks and computed node/disk conditions
//! - InstanceManager: per-node engine/replica process descriptor
//! - Volume, Engine, Replica: data-path objects read by the controllers

pub mod condition;
pub mod engine_image;
pub mod instance_manager;
pub mod storage_node;
pub mod volume;

pub use condition::*;
pub use engine_image::*;
pub use instance_manager::*;
pub use storage_node::*;
pub use volume::*;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

/// All CRD manifests owned by this crate, in installation order
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        EngineImage::crd(),
        StorageNode::crd(),
        InstanceManager::crd(),
        Volume::crd(),
        Engine::crd(),
        Replica::crd(),
    ]
}

/// Render all CRDs as a multi-document YAML stream
pub fn crds_yaml() -> crate::error::Result<String> {
    let mut out = String::new();
    for crd in all_crds() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crds_share_group() {
        let crds = all_crds();
        assert_eq!(crds.len(), 6);
        for crd in &crds {
            assert_eq!(crd.spec.group, "blockstore.io");
            assert_eq!(crd.spec.scope, "Namespaced");
        }
    }

    #[test]
    fn test_crds_yaml_contains_every_kind() {
        let yaml = crds_yaml().unwrap();
        for kind in ["EngineImage", "StorageNode", "InstanceManager", "Volume", "Engine", "Replica"] {
            assert!(yaml.contains(&format!("kind: {}", kind)), "missing {}", kind);
        }
    }
}
