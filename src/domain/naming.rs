//! Deterministic names and labels for managed objects
//!
//! Every function here is pure: the same inputs always give the same name,
//! which lets independent controller instances converge on the same objects
//! without coordinating.

use crate::crd::InstanceManagerType;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Label key prefix for everything this manager creates
pub const LABEL_PREFIX: &str = "blockstore.io";

/// Component label value of engine-image DaemonSets
pub const COMPONENT_ENGINE_IMAGE: &str = "engine-image";

/// Component label value of instance managers
pub const COMPONENT_INSTANCE_MANAGER: &str = "instance-manager";

/// Label key used by DaemonSets created before the prefixed scheme
pub const DEPRECATED_APP_LABEL: &str = "app";

/// Prefixed label key
pub fn label(key: &str) -> String {
    format!("{}/{}", LABEL_PREFIX, key)
}

/// First 8 hex characters of the SHA-256 of the input
pub fn short_checksum(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Name of the EngineImage object for an image reference
pub fn engine_image_name(image: &str) -> String {
    format!("ei-{}", short_checksum(image))
}

/// Name of the DaemonSet that deploys an image's binary
pub fn daemon_set_name(image: &str) -> String {
    format!("engine-image-{}", engine_image_name(image))
}

/// Name of the instance manager for an image, role and node
pub fn instance_manager_name(image: &str, role: InstanceManagerType, node: &str) -> String {
    let prefix = match role {
        InstanceManagerType::Engine => "e",
        InstanceManagerType::Replica => "r",
    };
    let checksum = short_checksum(&format!("{}/{}/{}", image, role, node));
    format!("instance-manager-{}-{}", prefix, checksum)
}

/// Selector and pod-template labels of an engine-image DaemonSet
pub fn daemon_set_labels(image: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (label("component"), COMPONENT_ENGINE_IMAGE.to_string()),
        (label("engine-image"), engine_image_name(image)),
    ])
}

/// Labels on an instance manager object
pub fn instance_manager_labels(
    image: &str,
    role: InstanceManagerType,
    node: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (label("component"), COMPONENT_INSTANCE_MANAGER.to_string()),
        (label("engine-image"), engine_image_name(image)),
        (label("instance-manager-type"), role.to_string()),
        (label("node"), node.to_string()),
    ])
}

/// Version label value stamped on the DaemonSet pod template
pub fn version_label() -> (String, String) {
    (label("version"), env!("CARGO_PKG_VERSION").to_string())
}

/// Whether a DaemonSet's selector uses the current label scheme for `image`.
///
/// A selector carrying the deprecated `app` key, or one that does not match
/// the current labels exactly, is treated as deprecated.
pub fn selector_is_current(
    selector: Option<&BTreeMap<String, String>>,
    image: &str,
) -> bool {
    match selector {
        Some(labels) => {
            !labels.contains_key(DEPRECATED_APP_LABEL) && *labels == daemon_set_labels(image)
        }
        None => false,
    }
}

/// Validate a container image reference of the form
/// `[registry[:port]/]repository[:tag][@digest]`
pub fn validate_image_reference(image: &str) -> Result<()> {
    let invalid = |reason: &str| -> Result<()> {
        Err(Error::Validation {
            kind: "EngineImage".into(),
            name: image.to_string(),
            reason: reason.to_string(),
        })
    };

    if image.is_empty() {
        return invalid("image reference is empty");
    }
    if image.chars().any(char::is_whitespace) {
        return invalid("image reference contains whitespace");
    }

    let (name, digest) = match image.split_once('@') {
        Some((name, digest)) => (name, Some(digest)),
        None => (image, None),
    };
    if let Some(digest) = digest {
        match digest.split_once(':') {
            Some((algo, hex)) if !algo.is_empty() && !hex.is_empty() => {}
            _ => return invalid("malformed digest"),
        }
    }

    // A colon after the last slash separates the tag
    let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (repository, tag) = match name[last_slash..].find(':') {
        Some(i) => (&name[..last_slash + i], Some(&name[last_slash + i + 1..])),
        None => (name, None),
    };

    if let Some(tag) = tag {
        let valid_tag = !tag.is_empty()
            && tag.len() <= 128
            && tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !valid_tag {
            return invalid("malformed tag");
        }
    }

    if repository.is_empty() || repository.split('/').any(str::is_empty) {
        return invalid("empty path component");
    }
    // Only the registry host may carry uppercase letters or a port
    let path = match repository.split_once('/') {
        Some((host, rest)) if host.contains('.') || host.contains(':') || host == "localhost" => {
            rest
        }
        _ => repository,
    };
    let valid_path = path.split('/').all(|component| {
        component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
    });
    if !valid_path {
        return invalid("repository must be lowercase alphanumerics and separators");
    }

    Ok(())
}
