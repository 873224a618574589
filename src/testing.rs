//! Test fixtures: scripted adapters and object builders shared by the
//! controller tests.

use crate::config::ManagerConfig;
use crate::crd::{
    set_condition, ConditionStatus, DiskSpec, Engine, EngineImage, EngineImageSpec, EngineSpec,
    EngineStatus, EngineVersionDetails, InstanceManager, InstanceManagerSpec,
    InstanceManagerState, InstanceManagerStatus, InstanceManagerType, NodeConditionType,
    Replica, ReplicaSpec, StorageNode, StorageNodeSpec, StorageNodeStatus, Volume, VolumeSpec,
    VolumeStatus,
};
use crate::datastore::{ObjectKey, Repo};
use crate::domain::naming;
use crate::domain::ports::{DiskInfo, DiskProbe, EngineBinaryInspector};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, DaemonSetStatus};
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, Container, Node, NodeCondition, NodeStatus, ObjectReference,
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimStatus,
    PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, PersistentVolumeStatus, Pod,
    PodSpec, PodStatus, Volume as PodVolume, VolumeMount,
};
use k8s_openapi::api::storage::v1::{
    VolumeAttachment, VolumeAttachmentSource, VolumeAttachmentSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference, Time};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const NAMESPACE: &str = "blockstore-system";
pub const NODE_1: &str = "node-1";
pub const NODE_2: &str = "node-2";
pub const ENGINE_IMAGE: &str = "registry.example.com/blockstore/engine:v1.4.0";
pub const UPGRADED_IMAGE: &str = "registry.example.com/blockstore/engine:v1.5.0";
pub const CSI_DRIVER: &str = "driver.blockstore.io";
pub const GIB: i64 = 1 << 30;

/// Fixed reference instant used by every test clock
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Manager configuration for the instance running on `NODE_1`
pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        namespace: NAMESPACE.into(),
        controller_id: NODE_1.into(),
        default_engine_image: ENGINE_IMAGE.into(),
        csi_driver_name: CSI_DRIVER.into(),
        ..Default::default()
    }
}

// =============================================================================
// Scripted Adapters
// =============================================================================

/// Disk probe answering from a table of paths
#[derive(Default)]
pub struct ScriptedDiskProbe {
    disks: DashMap<String, std::result::Result<DiskInfo, String>>,
}

impl ScriptedDiskProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: &str, filesystem_id: &str, maximum: i64, available: i64) {
        self.disks.insert(
            path.to_string(),
            Ok(DiskInfo {
                filesystem_id: filesystem_id.to_string(),
                storage_maximum: maximum,
                storage_available: available,
            }),
        );
    }

    pub fn fail(&self, path: &str, reason: &str) {
        self.disks.insert(path.to_string(), Err(reason.to_string()));
    }
}

#[async_trait]
impl DiskProbe for ScriptedDiskProbe {
    async fn probe(&self, path: &str) -> Result<DiskInfo> {
        match self.disks.get(path).map(|entry| entry.value().clone()) {
            Some(Ok(info)) => Ok(info),
            Some(Err(reason)) => Err(Error::ProbeFailure {
                target: path.to_string(),
                reason,
            }),
            None => Err(Error::ProbeFailure {
                target: path.to_string(),
                reason: "no such path".into(),
            }),
        }
    }
}

/// Engine binary inspector answering from a table of images
#[derive(Default)]
pub struct ScriptedInspector {
    versions: DashMap<String, EngineVersionDetails>,
    calls: AtomicUsize,
}

impl ScriptedInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, image: &str, details: EngineVersionDetails) {
        self.versions.insert(image.to_string(), details);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineBinaryInspector for ScriptedInspector {
    async fn version(&self, image: &str) -> Result<EngineVersionDetails> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.versions
            .get(image)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::ProbeFailure {
                target: image.to_string(),
                reason: "engine binary not deployed".into(),
            })
    }
}

/// Version details inside the default supported API range
pub fn compatible_version() -> EngineVersionDetails {
    EngineVersionDetails {
        version: "v1.4.0".into(),
        git_commit: "3f2c1a9".into(),
        build_date: "2024-02-01T00:00:00Z".into(),
        cli_api_version: 4,
        cli_api_min_version: 3,
        controller_api_version: 4,
        controller_api_min_version: 3,
        data_format_version: 1,
        data_format_min_version: 1,
    }
}

// =============================================================================
// Storage Objects
// =============================================================================

pub fn storage_node(name: &str, disks: &[(&str, &str)]) -> StorageNode {
    let disks = disks
        .iter()
        .map(|(id, path)| {
            (
                id.to_string(),
                DiskSpec {
                    path: path.to_string(),
                    allow_scheduling: true,
                    storage_reserved: 0,
                },
            )
        })
        .collect();
    let mut node = StorageNode::new(name, StorageNodeSpec { disks });
    node.metadata.namespace = Some(NAMESPACE.into());
    node
}

/// Diskless storage node with the given Ready condition
pub fn storage_node_with_ready(
    name: &str,
    status: ConditionStatus,
    why: &str,
) -> StorageNode {
    let mut node = storage_node(name, &[]);
    let mut node_status = StorageNodeStatus::default();
    set_condition(
        &mut node_status.conditions,
        NodeConditionType::Ready,
        status,
        why,
        "",
        test_now(),
    );
    node.status = Some(node_status);
    node
}

/// Overwrite a stored object, carrying over its resource version
pub async fn replace<K>(repo: &Repo<K>, mut obj: K) -> K
where
    K: kube::Resource + Clone + Send + Sync + 'static,
{
    let current = repo.get(&ObjectKey::of(&obj)).await.unwrap();
    obj.meta_mut().resource_version = current.meta().resource_version.clone();
    repo.update_status(&obj).await.unwrap()
}

pub fn engine_image(image: &str) -> EngineImage {
    let mut ei = EngineImage::new(
        &naming::engine_image_name(image),
        EngineImageSpec {
            image: image.to_string(),
        },
    );
    ei.metadata.namespace = Some(NAMESPACE.into());
    ei
}

pub fn instance_manager(
    image: &str,
    role: InstanceManagerType,
    node: &str,
    state: InstanceManagerState,
) -> InstanceManager {
    let mut im = InstanceManager::new(
        &naming::instance_manager_name(image, role, node),
        InstanceManagerSpec {
            node_id: node.to_string(),
            image: image.to_string(),
            manager_type: role,
        },
    );
    im.metadata.namespace = Some(NAMESPACE.into());
    im.metadata.labels = Some(naming::instance_manager_labels(image, role, node));
    im.status = Some(InstanceManagerStatus {
        current_state: state,
    });
    im
}

pub fn volume(name: &str, image: &str) -> Volume {
    let mut v = Volume::new(
        name,
        VolumeSpec {
            size: 10 * GIB,
            engine_image: image.to_string(),
            number_of_replicas: 3,
        },
    );
    v.metadata.namespace = Some(NAMESPACE.into());
    v.status = Some(VolumeStatus {
        current_image: image.to_string(),
        ..Default::default()
    });
    v
}

pub fn engine(name: &str, volume: &str, image: &str, instance_manager: &str) -> Engine {
    let mut e = Engine::new(
        name,
        EngineSpec {
            volume_name: volume.to_string(),
            engine_image: image.to_string(),
            node_id: NODE_1.into(),
        },
    );
    e.metadata.namespace = Some(NAMESPACE.into());
    e.status = Some(EngineStatus {
        current_image: image.to_string(),
        instance_manager_name: instance_manager.to_string(),
    });
    e
}

pub fn replica(name: &str, node: &str, disk: &str, size: i64) -> Replica {
    let mut r = Replica::new(
        name,
        ReplicaSpec {
            volume_name: "vol-1".into(),
            node_id: node.to_string(),
            disk_id: disk.to_string(),
            volume_size: size,
            failed_at: None,
        },
    );
    r.metadata.namespace = Some(NAMESPACE.into());
    r
}

// =============================================================================
// Platform Objects
// =============================================================================

/// Manager daemon pod on `node`
pub fn manager_pod(node: &str, phase: &str, bidirectional: bool) -> Pod {
    let propagation = bidirectional.then(|| "Bidirectional".to_string());
    Pod {
        metadata: kube::api::ObjectMeta {
            name: Some(format!("blockstore-manager-{}", node)),
            namespace: Some(NAMESPACE.into()),
            labels: Some(BTreeMap::from([(
                "app".to_string(),
                "blockstore-manager".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            containers: vec![Container {
                name: "manager".into(),
                volume_mounts: Some(vec![VolumeMount {
                    name: "data".into(),
                    mount_path: "/var/lib/blockstore".into(),
                    mount_propagation: propagation,
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

/// Cluster node with the given `(type, status)` conditions
pub fn kube_node(name: &str, conditions: &[(&str, &str)]) -> Node {
    Node {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: None,
        status: Some(NodeStatus {
            conditions: Some(
                conditions
                    .iter()
                    .map(|(type_, status)| NodeCondition {
                        type_: type_.to_string(),
                        status: status.to_string(),
                        message: Some(format!("{} is {}", type_, status)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
    }
}

pub fn ready_kube_node(name: &str) -> Node {
    kube_node(
        name,
        &[
            ("Ready", "True"),
            ("DiskPressure", "False"),
            ("MemoryPressure", "False"),
            ("PIDPressure", "False"),
            ("NetworkUnavailable", "False"),
        ],
    )
}

/// Engine-image DaemonSet using the current label scheme
pub fn daemon_set(image: &str, available: i32) -> DaemonSet {
    let labels = naming::daemon_set_labels(image);
    DaemonSet {
        metadata: kube::api::ObjectMeta {
            name: Some(naming::daemon_set_name(image)),
            namespace: Some(NAMESPACE.into()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }),
        status: Some(DaemonSetStatus {
            number_available: Some(available),
            ..Default::default()
        }),
    }
}

/// Persistent volume provisioned by our CSI driver for `volume`
pub fn persistent_volume(
    name: &str,
    volume: &str,
    claim: Option<(&str, &str)>,
    phase: &str,
) -> PersistentVolume {
    PersistentVolume {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            csi: Some(CSIPersistentVolumeSource {
                driver: CSI_DRIVER.into(),
                volume_handle: volume.to_string(),
                ..Default::default()
            }),
            claim_ref: claim.map(|(namespace, name)| ObjectReference {
                kind: Some("PersistentVolumeClaim".into()),
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: Some(PersistentVolumeStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

pub fn persistent_volume_claim(namespace: &str, name: &str, phase: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: None,
        status: Some(PersistentVolumeClaimStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

/// Workload pod mounting `claim`, optionally owned by `(kind, name)`
pub fn workload_pod(
    namespace: &str,
    name: &str,
    claim: &str,
    node: Option<&str>,
    phase: &str,
    owner: Option<(&str, &str)>,
) -> Pod {
    Pod {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: owner.map(|(kind, owner_name)| {
                vec![OwnerReference {
                    api_version: "apps/v1".into(),
                    kind: kind.to_string(),
                    name: owner_name.to_string(),
                    uid: format!("uid-{}", owner_name),
                    controller: Some(true),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: node.map(str::to_string),
            containers: vec![Container {
                name: "app".into(),
                ..Default::default()
            }],
            volumes: Some(vec![PodVolume {
                name: "data".into(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.to_string(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

/// Mark an object as terminating
pub fn terminating<K: kube::Resource>(mut obj: K) -> K {
    obj.meta_mut().deletion_timestamp = Some(Time(test_now()));
    obj
}

pub fn volume_attachment(name: &str, pv: &str, node: &str) -> VolumeAttachment {
    VolumeAttachment {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: VolumeAttachmentSpec {
            attacher: CSI_DRIVER.into(),
            node_name: node.to_string(),
            source: VolumeAttachmentSource {
                persistent_volume_name: Some(pv.to_string()),
                ..Default::default()
            },
        },
        status: None,
    }
}
