//! Engine Image Controller
//!
//! Keeps an engine image's binary deployed through a DaemonSet, checks the
//! deployed binary's API compatibility, maintains one engine-role and one
//! replica-role instance manager per eligible node, counts the volumes using
//! the image and deletes the image once it has been unused for longer than
//! the grace window.
//!
//! Exactly one live manager instance does an image's housekeeping: the one
//! named in `status.ownerId`. Another instance claims the image when the
//! owner's node is down or gone.

use super::runner::Reconciler;
use crate::config::ManagerConfig;
use crate::crd::{
    get_condition, reason, set_condition, ConditionStatus, EngineImage,
    EngineImageConditionType, EngineImageSpec, EngineImageState, EngineImageStatus,
    EngineVersionDetails, InstanceManager, InstanceManagerSpec, InstanceManagerType,
};
use crate::datastore::Datastore;
use crate::domain::naming;
use crate::domain::ports::{
    Clock, DiagnosticEvent, EngineBinaryInspector, EventRecorder, EventSeverity, VersionChecker,
};
use crate::error::{Error, Result, ResultExt};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ExecAction, HostPathVolumeSource, PodSpec, PodTemplateSpec, Probe,
    Volume as PodVolume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::Resource;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Mount point of the host binaries directory inside the DaemonSet pod
const BINARIES_MOUNT: &str = "/data";

/// Reconciles EngineImage objects
pub struct EngineImageController {
    ds: Datastore,
    config: ManagerConfig,
    inspector: Arc<dyn EngineBinaryInspector>,
    checker: Arc<dyn VersionChecker>,
    clock: Arc<dyn Clock>,
    recorder: Arc<dyn EventRecorder>,
    /// Inspections that reported no API version, by image reference
    unreported: DashMap<String, EngineVersionDetails>,
}

impl EngineImageController {
    pub fn new(
        ds: Datastore,
        config: ManagerConfig,
        inspector: Arc<dyn EngineBinaryInspector>,
        checker: Arc<dyn VersionChecker>,
        clock: Arc<dyn Clock>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            ds,
            config,
            inspector,
            checker,
            clock,
            recorder,
            unreported: DashMap::new(),
        }
    }

    /// Whether this instance should do the image's housekeeping
    async fn is_responsible(&self, ei: &EngineImage) -> Result<bool> {
        let owner = ei.owner_id();
        if owner == self.config.controller_id {
            return Ok(true);
        }
        self.ds.is_node_down_or_deleted(owner).await
    }

    /// Number of distinct volumes whose volume or engine uses `image`.
    ///
    /// An engine still served by one of this image's instance managers keeps
    /// the image referenced after a live upgrade moved its spec elsewhere.
    async fn count_references(&self, image: &str) -> Result<i32> {
        let managers: BTreeSet<String> = self
            .ds
            .list_instance_managers_for_image(image)
            .await?
            .into_keys()
            .collect();

        let mut volumes = BTreeSet::new();
        for volume in self.ds.list_volumes().await? {
            if volume.spec.engine_image == image || volume.current_image() == image {
                volumes.insert(volume.metadata.name.clone().unwrap_or_default());
            }
        }
        for engine in self.ds.list_engines().await? {
            if engine.spec.engine_image == image
                || engine.current_image() == image
                || managers.contains(engine.instance_manager_name())
            {
                volumes.insert(engine.spec.volume_name.clone());
            }
        }
        Ok(volumes.len() as i32)
    }

    fn is_expired(&self, image: &str, status: &EngineImageStatus, now: DateTime<Utc>) -> bool {
        if image == self.config.default_engine_image || status.ref_count != 0 {
            return false;
        }
        status
            .no_ref_since
            .and_then(|since| (now - since).to_std().ok())
            .map(|unused| unused > self.config.engine_image_grace)
            .unwrap_or(false)
    }

    /// Delete the DaemonSet and instance managers belonging to an image.
    ///
    /// Dependents are labelled with the canonical name of the image they
    /// deploy, so they are left alone while any other live EngineImage
    /// still deploys that image.
    async fn remove_dependents(&self, ei_name: &str, image: Option<&str>) -> Result<()> {
        let owner = image
            .map(naming::engine_image_name)
            .unwrap_or_else(|| ei_name.to_string());
        let shared = self.ds.list_engine_images().await?.iter().any(|ei| {
            ei.metadata.name.as_deref() != Some(ei_name)
                && !ei.is_deleting()
                && naming::engine_image_name(&ei.spec.image) == owner
        });
        if shared {
            debug!(
                "Dependents labelled {} still belong to a live engine image",
                owner
            );
            return Ok(());
        }

        let owner_label = naming::label("engine-image");
        let belongs = |meta: &ObjectMeta| {
            meta.labels
                .as_ref()
                .and_then(|l| l.get(&owner_label))
                .map(|v| *v == owner)
                .unwrap_or(false)
        };
        let ds_name = image.map(naming::daemon_set_name);

        for daemon_set in self.ds.daemon_sets.list(Some(&self.ds.namespace)).await? {
            if belongs(&daemon_set.metadata) || daemon_set.metadata.name == ds_name {
                info!(
                    "Deleting daemon set {} of engine image {}",
                    daemon_set.metadata.name.as_deref().unwrap_or(""),
                    ei_name
                );
                self.ds
                    .daemon_sets
                    .delete(&crate::datastore::ObjectKey::of(&daemon_set))
                    .await
                    .ignore_not_found()?;
            }
        }
        for im in self.ds.list_instance_managers().await? {
            if belongs(&im.metadata) || Some(im.spec.image.as_str()) == image {
                self.delete_instance_manager(&im).await?;
            }
        }
        Ok(())
    }

    async fn delete_instance_manager(&self, im: &InstanceManager) -> Result<()> {
        info!(
            "Deleting {} instance manager {} on {}",
            im.spec.manager_type,
            im.metadata.name.as_deref().unwrap_or(""),
            im.spec.node_id
        );
        self.ds
            .instance_managers
            .delete(&crate::datastore::ObjectKey::of(im))
            .await
            .ignore_not_found()?;
        Ok(())
    }

    fn desired_daemon_set(&self, ei: &EngineImage, image: &str) -> DaemonSet {
        let labels = naming::daemon_set_labels(image);
        let mut template_labels = labels.clone();
        let (version_key, version) = naming::version_label();
        template_labels.insert(version_key, version);

        let host_dir = self
            .config
            .engine_binaries_dir
            .join(naming::engine_image_name(image));

        DaemonSet {
            metadata: ObjectMeta {
                name: Some(naming::daemon_set_name(image)),
                namespace: Some(self.ds.namespace.clone()),
                labels: Some(labels.clone()),
                owner_references: ei.controller_owner_ref(&()).map(|r| vec![r]),
                ..Default::default()
            },
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(labels),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(template_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "engine-binaries".into(),
                            image: Some(image.to_string()),
                            image_pull_policy: Some("IfNotPresent".into()),
                            command: Some(vec!["/bin/sh".into(), "-c".into()]),
                            args: Some(vec![format!(
                                "cp -r /engine-binaries/* {}/ && trap : TERM INT; sleep infinity & wait",
                                BINARIES_MOUNT
                            )]),
                            readiness_probe: Some(Probe {
                                exec: Some(ExecAction {
                                    command: Some(vec![
                                        "ls".into(),
                                        format!("{}/blockstore-engine", BINARIES_MOUNT),
                                    ]),
                                }),
                                initial_delay_seconds: Some(5),
                                period_seconds: Some(5),
                                ..Default::default()
                            }),
                            volume_mounts: Some(vec![VolumeMount {
                                name: "engine-binaries".into(),
                                mount_path: BINARIES_MOUNT.into(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![PodVolume {
                            name: "engine-binaries".into(),
                            host_path: Some(HostPathVolumeSource {
                                path: host_dir.to_string_lossy().into_owned(),
                                type_: None,
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    fn desired_instance_manager(
        &self,
        ei: &EngineImage,
        image: &str,
        role: InstanceManagerType,
        node: &str,
    ) -> InstanceManager {
        let mut im = InstanceManager::new(
            &naming::instance_manager_name(image, role, node),
            InstanceManagerSpec {
                node_id: node.to_string(),
                image: image.to_string(),
                manager_type: role,
            },
        );
        im.metadata.namespace = Some(self.ds.namespace.clone());
        im.metadata.labels = Some(naming::instance_manager_labels(image, role, node));
        im.metadata.owner_references = ei.controller_owner_ref(&()).map(|r| vec![r]);
        im
    }

    /// Ensure the instance managers each node needs and remove the rest.
    /// Returns `(running, required)`.
    async fn sync_instance_managers(&self, ei: &EngineImage, image: &str) -> Result<(usize, usize)> {
        let existing = self.ds.list_instance_managers_for_image(image).await?;
        let mut required = BTreeSet::new();
        let mut running = 0;

        for node in self.ds.list_storage_nodes().await? {
            if node.meta().deletion_timestamp.is_some() {
                continue;
            }
            let node_name = node.node_name();
            let mut roles = vec![InstanceManagerType::Engine];
            // Engines need no local disk; replicas do
            if node.has_disks() {
                roles.push(InstanceManagerType::Replica);
            }

            for role in roles {
                let name = naming::instance_manager_name(image, role, node_name);
                match existing.get(&name) {
                    Some(im) if im.is_running() => running += 1,
                    Some(_) => {}
                    None => {
                        info!("Creating {} instance manager {} on {}", role, name, node_name);
                        self.ds
                            .instance_managers
                            .create(&self.desired_instance_manager(ei, image, role, node_name))
                            .await?;
                    }
                }
                required.insert(name);
            }
        }

        for (name, im) in &existing {
            if !required.contains(name) {
                self.delete_instance_manager(im).await?;
            }
        }
        Ok((running, required.len()))
    }

    /// Bring the DaemonSet, version check and instance managers in line and
    /// derive the image state from them
    async fn sync_deployment(
        &self,
        ei: &EngineImage,
        image: &str,
        status: &mut EngineImageStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Err(e) = naming::validate_image_reference(image) {
            let reported =
                get_condition(&status.conditions, EngineImageConditionType::Ready).reason
                    == reason::INVALID_IMAGE;
            status.state = EngineImageState::Deploying;
            set_condition(
                &mut status.conditions,
                EngineImageConditionType::Ready,
                ConditionStatus::False,
                reason::INVALID_IMAGE,
                &e.to_string(),
                now,
            );
            if !reported {
                self.publish(
                    ei,
                    DiagnosticEvent {
                        severity: EventSeverity::Warning,
                        reason: reason::INVALID_IMAGE.into(),
                        note: e.to_string(),
                        action: "Validate".into(),
                    },
                )
                .await;
            }
            return Err(e);
        }

        // Incompatible is terminal once the version is known
        if let Some(details) = self.known_version(image, status) {
            if !self.checker.is_compatible(&details, &self.config.api_range) {
                status.version_details = details;
                return self.mark_incompatible(image, status, now).await;
            }
        }

        let ds_name = naming::daemon_set_name(image);
        let ds_key = self.ds.key(&ds_name);
        let mut daemon_set = self.ds.daemon_sets.get(&ds_key).await.ignore_not_found()?;
        if let Some(existing) = &daemon_set {
            let selector = existing
                .spec
                .as_ref()
                .and_then(|s| s.selector.match_labels.as_ref());
            if !naming::selector_is_current(selector, image) {
                info!("Daemon set {} uses deprecated labels, redeploying", ds_name);
                self.ds.daemon_sets.delete(&ds_key).await.ignore_not_found()?;
                daemon_set = None;
            }
        }

        let daemon_set = match daemon_set {
            Some(daemon_set) => daemon_set,
            None => {
                info!("Creating daemon set {} for {}", ds_name, image);
                self.ds
                    .daemon_sets
                    .create(&self.desired_daemon_set(ei, image))
                    .await?;
                mark_deploying(
                    status,
                    reason::DAEMON_SET_NOT_AVAILABLE,
                    format!("daemon set {} created", ds_name),
                    now,
                );
                return Ok(());
            }
        };

        let available = daemon_set
            .status
            .as_ref()
            .and_then(|s| s.number_available)
            .unwrap_or(0);
        if available < 1 {
            mark_deploying(
                status,
                reason::DAEMON_SET_NOT_AVAILABLE,
                format!("daemon set {} has no available pods", ds_name),
                now,
            );
            return Ok(());
        }

        if !status.version_details.is_reported() {
            let details = self.inspector.version(image).await?;
            debug!("Engine image {} reports version {}", image, details.version);
            if !details.is_reported() {
                self.unreported.insert(image.to_string(), details.clone());
            }
            status.version_details = details;
        }
        if !self
            .checker
            .is_compatible(&status.version_details, &self.config.api_range)
        {
            return self.mark_incompatible(image, status, now).await;
        }

        let (running, required) = self.sync_instance_managers(ei, image).await?;
        if running < required {
            mark_deploying(
                status,
                reason::INSTANCE_MANAGERS_NOT_RUNNING,
                format!("{} of {} instance managers running", running, required),
                now,
            );
        } else {
            status.state = EngineImageState::Ready;
            set_condition(
                &mut status.conditions,
                EngineImageConditionType::Ready,
                ConditionStatus::True,
                "",
                "",
                now,
            );
        }
        Ok(())
    }

    /// Version details from the status, or from an earlier inspection that
    /// reported nothing
    fn known_version(
        &self,
        image: &str,
        status: &EngineImageStatus,
    ) -> Option<EngineVersionDetails> {
        if status.version_details.is_reported() {
            return Some(status.version_details.clone());
        }
        self.unreported.get(image).map(|d| d.value().clone())
    }

    async fn mark_incompatible(
        &self,
        image: &str,
        status: &mut EngineImageStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let range = self.config.api_range;
        let details = &status.version_details;
        let message = format!(
            "engine CLI API {} (min {}) is outside the supported range {}..={}",
            details.cli_api_version,
            details.cli_api_min_version,
            range.min_version,
            range.current_version
        );
        if status.state != EngineImageState::Incompatible {
            warn!("Engine image {} is incompatible: {}", image, message);
        }
        status.state = EngineImageState::Incompatible;
        set_condition(
            &mut status.conditions,
            EngineImageConditionType::Ready,
            ConditionStatus::False,
            reason::INCOMPATIBLE_VERSION,
            &message,
            now,
        );
        for im in self.ds.list_instance_managers_for_image(image).await?.values() {
            self.delete_instance_manager(im).await?;
        }
        Ok(())
    }

    async fn publish(&self, ei: &EngineImage, event: DiagnosticEvent) {
        self.recorder.publish(&ei.object_ref(&()), event).await;
    }
}

fn mark_deploying(
    status: &mut EngineImageStatus,
    why: &str,
    message: String,
    now: DateTime<Utc>,
) {
    status.state = EngineImageState::Deploying;
    set_condition(
        &mut status.conditions,
        EngineImageConditionType::Ready,
        ConditionStatus::False,
        why,
        &message,
        now,
    );
}

#[async_trait]
impl Reconciler for EngineImageController {
    fn name(&self) -> &'static str {
        "engine-image"
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        let ei = match self
            .ds
            .engine_images
            .get(&self.ds.key(key))
            .await
            .ignore_not_found()?
        {
            Some(ei) => ei,
            None => {
                debug!("Engine image {} is gone, removing leftovers", key);
                return self.remove_dependents(key, None).await;
            }
        };

        if !self.is_responsible(&ei).await? {
            debug!("Engine image {} is handled by {}", key, ei.owner_id());
            return Ok(());
        }

        let image = ei.spec.image.clone();
        if ei.is_deleting() {
            info!("Engine image {} is being deleted", key);
            return self.remove_dependents(key, Some(&image)).await;
        }

        let now = self.clock.now();
        let mut status = ei.status.clone().unwrap_or_default();
        if status.owner_id != self.config.controller_id {
            info!(
                "Engine image {} owner changed from '{}' to {}",
                key, status.owner_id, self.config.controller_id
            );
            status.owner_id = self.config.controller_id.clone();
        }

        status.ref_count = self.count_references(&image).await?;
        if status.ref_count == 0 {
            if status.no_ref_since.is_none() {
                status.no_ref_since = Some(now);
            }
        } else {
            status.no_ref_since = None;
        }

        if self.is_expired(&image, &status, now) {
            info!(
                "Engine image {} unused since {:?}, deleting",
                image, status.no_ref_since
            );
            self.ds
                .engine_images
                .delete(&self.ds.key(key))
                .await
                .ignore_not_found()?;
            self.remove_dependents(key, Some(&image)).await?;
            self.publish(
                &ei,
                DiagnosticEvent {
                    severity: EventSeverity::Normal,
                    reason: "Expired".into(),
                    note: format!("engine image {} was unused past its grace window", image),
                    action: "Delete".into(),
                },
            )
            .await;
            return Ok(());
        }

        let outcome = self.sync_deployment(&ei, &image, &mut status, now).await;

        let previous = ei.state();
        let changed = ei
            .status
            .as_ref()
            .map(|current| !current.equivalent(&status))
            .unwrap_or(true);
        if changed {
            let mut updated = ei.clone();
            updated.status = Some(status.clone());
            self.ds.engine_images.update_status(&updated).await?;
        }
        if previous != status.state {
            info!("Engine image {} is now {}", image, status.state);
            if status.state == EngineImageState::Ready {
                self.publish(
                    &ei,
                    DiagnosticEvent {
                        severity: EventSeverity::Normal,
                        reason: "Ready".into(),
                        note: format!("engine image {} is deployed", image),
                        action: "Deploy".into(),
                    },
                )
                .await;
            } else if status.state == EngineImageState::Incompatible {
                self.publish(
                    &ei,
                    DiagnosticEvent {
                        severity: EventSeverity::Warning,
                        reason: reason::INCOMPATIBLE_VERSION.into(),
                        note: get_condition(&status.conditions, EngineImageConditionType::Ready)
                            .message,
                        action: "CheckVersion".into(),
                    },
                )
                .await;
            }
        }
        outcome
    }

    async fn retries_exhausted(&self, key: &str, error: &Error) {
        if let Ok(ei) = self.ds.engine_images.get(&self.ds.key(key)).await {
            self.publish(
                &ei,
                DiagnosticEvent {
                    severity: EventSeverity::Warning,
                    reason: "ReconcileFailed".into(),
                    note: error.to_string(),
                    action: "Reconcile".into(),
                },
            )
            .await;
        }
    }
}

/// Create the EngineImage for the configured default image if it is missing
pub async fn ensure_default_engine_image(ds: &Datastore, config: &ManagerConfig) -> Result<()> {
    if config.default_engine_image.is_empty() {
        return Ok(());
    }
    let image = &config.default_engine_image;
    let name = naming::engine_image_name(image);
    if ds.engine_images.get(&ds.key(&name)).await.ignore_not_found()?.is_some() {
        return Ok(());
    }

    let mut ei = EngineImage::new(
        &name,
        EngineImageSpec {
            image: image.clone(),
        },
    );
    ei.metadata.namespace = Some(ds.namespace.clone());
    match ds.engine_images.create(&ei).await {
        Ok(_) => {
            info!("Created default engine image {} ({})", name, image);
            Ok(())
        }
        // Another instance got there first
        Err(Error::AlreadyExists { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}
