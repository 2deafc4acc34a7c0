use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::{CreateRuntimeRequest, ProvisioningClient, UpdateRuntimeRequest};
use crate::config::compute::{CloudServiceKind, ComputeConfig};
use crate::core::error::EnvError;
use crate::core::types::{DiskType, GpuConfig, RuntimeStatus};
use crate::pricing::{self, CostProjection};
use crate::reconcile::{self, ActionPlan, WarningKind};

/// Provisioning backend family a runtime lives on. Single VMs and managed
/// clusters are created through different API surfaces and cannot be
/// converted into one another in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloudService {
    Vm,
    Cluster,
}

impl fmt::Display for CloudService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudService::Vm => f.write_str("VM"),
            CloudService::Cluster => f.write_str("managed cluster"),
        }
    }
}

/// Disk backing a single-VM runtime: either a built-in boot disk that dies
/// with the runtime, or a persistent disk attached by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VmDisk {
    Builtin { size_gb: u32 },
    Persistent { disk_name: String },
}

/// The per-kind machine shape of a runtime. A closed enum: VM fields and
/// cluster fields never coexist on one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuntimeConfig {
    Vm {
        machine_type: String,
        disk: VmDisk,
        autopause_threshold_minutes: u32,
        gpu: Option<GpuConfig>,
        zone: String,
    },
    Cluster {
        master_machine_type: String,
        master_disk_size_gb: u32,
        number_of_workers: u32,
        number_of_preemptible_workers: u32,
        worker_machine_type: Option<String>,
        worker_disk_size_gb: Option<u32>,
        region: String,
    },
}

impl RuntimeConfig {
    pub fn cloud_service(&self) -> CloudService {
        match self {
            RuntimeConfig::Vm { .. } => CloudService::Vm,
            RuntimeConfig::Cluster { .. } => CloudService::Cluster,
        }
    }

    /// Machine type of the runtime, the master node's for clusters.
    pub fn machine_type(&self) -> &str {
        match self {
            RuntimeConfig::Vm { machine_type, .. } => machine_type,
            RuntimeConfig::Cluster {
                master_machine_type, ..
            } => master_machine_type,
        }
    }
}

/// Full configuration of a provisioned (or to-be-provisioned) runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub tool_docker_image: String,
    pub user_script_uri: Option<String>,
    pub component_gateway_enabled: bool,
    pub config: RuntimeConfig,
}

impl RuntimeDescriptor {
    pub fn cloud_service(&self) -> CloudService {
        self.config.cloud_service()
    }

    pub fn gpu(&self) -> Option<&GpuConfig> {
        match &self.config {
            RuntimeConfig::Vm { gpu, .. } => gpu.as_ref(),
            RuntimeConfig::Cluster { .. } => None,
        }
    }

    /// Name of the persistent disk this runtime is attached to, if any.
    pub fn attached_disk_name(&self) -> Option<&str> {
        match &self.config {
            RuntimeConfig::Vm {
                disk: VmDisk::Persistent { disk_name },
                ..
            } => Some(disk_name),
            _ => None,
        }
    }
}

/// A persistent disk as known to the provisioning service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    pub name: String,
    pub size_gb: u32,
    pub disk_type: DiskType,
    pub zone: String,
}

/// A runtime record as fetched from the provisioning service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRecord {
    pub name: String,
    pub status: RuntimeStatus,
    pub descriptor: RuntimeDescriptor,
}

/// Last-known remote state for one project, stamped with its fetch time.
/// Only a successful re-fetch replaces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub runtime: Option<RuntimeRecord>,
    pub disk: Option<DiskDescriptor>,
    pub fetched_at: DateTime<Utc>,
}

impl EnvironmentSnapshot {
    /// Project the snapshot into the shape the reconciler diffs against a
    /// desired config.
    pub fn to_existing(&self) -> EnvironmentConfig {
        let runtime = self.runtime.as_ref().map(|r| r.descriptor.clone());
        let has_gpu = runtime.as_ref().map(|d| d.gpu().is_some()).unwrap_or(false);
        EnvironmentConfig {
            runtime,
            persistent_disk: self.disk.clone(),
            has_gpu,
        }
    }
}

/// One side of a reconciliation: either the existing environment (projected
/// from the last snapshot) or the desired one (projected from a
/// [`ComputeConfig`] and a view mode). `None` means "not provisioned".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub runtime: Option<RuntimeDescriptor>,
    pub persistent_disk: Option<DiskDescriptor>,
    pub has_gpu: bool,
}

impl EnvironmentConfig {
    /// True when the runtime is a VM attached to a persistent disk.
    pub fn runtime_has_attached_disk(&self) -> bool {
        self.runtime
            .as_ref()
            .and_then(|r| r.attached_disk_name())
            .is_some()
    }

    /// The persistent disk, but only when the runtime references it by name.
    pub fn attached_disk(&self) -> Option<&DiskDescriptor> {
        let name = self.runtime.as_ref()?.attached_disk_name()?;
        self.persistent_disk.as_ref().filter(|d| d.name == name)
    }
}

/// What the user is doing in the session: editing the environment, or
/// tearing it down (optionally keeping the persistent disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewMode {
    Normal,
    DeleteEnvironment { delete_disk: bool },
}

pub fn generate_runtime_name(project: &str) -> String {
    format!("{}-runtime-{}", project, short_id())
}

pub fn generate_disk_name(project: &str) -> String {
    format!("{}-disk-{}", project, short_id())
}

fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Build the desired environment from the user's compute config, the view
/// mode and the existing environment.
///
/// Fields the provisioning service cannot change after creation (zone,
/// region, disk name, disk type) are inherited from the existing resources
/// so that an untouched config diffs as unchanged. A persistent disk that
/// the desired runtime cannot carry (managed clusters, or a VM on a
/// built-in boot disk) survives detached rather than being dropped.
pub fn desired_environment(
    project: &str,
    compute: &ComputeConfig,
    mode: ViewMode,
    existing: &EnvironmentConfig,
) -> EnvironmentConfig {
    match mode {
        ViewMode::DeleteEnvironment { delete_disk } => EnvironmentConfig {
            runtime: None,
            persistent_disk: if delete_disk {
                None
            } else {
                existing.persistent_disk.clone()
            },
            has_gpu: false,
        },
        ViewMode::Normal => {
            let existing_vm_zone = existing.runtime.as_ref().and_then(|r| match &r.config {
                RuntimeConfig::Vm { zone, .. } => Some(zone.clone()),
                RuntimeConfig::Cluster { .. } => None,
            });
            let existing_region = existing.runtime.as_ref().and_then(|r| match &r.config {
                RuntimeConfig::Cluster { region, .. } => Some(region.clone()),
                RuntimeConfig::Vm { .. } => None,
            });

            let (config, persistent_disk) = match compute.cloud_service_kind {
                CloudServiceKind::Vm if compute.use_persistent_disk => {
                    // A surviving disk keeps its name, type and zone; a disk
                    // that cannot survive (shrink) is replaced by a brand-new
                    // one under a generated unique name
                    let disk = match &existing.persistent_disk {
                        Some(existing_disk) if compute.disk_size_gb >= existing_disk.size_gb => {
                            DiskDescriptor {
                                name: existing_disk.name.clone(),
                                size_gb: compute.disk_size_gb,
                                disk_type: existing_disk.disk_type,
                                zone: existing_disk.zone.clone(),
                            }
                        }
                        _ => DiskDescriptor {
                            name: generate_disk_name(project),
                            size_gb: compute.disk_size_gb,
                            disk_type: compute.disk_type,
                            zone: compute.compute_zone.clone(),
                        },
                    };
                    let config = compute.to_vm_config(
                        VmDisk::Persistent {
                            disk_name: disk.name.clone(),
                        },
                        existing_vm_zone.unwrap_or_else(|| compute.compute_zone.clone()),
                    );
                    (config, Some(disk))
                }
                CloudServiceKind::Vm => {
                    let config = compute.to_vm_config(
                        VmDisk::Builtin {
                            size_gb: compute.disk_size_gb,
                        },
                        existing_vm_zone.unwrap_or_else(|| compute.compute_zone.clone()),
                    );
                    // A previously provisioned persistent disk survives, detached
                    (config, existing.persistent_disk.clone())
                }
                CloudServiceKind::SingleNodeCluster | CloudServiceKind::MultiNodeCluster => {
                    let config = compute.to_cluster_config(
                        existing_region.unwrap_or_else(|| compute.compute_region.clone()),
                    );
                    (config, existing.persistent_disk.clone())
                }
            };

            EnvironmentConfig {
                runtime: Some(RuntimeDescriptor {
                    tool_docker_image: compute.tool_docker_image.clone(),
                    user_script_uri: compute.user_script_uri.clone(),
                    component_gateway_enabled: compute.gateway_components_enabled,
                    config,
                }),
                persistent_disk,
                has_gpu: compute.gpu.is_some(),
            }
        }
    }
}

/// The output of planning: both sides of the diff, the operation flags, the
/// warnings a user must acknowledge, and the projected cost of the desired
/// environment.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedChange {
    pub existing: EnvironmentConfig,
    pub desired: EnvironmentConfig,
    pub plan: ActionPlan,
    pub warnings: Vec<WarningKind>,
    pub cost: CostProjection,
}

impl PlannedChange {
    pub fn has_changes(&self) -> bool {
        !self.plan.is_noop()
    }
}

/// A remote operation that was actually executed during an apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExecutedStep {
    DeletedRuntime { name: String, also_deleted_disk: bool },
    DeletedDisk { name: String },
    ResizedDisk { name: String, size_gb: u32 },
    UpdatedRuntime { name: String },
    CreatedRuntime { name: String, disk_name: Option<String> },
}

impl fmt::Display for ExecutedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutedStep::DeletedRuntime {
                name,
                also_deleted_disk: true,
            } => write!(f, "Deleted runtime {} and its attached disk", name),
            ExecutedStep::DeletedRuntime { name, .. } => write!(f, "Deleted runtime {}", name),
            ExecutedStep::DeletedDisk { name } => write!(f, "Deleted persistent disk {}", name),
            ExecutedStep::ResizedDisk { name, size_gb } => {
                write!(f, "Resized persistent disk {} to {} GB", name, size_gb)
            }
            ExecutedStep::UpdatedRuntime { name } => write!(f, "Updated runtime {}", name),
            ExecutedStep::CreatedRuntime {
                name,
                disk_name: Some(disk),
            } => write!(f, "Created runtime {} with persistent disk {}", name, disk),
            ExecutedStep::CreatedRuntime { name, .. } => write!(f, "Created runtime {}", name),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub steps: Vec<ExecutedStep>,
}

/// Per-session mutable state: the cached snapshot and the busy flag that
/// serializes applies within this session. Cross-session writers are not
/// detected; the provisioning service is last-writer-wins.
#[derive(Debug, Default)]
pub struct SessionContext {
    snapshot: Option<EnvironmentSnapshot>,
    busy: bool,
}

pub struct EnvironmentManager {
    project: String,
    client: Arc<dyn ProvisioningClient>,
    session: SessionContext,
}

impl EnvironmentManager {
    pub fn new(project: impl Into<String>, client: Arc<dyn ProvisioningClient>) -> Self {
        Self {
            project: project.into(),
            client,
            session: SessionContext::default(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn snapshot(&self) -> Option<&EnvironmentSnapshot> {
        self.session.snapshot.as_ref()
    }

    /// Fetch the remote runtime and disk records and replace the cached
    /// snapshot. The previous snapshot is kept if the fetch fails.
    pub async fn refresh(&mut self) -> Result<EnvironmentSnapshot> {
        let (runtimes, disks) = futures::future::try_join(
            self.client.list_runtimes(&self.project),
            self.client.list_disks(&self.project),
        )
        .await
        .context("Failed to fetch environment state")?;

        let runtime = runtimes.into_iter().next();
        let disk = match runtime.as_ref().and_then(|r| r.descriptor.attached_disk_name()) {
            Some(name) => disks.into_iter().find(|d| d.name == name),
            None => disks.into_iter().next(),
        };

        debug!(
            runtime = runtime.as_ref().map(|r| r.name.as_str()).unwrap_or("<none>"),
            disk = disk.as_ref().map(|d| d.name.as_str()).unwrap_or("<none>"),
            "Fetched environment state"
        );

        let snapshot = EnvironmentSnapshot {
            runtime,
            disk,
            fetched_at: Utc::now(),
        };
        self.session.snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// The existing environment per the cached snapshot, empty if nothing
    /// has been fetched yet.
    pub fn existing_config(&self) -> EnvironmentConfig {
        self.session
            .snapshot
            .as_ref()
            .map(|s| s.to_existing())
            .unwrap_or_default()
    }

    /// Validate the compute config, diff desired against existing and
    /// produce the operation plan with its warnings and cost projection.
    /// Planning never mutates remote state.
    pub async fn plan(&mut self, compute: &ComputeConfig, mode: ViewMode) -> Result<PlannedChange> {
        if mode == ViewMode::Normal {
            compute.validate()?;
        }
        if self.session.snapshot.is_none() {
            self.refresh().await?;
        }
        let existing = self.existing_config();
        let desired = desired_environment(&self.project, compute, mode, &existing);
        let plan = reconcile::compute_action_plan(&existing, &desired);
        let warnings = reconcile::classify_warnings(&existing, &desired);
        let cost = pricing::project_environment_cost(&desired);
        debug!(?plan, ?warnings, "Planned environment change");
        Ok(PlannedChange {
            existing,
            desired,
            plan,
            warnings,
            cost,
        })
    }

    /// Execute a planned change: delete runtime, delete orphaned disk,
    /// resize disk, then update or create the runtime, strictly in that
    /// order. A failing step aborts the rest; completed steps are not
    /// rolled back and the snapshot is only refreshed on success.
    pub async fn apply(&mut self, change: &PlannedChange) -> Result<ApplyOutcome> {
        if self.session.busy {
            return Err(EnvError::ApplyInProgress.into());
        }
        if !change.has_changes() {
            info!("No changes to apply");
            return Ok(ApplyOutcome { steps: Vec::new() });
        }
        self.session.busy = true;
        let result = self.execute_plan(change).await;
        self.session.busy = false;
        result
    }

    async fn execute_plan(&mut self, change: &PlannedChange) -> Result<ApplyOutcome> {
        let mut steps = Vec::new();
        let plan = change.plan;
        let existing_runtime_name = self
            .session
            .snapshot
            .as_ref()
            .and_then(|s| s.runtime.as_ref())
            .map(|r| r.name.clone());

        // A combined delete covers the attached disk; a disk that is merely
        // orphaned needs its own call afterwards.
        let combined_disk_delete = plan.delete_runtime
            && plan.delete_persistent_disk
            && change.existing.runtime_has_attached_disk();

        if plan.delete_runtime {
            let name = existing_runtime_name
                .clone()
                .context("Plan deletes a runtime but none is known")?;
            info!(runtime = %name, also_delete_disk = combined_disk_delete, "Deleting runtime");
            self.client
                .delete_runtime(&self.project, &name, combined_disk_delete)
                .await
                .with_context(|| format!("Failed to delete runtime {}", name))?;
            steps.push(ExecutedStep::DeletedRuntime {
                name,
                also_deleted_disk: combined_disk_delete,
            });
        }

        if plan.delete_persistent_disk && !combined_disk_delete {
            let disk = change
                .existing
                .persistent_disk
                .as_ref()
                .context("Plan deletes a disk but none is known")?;
            info!(disk = %disk.name, "Deleting persistent disk");
            self.client
                .delete_disk(&self.project, &disk.name)
                .await
                .with_context(|| format!("Failed to delete disk {}", disk.name))?;
            steps.push(ExecutedStep::DeletedDisk {
                name: disk.name.clone(),
            });
        }

        if plan.update_persistent_disk {
            let disk = change
                .desired
                .persistent_disk
                .as_ref()
                .context("Plan resizes a disk but none is desired")?;
            info!(disk = %disk.name, size_gb = disk.size_gb, "Resizing persistent disk");
            self.client
                .update_disk(&self.project, &disk.name, disk.size_gb)
                .await
                .with_context(|| format!("Failed to resize disk {}", disk.name))?;
            steps.push(ExecutedStep::ResizedDisk {
                name: disk.name.clone(),
                size_gb: disk.size_gb,
            });
        }

        if plan.update_runtime {
            let name = existing_runtime_name
                .context("Plan updates a runtime but none is known")?;
            let runtime = change
                .desired
                .runtime
                .as_ref()
                .context("Plan updates a runtime but none is desired")?;
            let request = UpdateRuntimeRequest::from_descriptor(runtime);
            info!(runtime = %name, "Updating runtime in place");
            self.client
                .update_runtime(&self.project, &name, &request)
                .await
                .with_context(|| format!("Failed to update runtime {}", name))?;
            steps.push(ExecutedStep::UpdatedRuntime { name });
        } else if plan.create_runtime {
            let runtime = change
                .desired
                .runtime
                .as_ref()
                .context("Plan creates a runtime but none is desired")?;
            let name = generate_runtime_name(&self.project);
            let disk = change.desired.attached_disk();
            let request = CreateRuntimeRequest::from_environment(runtime, disk);
            info!(runtime = %name, "Creating runtime");
            self.client
                .create_runtime(&self.project, &name, &request)
                .await
                .with_context(|| format!("Failed to create runtime {}", name))?;
            steps.push(ExecutedStep::CreatedRuntime {
                name,
                disk_name: disk.map(|d| d.name.clone()),
            });
        }

        self.refresh()
            .await
            .context("Changes applied, but refreshing environment state failed")?;
        Ok(ApplyOutcome { steps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vm_compute() -> ComputeConfig {
        ComputeConfig::default()
    }

    fn existing_with_pd(size_gb: u32) -> EnvironmentConfig {
        let disk = DiskDescriptor {
            name: "proj-disk-abc123".to_string(),
            size_gb,
            disk_type: DiskType::Standard,
            zone: "us-central1-a".to_string(),
        };
        EnvironmentConfig {
            runtime: Some(RuntimeDescriptor {
                tool_docker_image: vm_compute().tool_docker_image,
                user_script_uri: None,
                component_gateway_enabled: false,
                config: RuntimeConfig::Vm {
                    machine_type: "n1-standard-4".to_string(),
                    disk: VmDisk::Persistent {
                        disk_name: disk.name.clone(),
                    },
                    autopause_threshold_minutes: 30,
                    gpu: None,
                    zone: "us-central1-a".to_string(),
                },
            }),
            persistent_disk: Some(disk),
            has_gpu: false,
        }
    }

    #[test]
    fn test_desired_inherits_disk_name_and_type() {
        let existing = existing_with_pd(100);
        let desired = desired_environment("proj", &vm_compute(), ViewMode::Normal, &existing);
        let disk = desired.persistent_disk.unwrap();
        assert_eq!(disk.name, "proj-disk-abc123");
        assert_eq!(disk.disk_type, DiskType::Standard);
    }

    #[test]
    fn test_desired_matches_existing_when_unchanged() {
        let existing = existing_with_pd(100);
        let desired = desired_environment("proj", &vm_compute(), ViewMode::Normal, &existing);
        assert_eq!(desired, existing);
    }

    #[test]
    fn test_desired_generates_disk_name_when_none_exists() {
        let existing = EnvironmentConfig::default();
        let desired = desired_environment("proj", &vm_compute(), ViewMode::Normal, &existing);
        let disk = desired.persistent_disk.unwrap();
        assert!(disk.name.starts_with("proj-disk-"));
        assert_eq!(
            desired.runtime.unwrap().attached_disk_name(),
            Some(disk.name.as_str())
        );
    }

    #[test]
    fn test_shrinking_disk_gets_a_fresh_name() {
        let existing = existing_with_pd(100);
        let compute = ComputeConfig {
            disk_size_gb: 50,
            ..vm_compute()
        };
        let desired = desired_environment("proj", &compute, ViewMode::Normal, &existing);
        let disk = desired.persistent_disk.unwrap();
        assert_ne!(disk.name, "proj-disk-abc123");
        assert!(disk.name.starts_with("proj-disk-"));
        assert_eq!(disk.size_gb, 50);
    }

    #[test]
    fn test_delete_mode_keeps_or_drops_disk() {
        let existing = existing_with_pd(100);

        let kept = desired_environment(
            "proj",
            &vm_compute(),
            ViewMode::DeleteEnvironment { delete_disk: false },
            &existing,
        );
        assert_eq!(kept.runtime, None);
        assert_eq!(kept.persistent_disk, existing.persistent_disk);

        let dropped = desired_environment(
            "proj",
            &vm_compute(),
            ViewMode::DeleteEnvironment { delete_disk: true },
            &existing,
        );
        assert_eq!(dropped.runtime, None);
        assert_eq!(dropped.persistent_disk, None);
    }

    #[test]
    fn test_cluster_desired_carries_existing_disk_detached() {
        let existing = existing_with_pd(100);
        let compute = ComputeConfig {
            cloud_service_kind: CloudServiceKind::SingleNodeCluster,
            use_persistent_disk: false,
            ..vm_compute()
        };
        let desired = desired_environment("proj", &compute, ViewMode::Normal, &existing);
        assert_eq!(desired.persistent_disk, existing.persistent_disk);
        let runtime = desired.runtime.unwrap();
        assert_eq!(runtime.cloud_service(), CloudService::Cluster);
        assert_eq!(runtime.attached_disk_name(), None);
    }

    #[test]
    fn test_attached_disk_requires_name_match() {
        let mut env = existing_with_pd(100);
        assert!(env.attached_disk().is_some());
        env.persistent_disk.as_mut().unwrap().name = "other-disk".to_string();
        assert!(env.attached_disk().is_none());
    }

    #[test]
    fn test_generated_names_carry_project_prefix() {
        let runtime = generate_runtime_name("proj");
        let disk = generate_disk_name("proj");
        assert!(runtime.starts_with("proj-runtime-"));
        assert!(disk.starts_with("proj-disk-"));
        assert_ne!(generate_disk_name("proj"), disk);
    }
}
