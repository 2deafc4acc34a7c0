//! The in-process boundary with the provisioning service: the operations the
//! executor invokes, and the wire payloads they carry. Payload shapes follow
//! the remote contract's field names, one shape per cloud-service kind.

pub mod http;
pub mod mock;

pub use http::HttpProvisioningClient;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::environments::{DiskDescriptor, RuntimeConfig, RuntimeDescriptor, RuntimeRecord, VmDisk};

/// GPU attachment as the remote contract spells it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuConfigPayload {
    pub gpu_type: String,
    pub num_of_gpus: u32,
}

/// Persistent disk reference in a create-runtime payload. With only a name
/// it attaches an existing disk; with size and type it provisions a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentDiskPayload {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

/// Per-kind runtime config on the wire, tagged with the backend family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cloudService")]
pub enum RuntimeConfigPayload {
    #[serde(rename = "VM", rename_all = "camelCase")]
    Vm {
        machine_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        disk_size: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        persistent_disk: Option<PersistentDiskPayload>,
        autopause_threshold: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        gpu_config: Option<GpuConfigPayload>,
        zone: String,
    },
    #[serde(rename = "CLUSTER", rename_all = "camelCase")]
    Cluster {
        master_machine_type: String,
        master_disk_size: u32,
        number_of_workers: u32,
        number_of_preemptible_workers: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        worker_machine_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        worker_disk_size: Option<u32>,
        region: String,
    },
}

impl RuntimeConfigPayload {
    /// Transform a domain runtime config into its wire shape. For a VM on a
    /// persistent disk, `attached_disk` supplies size and type so the
    /// service can provision the disk when it does not exist yet.
    pub fn from_config(config: &RuntimeConfig, attached_disk: Option<&DiskDescriptor>) -> Self {
        match config {
            RuntimeConfig::Vm {
                machine_type,
                disk,
                autopause_threshold_minutes,
                gpu,
                zone,
            } => {
                let (disk_size, persistent_disk) = match disk {
                    VmDisk::Builtin { size_gb } => (Some(*size_gb), None),
                    VmDisk::Persistent { disk_name } => {
                        let payload = match attached_disk.filter(|d| d.name == *disk_name) {
                            Some(d) => PersistentDiskPayload {
                                name: d.name.clone(),
                                size: Some(d.size_gb),
                                disk_type: Some(d.disk_type.api_name().to_string()),
                                zone: Some(d.zone.clone()),
                            },
                            None => PersistentDiskPayload {
                                name: disk_name.clone(),
                                size: None,
                                disk_type: None,
                                zone: None,
                            },
                        };
                        (None, Some(payload))
                    }
                };
                RuntimeConfigPayload::Vm {
                    machine_type: machine_type.clone(),
                    disk_size,
                    persistent_disk,
                    autopause_threshold: *autopause_threshold_minutes,
                    gpu_config: gpu.as_ref().map(|g| GpuConfigPayload {
                        gpu_type: g.gpu_type.clone(),
                        num_of_gpus: g.num_gpus,
                    }),
                    zone: zone.clone(),
                }
            }
            RuntimeConfig::Cluster {
                master_machine_type,
                master_disk_size_gb,
                number_of_workers,
                number_of_preemptible_workers,
                worker_machine_type,
                worker_disk_size_gb,
                region,
            } => RuntimeConfigPayload::Cluster {
                master_machine_type: master_machine_type.clone(),
                master_disk_size: *master_disk_size_gb,
                number_of_workers: *number_of_workers,
                number_of_preemptible_workers: *number_of_preemptible_workers,
                worker_machine_type: worker_machine_type.clone(),
                worker_disk_size: *worker_disk_size_gb,
                region: region.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRuntimeRequest {
    pub runtime_config: RuntimeConfigPayload,
    pub tool_docker_image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_script_uri: Option<String>,
    pub enable_component_gateway: bool,
}

impl CreateRuntimeRequest {
    pub fn from_environment(
        runtime: &RuntimeDescriptor,
        attached_disk: Option<&DiskDescriptor>,
    ) -> Self {
        Self {
            runtime_config: RuntimeConfigPayload::from_config(&runtime.config, attached_disk),
            tool_docker_image: runtime.tool_docker_image.clone(),
            user_script_uri: runtime.user_script_uri.clone(),
            enable_component_gateway: runtime.component_gateway_enabled,
        }
    }
}

/// Full replacement config for an in-place update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRuntimeRequest {
    pub runtime_config: RuntimeConfigPayload,
}

impl UpdateRuntimeRequest {
    pub fn from_descriptor(runtime: &RuntimeDescriptor) -> Self {
        Self {
            runtime_config: RuntimeConfigPayload::from_config(&runtime.config, None),
        }
    }
}

/// The provisioning service, as this crate sees it. Implementations own all
/// transport concerns; callers treat every operation as opaque and
/// sequential.
#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    async fn list_runtimes(&self, project: &str) -> Result<Vec<RuntimeRecord>>;

    async fn list_disks(&self, project: &str) -> Result<Vec<DiskDescriptor>>;

    async fn create_runtime(
        &self,
        project: &str,
        name: &str,
        request: &CreateRuntimeRequest,
    ) -> Result<()>;

    async fn update_runtime(
        &self,
        project: &str,
        name: &str,
        request: &UpdateRuntimeRequest,
    ) -> Result<()>;

    /// Deleting a runtime can take its attached persistent disk with it in
    /// the same call.
    async fn delete_runtime(&self, project: &str, name: &str, also_delete_disk: bool)
        -> Result<()>;

    /// Disks only ever grow; `new_size_gb` below the current size is
    /// rejected remotely.
    async fn update_disk(&self, project: &str, name: &str, new_size_gb: u32) -> Result<()>;

    async fn delete_disk(&self, project: &str, name: &str) -> Result<()>;
}
