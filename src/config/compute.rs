use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::core::error::{EnvError, EnvResult};
use crate::core::types::{DiskType, GpuConfig};
use crate::environments::{RuntimeConfig, VmDisk};
use crate::pricing;

/// Minimum persistent/boot disk size accepted by the provisioning service.
pub const MIN_DISK_SIZE_GB: u32 = 10;

/// Instance family requested for a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloudServiceKind {
    Vm,
    SingleNodeCluster,
    MultiNodeCluster,
}

impl CloudServiceKind {
    pub fn is_cluster(&self) -> bool {
        matches!(
            self,
            CloudServiceKind::SingleNodeCluster | CloudServiceKind::MultiNodeCluster
        )
    }
}

impl fmt::Display for CloudServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloudServiceKind::Vm => "vm",
            CloudServiceKind::SingleNodeCluster => "single-node-cluster",
            CloudServiceKind::MultiNodeCluster => "multi-node-cluster",
        };
        f.write_str(s)
    }
}

/// The user's in-progress desired configuration for a cloud environment.
///
/// This is the mutable, session-owned shape: it is seeded from the last
/// known remote state (or defaults), edited freely, and only turned into a
/// well-typed runtime config by the per-kind constructors below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    pub cloud_service_kind: CloudServiceKind,
    pub machine_type: String,
    pub disk_size_gb: u32,
    pub disk_type: DiskType,
    /// VM kind only: attach a persistent disk instead of a built-in boot disk.
    pub use_persistent_disk: bool,
    pub number_of_workers: u32,
    pub number_of_preemptible_workers: u32,
    pub worker_machine_type: Option<String>,
    pub worker_disk_size_gb: Option<u32>,
    pub gateway_components_enabled: bool,
    pub gpu: Option<GpuConfig>,
    pub autopause_threshold_minutes: u32,
    pub compute_region: String,
    pub compute_zone: String,
    pub tool_docker_image: String,
    pub user_script_uri: Option<String>,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            cloud_service_kind: CloudServiceKind::Vm,
            machine_type: "n1-standard-4".to_string(),
            disk_size_gb: 100,
            disk_type: DiskType::Standard,
            use_persistent_disk: true,
            number_of_workers: 0,
            number_of_preemptible_workers: 0,
            worker_machine_type: None,
            worker_disk_size_gb: None,
            gateway_components_enabled: false,
            gpu: None,
            autopause_threshold_minutes: 30,
            compute_region: "us-central1".to_string(),
            compute_zone: "us-central1-a".to_string(),
            tool_docker_image: "us.gcr.io/broad-dsp-gcr-public/terra-jupyter-python:1.1.5"
                .to_string(),
            user_script_uri: None,
        }
    }
}

impl ComputeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read compute config {}", path.display()))?;
        let compute = toml::from_str(&content)
            .with_context(|| format!("Failed to parse compute config {}", path.display()))?;
        Ok(compute)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write compute config {}", path.display()))?;
        Ok(())
    }

    /// Static pre-flight checks. Every violation here blocks the apply before
    /// any remote call is made.
    pub fn validate(&self) -> EnvResult<()> {
        if !pricing::is_supported_machine_type(&self.machine_type) {
            return Err(EnvError::UnsupportedMachineType(self.machine_type.clone()));
        }
        validate_image_reference(&self.tool_docker_image)?;
        if let Some(uri) = &self.user_script_uri {
            url::Url::parse(uri).map_err(|e| {
                EnvError::InvalidUserScript(format!("{}: {}", uri, e))
            })?;
        }
        if self.disk_size_gb < MIN_DISK_SIZE_GB {
            return Err(EnvError::ConfigError(format!(
                "disk size {} GB is below the {} GB minimum",
                self.disk_size_gb, MIN_DISK_SIZE_GB
            )));
        }
        if let Some(gpu) = &self.gpu {
            if self.cloud_service_kind.is_cluster() {
                return Err(EnvError::ConfigError(
                    "GPUs are only supported on single-VM runtimes".to_string(),
                ));
            }
            if gpu.num_gpus == 0 {
                return Err(EnvError::ConfigError(
                    "a GPU configuration must request at least one GPU".to_string(),
                ));
            }
            if !pricing::is_supported_gpu_type(&gpu.gpu_type) {
                return Err(EnvError::ConfigError(format!(
                    "unknown GPU type: {}",
                    gpu.gpu_type
                )));
            }
        }
        match self.cloud_service_kind {
            CloudServiceKind::Vm => Ok(()),
            CloudServiceKind::SingleNodeCluster => {
                if self.use_persistent_disk {
                    return Err(EnvError::ConfigError(
                        "managed clusters do not support persistent disks".to_string(),
                    ));
                }
                if self.number_of_workers != 0 {
                    return Err(EnvError::ConfigError(
                        "a single-node cluster cannot have workers".to_string(),
                    ));
                }
                Ok(())
            }
            CloudServiceKind::MultiNodeCluster => {
                if self.use_persistent_disk {
                    return Err(EnvError::ConfigError(
                        "managed clusters do not support persistent disks".to_string(),
                    ));
                }
                if self.number_of_workers < 2 {
                    return Err(EnvError::ConfigError(
                        "a multi-node cluster requires at least 2 workers".to_string(),
                    ));
                }
                if let Some(worker_type) = &self.worker_machine_type {
                    if !pricing::is_supported_machine_type(worker_type) {
                        return Err(EnvError::UnsupportedMachineType(worker_type.clone()));
                    }
                }
                Ok(())
            }
        }
    }

    /// Constructor for the VM runtime shape. The disk variant is decided by
    /// the caller, which knows whether a persistent disk survives or a fresh
    /// one is being provisioned.
    pub fn to_vm_config(&self, disk: VmDisk, zone: String) -> RuntimeConfig {
        RuntimeConfig::Vm {
            machine_type: self.machine_type.clone(),
            disk,
            autopause_threshold_minutes: self.autopause_threshold_minutes,
            gpu: self.gpu.clone(),
            zone,
        }
    }

    /// Constructor for the managed-cluster runtime shape. Worker fields are
    /// only populated for the multi-node kind.
    pub fn to_cluster_config(&self, region: String) -> RuntimeConfig {
        let multi_node = self.cloud_service_kind == CloudServiceKind::MultiNodeCluster;
        RuntimeConfig::Cluster {
            master_machine_type: self.machine_type.clone(),
            master_disk_size_gb: self.disk_size_gb,
            number_of_workers: if multi_node { self.number_of_workers } else { 0 },
            number_of_preemptible_workers: if multi_node {
                self.number_of_preemptible_workers
            } else {
                0
            },
            worker_machine_type: if multi_node {
                self.worker_machine_type.clone()
            } else {
                None
            },
            worker_disk_size_gb: if multi_node { self.worker_disk_size_gb } else { None },
            region,
        }
    }
}

fn validate_image_reference(image: &str) -> EnvResult<()> {
    if image.is_empty() {
        return Err(EnvError::InvalidImageReference(
            "image reference is empty".to_string(),
        ));
    }
    if image.chars().any(char::is_whitespace) {
        return Err(EnvError::InvalidImageReference(format!(
            "image reference contains whitespace: {}",
            image
        )));
    }
    // Fully-qualified references must at least parse as a URL
    if image.contains("://") {
        url::Url::parse(image)
            .map_err(|e| EnvError::InvalidImageReference(format!("{}: {}", image, e)))?;
    }
    Ok(())
}
