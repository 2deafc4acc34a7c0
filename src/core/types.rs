use serde::{Deserialize, Serialize};
use std::fmt;

/// Persistent disk families offered by the provisioning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiskType {
    Standard,
    Balanced,
    Ssd,
}

impl DiskType {
    /// Wire name used by the provisioning service.
    pub fn api_name(&self) -> &'static str {
        match self {
            DiskType::Standard => "pd-standard",
            DiskType::Balanced => "pd-balanced",
            DiskType::Ssd => "pd-ssd",
        }
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

/// GPU attachment for a VM runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuConfig {
    pub gpu_type: String,
    pub num_gpus: u32,
}

/// Lifecycle state reported by the provisioning service for a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeStatus {
    Creating,
    Running,
    Updating,
    Stopping,
    Stopped,
    Deleting,
    Error,
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeStatus::Creating => "Creating",
            RuntimeStatus::Running => "Running",
            RuntimeStatus::Updating => "Updating",
            RuntimeStatus::Stopping => "Stopping",
            RuntimeStatus::Stopped => "Stopped",
            RuntimeStatus::Deleting => "Deleting",
            RuntimeStatus::Error => "Error",
        };
        f.write_str(s)
    }
}
