//! In-memory provisioning double for tests: applies the same state
//! transitions the real service would, records every call in order, and can
//! fail a chosen operation once.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::error::EnvError;
use crate::core::types::{DiskType, GpuConfig, RuntimeStatus};
use crate::environments::{
    DiskDescriptor, RuntimeConfig, RuntimeDescriptor, RuntimeRecord, VmDisk,
};

use super::{
    CreateRuntimeRequest, PersistentDiskPayload, ProvisioningClient, RuntimeConfigPayload,
    UpdateRuntimeRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    ListRuntimes,
    ListDisks,
    CreateRuntime { name: String },
    UpdateRuntime { name: String },
    DeleteRuntime { name: String, also_delete_disk: bool },
    UpdateDisk { name: String, size_gb: u32 },
    DeleteDisk { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    CreateRuntime,
    UpdateRuntime,
    DeleteRuntime,
    UpdateDisk,
    DeleteDisk,
}

#[derive(Debug, Default)]
struct MockState {
    runtime: Option<RuntimeRecord>,
    disk: Option<DiskDescriptor>,
    calls: Vec<RecordedCall>,
    fail_on: Option<FailPoint>,
}

#[derive(Debug, Default)]
pub struct MockProvisioningClient {
    state: Mutex<MockState>,
}

impl MockProvisioningClient {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_environment(runtime: Option<RuntimeRecord>, disk: Option<DiskDescriptor>) -> Self {
        Self {
            state: Mutex::new(MockState {
                runtime,
                disk,
                ..MockState::default()
            }),
        }
    }

    /// Make the next matching operation fail once.
    pub async fn fail_next(&self, point: FailPoint) {
        self.state.lock().await.fail_on = Some(point);
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn runtime(&self) -> Option<RuntimeRecord> {
        self.state.lock().await.runtime.clone()
    }

    pub async fn disk(&self) -> Option<DiskDescriptor> {
        self.state.lock().await.disk.clone()
    }
}

fn check_failure(state: &mut MockState, point: FailPoint) -> Result<()> {
    if state.fail_on == Some(point) {
        state.fail_on = None;
        return Err(anyhow!(EnvError::ProvisioningError(format!(
            "injected failure at {:?}",
            point
        ))));
    }
    Ok(())
}

fn descriptor_from_payload(
    payload: &RuntimeConfigPayload,
    tool_docker_image: String,
    user_script_uri: Option<String>,
    component_gateway_enabled: bool,
) -> RuntimeDescriptor {
    let config = match payload {
        RuntimeConfigPayload::Vm {
            machine_type,
            disk_size,
            persistent_disk,
            autopause_threshold,
            gpu_config,
            zone,
        } => {
            let disk = match (persistent_disk, disk_size) {
                (Some(pd), _) => VmDisk::Persistent {
                    disk_name: pd.name.clone(),
                },
                (None, Some(size_gb)) => VmDisk::Builtin { size_gb: *size_gb },
                (None, None) => VmDisk::Builtin { size_gb: 0 },
            };
            RuntimeConfig::Vm {
                machine_type: machine_type.clone(),
                disk,
                autopause_threshold_minutes: *autopause_threshold,
                gpu: gpu_config.as_ref().map(|g| GpuConfig {
                    gpu_type: g.gpu_type.clone(),
                    num_gpus: g.num_of_gpus,
                }),
                zone: zone.clone(),
            }
        }
        RuntimeConfigPayload::Cluster {
            master_machine_type,
            master_disk_size,
            number_of_workers,
            number_of_preemptible_workers,
            worker_machine_type,
            worker_disk_size,
            region,
        } => RuntimeConfig::Cluster {
            master_machine_type: master_machine_type.clone(),
            master_disk_size_gb: *master_disk_size,
            number_of_workers: *number_of_workers,
            number_of_preemptible_workers: *number_of_preemptible_workers,
            worker_machine_type: worker_machine_type.clone(),
            worker_disk_size_gb: *worker_disk_size,
            region: region.clone(),
        },
    };
    RuntimeDescriptor {
        tool_docker_image,
        user_script_uri,
        component_gateway_enabled,
        config,
    }
}

fn disk_from_payload(payload: &PersistentDiskPayload, existing: Option<&DiskDescriptor>) -> DiskDescriptor {
    match existing.filter(|d| d.name == payload.name) {
        // Attaching a disk that already exists leaves it untouched
        Some(disk) => disk.clone(),
        None => DiskDescriptor {
            name: payload.name.clone(),
            size_gb: payload.size.unwrap_or(0),
            disk_type: match payload.disk_type.as_deref() {
                Some("pd-ssd") => DiskType::Ssd,
                Some("pd-balanced") => DiskType::Balanced,
                _ => DiskType::Standard,
            },
            zone: payload.zone.clone().unwrap_or_else(|| "us-central1-a".to_string()),
        },
    }
}

#[async_trait]
impl ProvisioningClient for MockProvisioningClient {
    async fn list_runtimes(&self, _project: &str) -> Result<Vec<RuntimeRecord>> {
        let mut state = self.state.lock().await;
        state.calls.push(RecordedCall::ListRuntimes);
        Ok(state.runtime.clone().into_iter().collect())
    }

    async fn list_disks(&self, _project: &str) -> Result<Vec<DiskDescriptor>> {
        let mut state = self.state.lock().await;
        state.calls.push(RecordedCall::ListDisks);
        Ok(state.disk.clone().into_iter().collect())
    }

    async fn create_runtime(
        &self,
        _project: &str,
        name: &str,
        request: &CreateRuntimeRequest,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        check_failure(&mut state, FailPoint::CreateRuntime)?;
        state.calls.push(RecordedCall::CreateRuntime {
            name: name.to_string(),
        });
        if state.runtime.is_some() {
            return Err(anyhow!("runtime already exists"));
        }
        if let RuntimeConfigPayload::Vm {
            persistent_disk: Some(pd),
            ..
        } = &request.runtime_config
        {
            state.disk = Some(disk_from_payload(pd, state.disk.as_ref()));
        }
        state.runtime = Some(RuntimeRecord {
            name: name.to_string(),
            status: RuntimeStatus::Running,
            descriptor: descriptor_from_payload(
                &request.runtime_config,
                request.tool_docker_image.clone(),
                request.user_script_uri.clone(),
                request.enable_component_gateway,
            ),
        });
        Ok(())
    }

    async fn update_runtime(
        &self,
        _project: &str,
        name: &str,
        request: &UpdateRuntimeRequest,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        check_failure(&mut state, FailPoint::UpdateRuntime)?;
        state.calls.push(RecordedCall::UpdateRuntime {
            name: name.to_string(),
        });
        let Some(record) = state.runtime.as_mut().filter(|r| r.name == name) else {
            return Err(anyhow!("runtime {} not found", name));
        };
        record.descriptor = descriptor_from_payload(
            &request.runtime_config,
            record.descriptor.tool_docker_image.clone(),
            record.descriptor.user_script_uri.clone(),
            record.descriptor.component_gateway_enabled,
        );
        Ok(())
    }

    async fn delete_runtime(
        &self,
        _project: &str,
        name: &str,
        also_delete_disk: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        check_failure(&mut state, FailPoint::DeleteRuntime)?;
        state.calls.push(RecordedCall::DeleteRuntime {
            name: name.to_string(),
            also_delete_disk,
        });
        let Some(record) = state.runtime.take() else {
            return Err(anyhow!("runtime {} not found", name));
        };
        if also_delete_disk {
            if let Some(attached) = record.descriptor.attached_disk_name() {
                if state.disk.as_ref().map(|d| d.name == attached) == Some(true) {
                    state.disk = None;
                }
            }
        }
        Ok(())
    }

    async fn update_disk(&self, _project: &str, name: &str, new_size_gb: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        check_failure(&mut state, FailPoint::UpdateDisk)?;
        state.calls.push(RecordedCall::UpdateDisk {
            name: name.to_string(),
            size_gb: new_size_gb,
        });
        let Some(disk) = state.disk.as_mut().filter(|d| d.name == name) else {
            return Err(anyhow!("disk {} not found", name));
        };
        if new_size_gb < disk.size_gb {
            return Err(anyhow!(EnvError::ProvisioningError(
                "disks cannot shrink".to_string()
            )));
        }
        disk.size_gb = new_size_gb;
        Ok(())
    }

    async fn delete_disk(&self, _project: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        check_failure(&mut state, FailPoint::DeleteDisk)?;
        state.calls.push(RecordedCall::DeleteDisk {
            name: name.to_string(),
        });
        if state.disk.as_ref().map(|d| d.name == name) != Some(true) {
            return Err(anyhow!("disk {} not found", name));
        }
        state.disk = None;
        Ok(())
    }
}
