//! Decides which remote operations move an environment from its existing
//! shape to a desired one, and which of those transitions a user must be
//! warned about. Everything here is advisory: pure functions over the two
//! configs, no remote calls, no errors.

use serde::Serialize;
use std::fmt;

use crate::environments::{CloudService, EnvironmentConfig, RuntimeConfig, VmDisk};

/// Whether the existing runtime can be mutated in place into the desired
/// one. False means delete-and-recreate (or plain delete when nothing is
/// desired).
///
/// The provisioning service cannot change, on a live runtime: its backend
/// family, its tool image, its user script, a VM's disk attachment mode or
/// autopause threshold, or anything that would shrink a disk. Clusters
/// additionally pin their worker topology: the zero/non-zero worker split,
/// the worker machine type and the worker disk size are fixed at creation.
pub fn can_update_runtime(existing: &EnvironmentConfig, desired: &EnvironmentConfig) -> bool {
    let (Some(existing_rt), Some(desired_rt)) = (&existing.runtime, &desired.runtime) else {
        return false;
    };
    if existing_rt.cloud_service() != desired_rt.cloud_service() {
        return false;
    }
    if existing_rt.tool_docker_image != desired_rt.tool_docker_image {
        return false;
    }
    if existing_rt.user_script_uri != desired_rt.user_script_uri {
        return false;
    }

    match (&existing_rt.config, &desired_rt.config) {
        (
            RuntimeConfig::Vm {
                disk: existing_disk,
                autopause_threshold_minutes: existing_autopause,
                ..
            },
            RuntimeConfig::Vm {
                disk: desired_disk,
                autopause_threshold_minutes: desired_autopause,
                ..
            },
        ) => {
            if existing_autopause != desired_autopause {
                return false;
            }
            match (existing_disk, desired_disk) {
                (VmDisk::Persistent { .. }, VmDisk::Persistent { .. }) => {
                    can_update_persistent_disk(existing, desired)
                }
                (
                    VmDisk::Builtin {
                        size_gb: existing_size,
                    },
                    VmDisk::Builtin {
                        size_gb: desired_size,
                    },
                ) => desired_size >= existing_size,
                // Attachment mode differs
                _ => false,
            }
        }
        (
            RuntimeConfig::Cluster {
                master_disk_size_gb: existing_master_disk,
                number_of_workers: existing_workers,
                worker_machine_type: existing_worker_type,
                worker_disk_size_gb: existing_worker_disk,
                ..
            },
            RuntimeConfig::Cluster {
                master_disk_size_gb: desired_master_disk,
                number_of_workers: desired_workers,
                worker_machine_type: desired_worker_type,
                worker_disk_size_gb: desired_worker_disk,
                ..
            },
        ) => {
            if desired_master_disk < existing_master_disk {
                return false;
            }
            if (*existing_workers == 0) != (*desired_workers == 0) {
                return false;
            }
            if existing_worker_type != desired_worker_type {
                return false;
            }
            if existing_worker_disk != desired_worker_disk {
                return false;
            }
            true
        }
        // Unreachable while the cloud-service check above holds
        _ => false,
    }
}

/// Whether the existing persistent disk can be mutated in place into the
/// desired one. Disks grow in place; they never shrink.
pub fn can_update_persistent_disk(
    existing: &EnvironmentConfig,
    desired: &EnvironmentConfig,
) -> bool {
    match (&existing.persistent_disk, &desired.persistent_disk) {
        (Some(existing_disk), Some(desired_disk)) => {
            desired_disk.size_gb >= existing_disk.size_gb
        }
        _ => false,
    }
}

/// The operation flags derived from one existing/desired pair.
///
/// Execution order contract for the caller: delete runtime (combined with
/// the attached disk when that disk will not survive), delete the orphaned
/// disk, resize the disk, then update or create the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActionPlan {
    pub delete_runtime: bool,
    pub delete_persistent_disk: bool,
    pub update_runtime: bool,
    pub create_runtime: bool,
    pub update_persistent_disk: bool,
}

impl ActionPlan {
    pub fn is_noop(&self) -> bool {
        !(self.delete_runtime
            || self.delete_persistent_disk
            || self.update_runtime
            || self.create_runtime
            || self.update_persistent_disk)
    }
}

pub fn compute_action_plan(existing: &EnvironmentConfig, desired: &EnvironmentConfig) -> ActionPlan {
    let runtime_updatable = can_update_runtime(existing, desired);
    let disk_updatable = can_update_persistent_disk(existing, desired);
    ActionPlan {
        delete_runtime: existing.runtime.is_some() && !runtime_updatable,
        delete_persistent_disk: existing.persistent_disk.is_some() && !disk_updatable,
        update_runtime: runtime_updatable && desired.runtime != existing.runtime,
        create_runtime: !runtime_updatable && desired.runtime.is_some(),
        update_persistent_disk: disk_updatable
            && desired.persistent_disk != existing.persistent_disk,
    }
}

/// User-facing consequences of a transition, most severe first. Several can
/// apply at once; callers display them in this order and data loss always
/// outranks downtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum WarningKind {
    DeletesPersistentDisk,
    DeletesBuiltinDisk,
    DetachesPersistentDisk,
    RequiresDowntime,
}

impl WarningKind {
    pub fn is_data_loss(&self) -> bool {
        matches!(
            self,
            WarningKind::DeletesPersistentDisk | WarningKind::DeletesBuiltinDisk
        )
    }
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WarningKind::DeletesPersistentDisk => {
                "The persistent disk and all data on it will be deleted"
            }
            WarningKind::DeletesBuiltinDisk => {
                "The runtime's built-in disk and all data on it will be deleted"
            }
            WarningKind::DetachesPersistentDisk => {
                "The persistent disk will be detached; managed clusters cannot use it"
            }
            WarningKind::RequiresDowntime => "The environment will be unavailable while it restarts",
        };
        f.write_str(s)
    }
}

/// The existing runtime carries a non-persistent disk (a VM boot disk or a
/// cluster's master disk) that dies with it, and the runtime cannot survive
/// the transition.
pub fn will_delete_builtin_disk(existing: &EnvironmentConfig, desired: &EnvironmentConfig) -> bool {
    let Some(runtime) = &existing.runtime else {
        return false;
    };
    let has_builtin_disk = match &runtime.config {
        RuntimeConfig::Vm {
            disk: VmDisk::Builtin { .. },
            ..
        } => true,
        RuntimeConfig::Vm { .. } => false,
        RuntimeConfig::Cluster { .. } => true,
    };
    has_builtin_disk && !can_update_runtime(existing, desired)
}

/// The existing persistent disk cannot survive the transition.
pub fn will_delete_persistent_disk(
    existing: &EnvironmentConfig,
    desired: &EnvironmentConfig,
) -> bool {
    existing.persistent_disk.is_some() && !can_update_persistent_disk(existing, desired)
}

/// The desired runtime is a managed cluster while the existing runtime has
/// a persistent disk attached; the disk survives but cannot follow.
pub fn will_detach_persistent_disk(
    existing: &EnvironmentConfig,
    desired: &EnvironmentConfig,
) -> bool {
    let desired_is_cluster = desired
        .runtime
        .as_ref()
        .map(|r| r.cloud_service() == CloudService::Cluster)
        .unwrap_or(false);
    desired_is_cluster && existing.runtime_has_attached_disk()
}

/// Any transition touching an existing runtime interrupts it: a recreate
/// obviously, but an in-place machine-type change also forces a stop/start
/// cycle.
pub fn will_require_downtime(existing: &EnvironmentConfig, desired: &EnvironmentConfig) -> bool {
    let Some(existing_rt) = &existing.runtime else {
        return false;
    };
    if !can_update_runtime(existing, desired) {
        return true;
    }
    match &desired.runtime {
        Some(desired_rt) => desired_rt.config.machine_type() != existing_rt.config.machine_type(),
        None => true,
    }
}

/// All applicable warnings, most severe first.
pub fn classify_warnings(existing: &EnvironmentConfig, desired: &EnvironmentConfig) -> Vec<WarningKind> {
    let mut warnings = Vec::new();
    if will_delete_persistent_disk(existing, desired) {
        warnings.push(WarningKind::DeletesPersistentDisk);
    }
    if will_delete_builtin_disk(existing, desired) {
        warnings.push(WarningKind::DeletesBuiltinDisk);
    }
    if will_detach_persistent_disk(existing, desired) {
        warnings.push(WarningKind::DetachesPersistentDisk);
    }
    if will_require_downtime(existing, desired) {
        warnings.push(WarningKind::RequiresDowntime);
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DiskType;
    use crate::environments::{DiskDescriptor, RuntimeDescriptor};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    const IMAGE: &str = "ghcr.io/example/notebook:1.0";

    fn vm_runtime(machine_type: &str, disk: VmDisk) -> RuntimeDescriptor {
        RuntimeDescriptor {
            tool_docker_image: IMAGE.to_string(),
            user_script_uri: None,
            component_gateway_enabled: false,
            config: RuntimeConfig::Vm {
                machine_type: machine_type.to_string(),
                disk,
                autopause_threshold_minutes: 30,
                gpu: None,
                zone: "us-central1-a".to_string(),
            },
        }
    }

    fn cluster_runtime(workers: u32) -> RuntimeDescriptor {
        RuntimeDescriptor {
            tool_docker_image: IMAGE.to_string(),
            user_script_uri: None,
            component_gateway_enabled: false,
            config: RuntimeConfig::Cluster {
                master_machine_type: "n1-standard-4".to_string(),
                master_disk_size_gb: 100,
                number_of_workers: workers,
                number_of_preemptible_workers: 0,
                worker_machine_type: if workers > 0 {
                    Some("n1-standard-4".to_string())
                } else {
                    None
                },
                worker_disk_size_gb: if workers > 0 { Some(100) } else { None },
                region: "us-central1".to_string(),
            },
        }
    }

    fn disk(name: &str, size_gb: u32) -> DiskDescriptor {
        DiskDescriptor {
            name: name.to_string(),
            size_gb,
            disk_type: DiskType::Standard,
            zone: "us-central1-a".to_string(),
        }
    }

    fn env(runtime: Option<RuntimeDescriptor>, pd: Option<DiskDescriptor>) -> EnvironmentConfig {
        let has_gpu = runtime.as_ref().map(|r| r.gpu().is_some()).unwrap_or(false);
        EnvironmentConfig {
            runtime,
            persistent_disk: pd,
            has_gpu,
        }
    }

    fn vm_with_pd(size_gb: u32) -> EnvironmentConfig {
        let d = disk("data-disk", size_gb);
        env(
            Some(vm_runtime(
                "n1-standard-4",
                VmDisk::Persistent {
                    disk_name: d.name.clone(),
                },
            )),
            Some(d),
        )
    }

    #[test]
    fn test_no_existing_runtime_is_never_updatable() {
        let existing = env(None, None);
        let desired = env(
            Some(vm_runtime("n1-standard-4", VmDisk::Builtin { size_gb: 100 })),
            None,
        );
        assert!(!can_update_runtime(&existing, &desired));
    }

    #[test]
    fn test_cloud_service_change_is_never_updatable() {
        let existing = env(
            Some(vm_runtime("n1-standard-4", VmDisk::Builtin { size_gb: 100 })),
            None,
        );
        let desired = env(Some(cluster_runtime(0)), None);
        assert!(!can_update_runtime(&existing, &desired));
    }

    #[test]
    fn test_tool_image_change_forces_recreate() {
        let existing = env(
            Some(vm_runtime("n1-standard-4", VmDisk::Builtin { size_gb: 100 })),
            None,
        );
        let mut desired = existing.clone();
        desired.runtime.as_mut().unwrap().tool_docker_image =
            "ghcr.io/example/notebook:2.0".to_string();
        assert!(!can_update_runtime(&existing, &desired));
        let plan = compute_action_plan(&existing, &desired);
        assert!(plan.delete_runtime);
        assert!(plan.create_runtime);
    }

    #[test]
    fn test_autopause_change_forces_recreate() {
        let existing = env(
            Some(vm_runtime("n1-standard-4", VmDisk::Builtin { size_gb: 100 })),
            None,
        );
        let mut desired = existing.clone();
        match &mut desired.runtime.as_mut().unwrap().config {
            RuntimeConfig::Vm {
                autopause_threshold_minutes,
                ..
            } => *autopause_threshold_minutes = 60,
            _ => unreachable!(),
        }
        assert!(!can_update_runtime(&existing, &desired));
    }

    #[test]
    fn test_boot_disk_shrink_forces_recreate() {
        let existing = env(
            Some(vm_runtime("n1-standard-4", VmDisk::Builtin { size_gb: 100 })),
            None,
        );
        let desired = env(
            Some(vm_runtime("n1-standard-4", VmDisk::Builtin { size_gb: 50 })),
            None,
        );
        assert!(!can_update_runtime(&existing, &desired));
        assert!(will_delete_builtin_disk(&existing, &desired));
    }

    #[test]
    fn test_boot_disk_growth_is_updatable() {
        let existing = env(
            Some(vm_runtime("n1-standard-4", VmDisk::Builtin { size_gb: 100 })),
            None,
        );
        let desired = env(
            Some(vm_runtime("n1-standard-4", VmDisk::Builtin { size_gb: 200 })),
            None,
        );
        assert!(can_update_runtime(&existing, &desired));
        let plan = compute_action_plan(&existing, &desired);
        assert!(plan.update_runtime);
        assert!(!plan.delete_runtime);
    }

    #[test]
    fn test_attachment_mode_change_forces_recreate() {
        let existing = vm_with_pd(100);
        let mut desired = existing.clone();
        desired.runtime = Some(vm_runtime(
            "n1-standard-4",
            VmDisk::Builtin { size_gb: 100 },
        ));
        assert!(!can_update_runtime(&existing, &desired));
    }

    #[test]
    fn test_persistent_disk_shrink() {
        let existing = vm_with_pd(100);
        let mut desired = existing.clone();
        desired.persistent_disk.as_mut().unwrap().size_gb = 50;
        assert!(!can_update_persistent_disk(&existing, &desired));
        assert!(will_delete_persistent_disk(&existing, &desired));
    }

    #[test]
    fn test_persistent_disk_growth_updates_in_place() {
        let existing = vm_with_pd(50);
        let mut desired = existing.clone();
        desired.persistent_disk.as_mut().unwrap().size_gb = 100;
        assert!(can_update_persistent_disk(&existing, &desired));
        let plan = compute_action_plan(&existing, &desired);
        assert!(plan.update_persistent_disk);
        assert!(!plan.create_runtime);
        assert!(!plan.delete_runtime);
    }

    #[test_case(0, 2; "zero to nonzero")]
    #[test_case(2, 0; "nonzero to zero")]
    fn test_worker_count_crossing_zero_forces_recreate(from: u32, to: u32) {
        let existing = env(Some(cluster_runtime(from)), None);
        let desired = env(Some(cluster_runtime(to)), None);
        assert!(!can_update_runtime(&existing, &desired));
    }

    #[test]
    fn test_worker_count_change_within_nonzero_is_updatable() {
        let existing = env(Some(cluster_runtime(2)), None);
        let desired = env(Some(cluster_runtime(4)), None);
        assert!(can_update_runtime(&existing, &desired));
    }

    #[test]
    fn test_worker_machine_type_change_forces_recreate() {
        let existing = env(Some(cluster_runtime(2)), None);
        let mut desired = env(Some(cluster_runtime(2)), None);
        match &mut desired.runtime.as_mut().unwrap().config {
            RuntimeConfig::Cluster {
                worker_machine_type,
                ..
            } => *worker_machine_type = Some("n1-standard-8".to_string()),
            _ => unreachable!(),
        }
        assert!(!can_update_runtime(&existing, &desired));
    }

    #[test]
    fn test_master_disk_shrink_forces_recreate() {
        let existing = env(Some(cluster_runtime(2)), None);
        let mut desired = env(Some(cluster_runtime(2)), None);
        match &mut desired.runtime.as_mut().unwrap().config {
            RuntimeConfig::Cluster {
                master_disk_size_gb,
                ..
            } => *master_disk_size_gb = 50,
            _ => unreachable!(),
        }
        assert!(!can_update_runtime(&existing, &desired));
        assert!(will_delete_builtin_disk(&existing, &desired));
    }

    #[test]
    fn test_identical_configs_plan_nothing() {
        let config = vm_with_pd(100);
        let plan = compute_action_plan(&config, &config.clone());
        assert!(plan.is_noop());
        assert!(classify_warnings(&config, &config.clone()).is_empty());
    }

    #[test]
    fn test_switch_to_cluster_detaches_disk() {
        let existing = vm_with_pd(100);
        let desired = env(Some(cluster_runtime(0)), existing.persistent_disk.clone());
        assert!(will_detach_persistent_disk(&existing, &desired));
        let plan = compute_action_plan(&existing, &desired);
        assert!(!plan.update_persistent_disk);
        assert!(!plan.delete_persistent_disk);
        assert!(plan.delete_runtime);
        assert!(plan.create_runtime);
    }

    #[test]
    fn test_create_from_nothing() {
        let existing = env(None, None);
        let desired = vm_with_pd(50);
        let plan = compute_action_plan(&existing, &desired);
        assert!(plan.create_runtime);
        assert!(!plan.delete_runtime);
        assert!(!plan.update_runtime);
        assert!(!plan.update_persistent_disk);
        assert!(classify_warnings(&existing, &desired).is_empty());
    }

    #[test]
    fn test_delete_environment_keeping_disk() {
        let existing = vm_with_pd(100);
        let desired = env(None, existing.persistent_disk.clone());
        let plan = compute_action_plan(&existing, &desired);
        assert!(plan.delete_runtime);
        assert!(!plan.delete_persistent_disk);
        assert!(!plan.create_runtime);
    }

    #[test]
    fn test_delete_environment_and_disk() {
        let existing = vm_with_pd(100);
        let desired = env(None, None);
        let plan = compute_action_plan(&existing, &desired);
        assert!(plan.delete_runtime);
        assert!(plan.delete_persistent_disk);
        let warnings = classify_warnings(&existing, &desired);
        assert_eq!(
            warnings,
            vec![
                WarningKind::DeletesPersistentDisk,
                WarningKind::RequiresDowntime
            ]
        );
    }

    #[test]
    fn test_machine_type_change_is_update_with_downtime() {
        let existing = vm_with_pd(100);
        let mut desired = existing.clone();
        match &mut desired.runtime.as_mut().unwrap().config {
            RuntimeConfig::Vm { machine_type, .. } => {
                *machine_type = "n1-standard-8".to_string()
            }
            _ => unreachable!(),
        }
        assert!(can_update_runtime(&existing, &desired));
        let plan = compute_action_plan(&existing, &desired);
        assert!(plan.update_runtime);
        assert!(will_require_downtime(&existing, &desired));
        let warnings = classify_warnings(&existing, &desired);
        assert_eq!(warnings, vec![WarningKind::RequiresDowntime]);
    }

    #[test]
    fn test_warnings_order_data_loss_first() {
        // Recreating a boot-disk VM as a cluster while deleting a detached disk
        let existing = env(
            Some(vm_runtime("n1-standard-4", VmDisk::Builtin { size_gb: 100 })),
            Some(disk("stray-disk", 20)),
        );
        let desired = env(Some(cluster_runtime(0)), None);
        let warnings = classify_warnings(&existing, &desired);
        assert_eq!(
            warnings,
            vec![
                WarningKind::DeletesPersistentDisk,
                WarningKind::DeletesBuiltinDisk,
                WarningKind::RequiresDowntime
            ]
        );
        assert!(warnings[0].is_data_loss());
        let mut sorted = warnings.clone();
        sorted.sort();
        assert_eq!(sorted, warnings);
    }
}
