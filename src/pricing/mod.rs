//! Static price catalogs and cost projection for pending environment
//! configurations. Projections are advisory, derived locally from the
//! catalogs below, and are a pure function of the pending config: no
//! remote calls, no caching.

use lazy_static::lazy_static;
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

use crate::api::RuntimeConfigPayload;
use crate::core::types::DiskType;
use crate::environments::{DiskDescriptor, EnvironmentConfig};

pub const HOURS_PER_MONTH: f64 = 730.0;

/// Preemptible workers bill at a flat fraction of the on-demand price.
pub const PREEMPTIBLE_PRICE_FACTOR: f64 = 0.2;

#[derive(Debug, Clone, Serialize)]
pub struct MachineTypeSpec {
    pub name: &'static str,
    pub cpus: u32,
    pub memory_gb: f64,
    pub price_per_hour: f64,
}

macro_rules! machine_types {
    ($(($name:literal, $cpus:literal, $mem:literal, $price:literal)),+ $(,)?) => {
        HashMap::from([
            $(($name, MachineTypeSpec {
                name: $name,
                cpus: $cpus,
                memory_gb: $mem,
                price_per_hour: $price,
            })),+
        ])
    };
}

lazy_static! {
    static ref MACHINE_TYPES: HashMap<&'static str, MachineTypeSpec> = machine_types![
        ("n1-standard-1", 1, 3.75, 0.0475),
        ("n1-standard-2", 2, 7.5, 0.095),
        ("n1-standard-4", 4, 15.0, 0.19),
        ("n1-standard-8", 8, 30.0, 0.38),
        ("n1-standard-16", 16, 60.0, 0.76),
        ("n1-highmem-2", 2, 13.0, 0.1184),
        ("n1-highmem-4", 4, 26.0, 0.2368),
        ("n1-highmem-8", 8, 52.0, 0.4736),
        ("n1-highmem-16", 16, 104.0, 0.9472),
        ("n1-highcpu-4", 4, 3.6, 0.1418),
        ("n1-highcpu-8", 8, 7.2, 0.2836),
        ("n1-highcpu-16", 16, 14.4, 0.5672),
        ("n2-standard-2", 2, 8.0, 0.0971),
        ("n2-standard-4", 4, 16.0, 0.1942),
        ("n2-standard-8", 8, 32.0, 0.3885),
    ];
    static ref GPU_PRICES_PER_HOUR: HashMap<&'static str, f64> = HashMap::from([
        ("nvidia-tesla-t4", 0.35),
        ("nvidia-tesla-k80", 0.45),
        ("nvidia-tesla-p4", 0.60),
        ("nvidia-tesla-p100", 1.46),
        ("nvidia-tesla-v100", 2.48),
    ]);
    static ref DISK_PRICES_PER_GB_MONTH: HashMap<DiskType, f64> = HashMap::from([
        (DiskType::Standard, 0.04),
        (DiskType::Balanced, 0.10),
        (DiskType::Ssd, 0.17),
    ]);
}

pub fn machine_type_spec(name: &str) -> Option<&'static MachineTypeSpec> {
    MACHINE_TYPES.get(name)
}

pub fn is_supported_machine_type(name: &str) -> bool {
    MACHINE_TYPES.contains_key(name)
}

pub fn is_supported_gpu_type(name: &str) -> bool {
    GPU_PRICES_PER_HOUR.contains_key(name)
}

/// The catalog sorted by price, for display.
pub fn machine_type_catalog() -> Vec<&'static MachineTypeSpec> {
    let mut specs: Vec<_> = MACHINE_TYPES.values().collect();
    specs.sort_by(|a, b| {
        a.price_per_hour
            .partial_cmp(&b.price_per_hour)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    specs
}

/// Projected cost of a pending environment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostProjection {
    /// Hourly cost while the runtime is up.
    pub running_cost_per_hour: f64,
    /// Hourly carrying cost while paused: disks only.
    pub paused_cost_per_hour: f64,
    /// Monthly cost of all disks, persistent and built-in.
    pub disk_cost_per_month: f64,
}

fn machine_price(name: &str) -> f64 {
    match machine_type_spec(name) {
        Some(spec) => spec.price_per_hour,
        None => {
            warn!(machine_type = name, "No price for machine type, projecting 0");
            0.0
        }
    }
}

fn gpu_price(gpu_type: &str) -> f64 {
    match GPU_PRICES_PER_HOUR.get(gpu_type) {
        Some(price) => *price,
        None => {
            warn!(gpu_type, "No price for GPU type, projecting 0");
            0.0
        }
    }
}

fn disk_price_per_gb_month(disk_type: DiskType) -> f64 {
    // Every disk type is in the table
    DISK_PRICES_PER_GB_MONTH[&disk_type]
}

/// Hourly and monthly cost of a pending runtime config plus the persistent
/// disk that will exist alongside it. Built-in disks (VM boot disks,
/// cluster master and worker disks) bill at the standard disk rate.
pub fn project_cost(
    runtime: Option<&RuntimeConfigPayload>,
    persistent_disk: Option<&DiskDescriptor>,
) -> CostProjection {
    let mut compute_cost_per_hour = 0.0;
    let mut disk_cost_per_month = 0.0;

    if let Some(disk) = persistent_disk {
        disk_cost_per_month += disk.size_gb as f64 * disk_price_per_gb_month(disk.disk_type);
    }

    match runtime {
        None => {}
        Some(RuntimeConfigPayload::Vm {
            machine_type,
            disk_size,
            gpu_config,
            ..
        }) => {
            compute_cost_per_hour += machine_price(machine_type);
            if let Some(gpu) = gpu_config {
                compute_cost_per_hour += gpu.num_of_gpus as f64 * gpu_price(&gpu.gpu_type);
            }
            if let Some(size) = disk_size {
                disk_cost_per_month +=
                    *size as f64 * disk_price_per_gb_month(DiskType::Standard);
            }
        }
        Some(RuntimeConfigPayload::Cluster {
            master_machine_type,
            master_disk_size,
            number_of_workers,
            number_of_preemptible_workers,
            worker_machine_type,
            worker_disk_size,
            ..
        }) => {
            compute_cost_per_hour += machine_price(master_machine_type);
            let worker_price = machine_price(
                worker_machine_type
                    .as_deref()
                    .unwrap_or(master_machine_type),
            );
            compute_cost_per_hour += *number_of_workers as f64 * worker_price;
            compute_cost_per_hour += *number_of_preemptible_workers as f64
                * worker_price
                * PREEMPTIBLE_PRICE_FACTOR;

            let standard = disk_price_per_gb_month(DiskType::Standard);
            disk_cost_per_month += *master_disk_size as f64 * standard;
            if let Some(worker_disk) = worker_disk_size {
                let worker_count = number_of_workers + number_of_preemptible_workers;
                disk_cost_per_month += worker_count as f64 * *worker_disk as f64 * standard;
            }
        }
    }

    let disk_cost_per_hour = disk_cost_per_month / HOURS_PER_MONTH;
    CostProjection {
        running_cost_per_hour: compute_cost_per_hour + disk_cost_per_hour,
        paused_cost_per_hour: disk_cost_per_hour,
        disk_cost_per_month,
    }
}

/// Cost of a desired environment as produced by the planner.
pub fn project_environment_cost(environment: &EnvironmentConfig) -> CostProjection {
    let runtime_payload = environment
        .runtime
        .as_ref()
        .map(|r| RuntimeConfigPayload::from_config(&r.config, environment.attached_disk()));
    project_cost(runtime_payload.as_ref(), environment.persistent_disk.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::GpuConfigPayload;
    use pretty_assertions::assert_eq;

    fn vm_payload(machine_type: &str, disk_size: Option<u32>) -> RuntimeConfigPayload {
        RuntimeConfigPayload::Vm {
            machine_type: machine_type.to_string(),
            disk_size,
            persistent_disk: None,
            autopause_threshold: 30,
            gpu_config: None,
            zone: "us-central1-a".to_string(),
        }
    }

    fn pd(size_gb: u32, disk_type: DiskType) -> DiskDescriptor {
        DiskDescriptor {
            name: "data-disk".to_string(),
            size_gb,
            disk_type,
            zone: "us-central1-a".to_string(),
        }
    }

    #[test]
    fn test_vm_with_persistent_disk_cost() {
        let disk = pd(100, DiskType::Standard);
        let cost = project_cost(Some(&vm_payload("n1-standard-4", None)), Some(&disk));
        assert_eq!(cost.disk_cost_per_month, 4.0);
        let disk_hourly = 4.0 / HOURS_PER_MONTH;
        assert!((cost.running_cost_per_hour - (0.19 + disk_hourly)).abs() < 1e-9);
        assert!((cost.paused_cost_per_hour - disk_hourly).abs() < 1e-9);
    }

    #[test]
    fn test_ssd_disk_is_pricier_than_standard() {
        let standard = project_cost(None, Some(&pd(100, DiskType::Standard)));
        let ssd = project_cost(None, Some(&pd(100, DiskType::Ssd)));
        assert!(ssd.disk_cost_per_month > standard.disk_cost_per_month);
    }

    #[test]
    fn test_gpu_adds_hourly_cost() {
        let without = vm_payload("n1-standard-4", Some(100));
        let with = RuntimeConfigPayload::Vm {
            machine_type: "n1-standard-4".to_string(),
            disk_size: Some(100),
            persistent_disk: None,
            autopause_threshold: 30,
            gpu_config: Some(GpuConfigPayload {
                gpu_type: "nvidia-tesla-t4".to_string(),
                num_of_gpus: 2,
            }),
            zone: "us-central1-a".to_string(),
        };
        let base = project_cost(Some(&without), None);
        let gpu = project_cost(Some(&with), None);
        assert!((gpu.running_cost_per_hour - base.running_cost_per_hour - 0.70).abs() < 1e-9);
        assert_eq!(gpu.paused_cost_per_hour, base.paused_cost_per_hour);
    }

    #[test]
    fn test_cluster_cost_counts_workers() {
        let payload = RuntimeConfigPayload::Cluster {
            master_machine_type: "n1-standard-4".to_string(),
            master_disk_size: 100,
            number_of_workers: 2,
            number_of_preemptible_workers: 2,
            worker_machine_type: Some("n1-standard-2".to_string()),
            worker_disk_size: Some(50),
            region: "us-central1".to_string(),
        };
        let cost = project_cost(Some(&payload), None);
        // master + 2 workers + 2 preemptible at the discounted rate
        let compute = 0.19 + 2.0 * 0.095 + 2.0 * 0.095 * PREEMPTIBLE_PRICE_FACTOR;
        // master disk + 4 worker disks, all standard
        let disks = (100.0 + 4.0 * 50.0) * 0.04;
        assert!((cost.disk_cost_per_month - disks).abs() < 1e-9);
        assert!((cost.running_cost_per_hour - (compute + disks / HOURS_PER_MONTH)).abs() < 1e-9);
    }

    // Projection is a pure function of its inputs
    #[test]
    fn test_projection_is_deterministic() {
        let payload = vm_payload("n1-highmem-8", Some(200));
        let disk = pd(500, DiskType::Balanced);
        let first = project_cost(Some(&payload), Some(&disk));
        let second = project_cost(Some(&payload), Some(&disk));
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_machine_type_projects_zero_compute() {
        let cost = project_cost(Some(&vm_payload("n1-imaginary-64", None)), None);
        assert_eq!(cost.running_cost_per_hour, 0.0);
    }

    #[test]
    fn test_catalog_is_sorted_by_price() {
        let catalog = machine_type_catalog();
        assert!(!catalog.is_empty());
        for pair in catalog.windows(2) {
            assert!(pair[0].price_per_hour <= pair[1].price_per_hour);
        }
    }
}
