use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{theme::ColorfulTheme, Confirm};
use dotenv::dotenv;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cloud_env_manager::api::HttpProvisioningClient;
use cloud_env_manager::config::{ComputeConfig, Settings};
use cloud_env_manager::environments::{
    EnvironmentConfig, EnvironmentManager, PlannedChange, RuntimeConfig, ViewMode,
};
use cloud_env_manager::pricing;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (TOML); NIMBUS_* environment variables override it
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Project to operate on, overriding the settings file
    #[arg(long, global = true, env = "NIMBUS_PROJECT")]
    project: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the operations required to reach the configured environment
    Plan {
        /// Compute configuration file (TOML)
        config: PathBuf,
    },
    /// Apply the configured environment, creating, updating or replacing
    /// resources as needed
    Apply {
        /// Compute configuration file (TOML)
        config: PathBuf,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Show the current environment as known to the provisioning service
    Status,
    /// Delete the environment
    Delete {
        /// Keep the persistent disk for later reattachment
        #[arg(long)]
        keep_disk: bool,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Project the cost of a compute configuration without touching the
    /// provisioning service
    Cost {
        /// Compute configuration file (TOML)
        config: PathBuf,
    },
    /// List supported machine types and their prices
    MachineTypes,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let cli = Cli::parse();
    let settings = Settings::load(cli.settings.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    let project = cli.project.unwrap_or_else(|| settings.project.clone());

    match cli.command {
        Commands::Plan { config } => {
            let compute = ComputeConfig::load(&config)?;
            let mut manager = manager_for(&project, &settings);
            info!(project = %project, "Planning environment change");
            let change = manager.plan(&compute, ViewMode::Normal).await?;
            print_plan(&change);
        }
        Commands::Apply { config, yes } => {
            let compute = ComputeConfig::load(&config)?;
            let mut manager = manager_for(&project, &settings);
            let change = manager.plan(&compute, ViewMode::Normal).await?;
            apply_change(&mut manager, &change, yes).await?;
        }
        Commands::Status => {
            let mut manager = manager_for(&project, &settings);
            let snapshot = manager.refresh().await?;
            print_environment(&manager.existing_config());
            println!(
                "{}",
                style(format!("Fetched at {}", snapshot.fetched_at)).dim()
            );
        }
        Commands::Delete { keep_disk, yes } => {
            let mut manager = manager_for(&project, &settings);
            let mode = ViewMode::DeleteEnvironment {
                delete_disk: !keep_disk,
            };
            let change = manager.plan(&ComputeConfig::default(), mode).await?;
            if !change.has_changes() {
                println!("Nothing to delete.");
                return Ok(());
            }
            apply_change(&mut manager, &change, yes).await?;
        }
        Commands::Cost { config } => {
            let compute = ComputeConfig::load(&config)?;
            compute.validate()?;
            let desired = cloud_env_manager::environments::desired_environment(
                &project,
                &compute,
                ViewMode::Normal,
                &EnvironmentConfig::default(),
            );
            print_cost(&pricing::project_environment_cost(&desired));
        }
        Commands::MachineTypes => {
            println!("{}", style("Supported machine types:").bold());
            for spec in pricing::machine_type_catalog() {
                println!(
                    "  {:<16} {:>3} vCPUs  {:>6.1} GB  ${:.4}/hr",
                    spec.name, spec.cpus, spec.memory_gb, spec.price_per_hour
                );
            }
        }
    }

    Ok(())
}

fn manager_for(project: &str, settings: &Settings) -> EnvironmentManager {
    let client = Arc::new(HttpProvisioningClient::new(
        settings.service_url.clone(),
        &settings.request,
    ));
    EnvironmentManager::new(project, client)
}

async fn apply_change(
    manager: &mut EnvironmentManager,
    change: &PlannedChange,
    assume_yes: bool,
) -> Result<()> {
    print_plan(change);
    if !change.has_changes() {
        return Ok(());
    }

    if !assume_yes {
        let prompt = if change.warnings.iter().any(|w| w.is_data_loss()) {
            "This change deletes data. Proceed?"
        } else {
            "Proceed?"
        };
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted.");
            return Ok(());
        }
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner());
    spinner.set_message("Applying changes...");
    spinner.enable_steady_tick(Duration::from_millis(100));
    let outcome = manager.apply(change).await;
    spinner.finish_and_clear();

    let outcome = outcome?;
    for step in &outcome.steps {
        println!("{} {}", style("✓").green(), step);
    }
    info!(steps = outcome.steps.len(), "Apply complete");
    Ok(())
}

fn print_plan(change: &PlannedChange) {
    println!("{}", style("Current environment:").bold());
    print_environment(&change.existing);
    println!("{}", style("Requested environment:").bold());
    print_environment(&change.desired);

    if !change.has_changes() {
        println!("{}", style("No changes required.").green());
        return;
    }

    println!("{}", style("Planned operations:").bold());
    let plan = change.plan;
    if plan.delete_runtime {
        println!("  {} delete runtime", style("-").red());
    }
    if plan.delete_persistent_disk {
        println!("  {} delete persistent disk", style("-").red());
    }
    if plan.update_persistent_disk {
        println!("  {} resize persistent disk", style("~").yellow());
    }
    if plan.update_runtime {
        println!("  {} update runtime in place", style("~").yellow());
    }
    if plan.create_runtime {
        println!("  {} create runtime", style("+").green());
    }

    for warning in &change.warnings {
        let styled = if warning.is_data_loss() {
            style(format!("warning: {}", warning)).red()
        } else {
            style(format!("warning: {}", warning)).yellow()
        };
        println!("{}", styled);
    }

    print_cost(&change.cost);
}

fn print_cost(cost: &pricing::CostProjection) {
    println!(
        "Cost: ${:.2}/hr running, ${:.2}/hr paused, ${:.2}/month disk",
        cost.running_cost_per_hour, cost.paused_cost_per_hour, cost.disk_cost_per_month
    );
}

fn print_environment(environment: &EnvironmentConfig) {
    match &environment.runtime {
        None => println!("  runtime: none"),
        Some(runtime) => {
            match &runtime.config {
                RuntimeConfig::Vm {
                    machine_type,
                    zone,
                    gpu,
                    ..
                } => {
                    let gpu_note = gpu
                        .as_ref()
                        .map(|g| format!(", {}x {}", g.num_gpus, g.gpu_type))
                        .unwrap_or_default();
                    println!(
                        "  runtime: VM {} in {}{} ({})",
                        machine_type, zone, gpu_note, runtime.tool_docker_image
                    );
                }
                RuntimeConfig::Cluster {
                    master_machine_type,
                    number_of_workers,
                    number_of_preemptible_workers,
                    region,
                    ..
                } => {
                    println!(
                        "  runtime: cluster {} in {}, {} workers ({} preemptible) ({})",
                        master_machine_type,
                        region,
                        number_of_workers,
                        number_of_preemptible_workers,
                        runtime.tool_docker_image
                    );
                }
            }
        }
    }
    match &environment.persistent_disk {
        None => println!("  persistent disk: none"),
        Some(disk) => println!(
            "  persistent disk: {} ({} GB {}, {})",
            disk.name, disk.size_gb, disk.disk_type, disk.zone
        ),
    }
}
