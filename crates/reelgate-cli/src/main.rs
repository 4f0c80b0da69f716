use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use reelgate_core::MediaType;
use reelgate_sync::{
    drive_run, export_run_snapshot, maybe_build_scheduler, write_preview_report, BackoffPolicy, CatalogEngine,
    DryRunRequest, EngineConfig, PreviewMode,
};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "reelgate")]
#[command(about = "Catalog policy evaluation engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending database migrations.
    Migrate,
    /// Run the admin API (and the scheduler when enabled).
    Serve,
    /// Run the cron scheduler until interrupted.
    Worker,
    #[command(subcommand)]
    Policy(PolicyCommand),
    #[command(subcommand)]
    Run(RunCommand),
    /// Evaluate a candidate policy file without writing anything.
    DryRun(DryRunArgs),
}

#[derive(Debug, Subcommand)]
enum PolicyCommand {
    /// Store a new policy version from a YAML or JSON file.
    Create {
        file: PathBuf,
        /// Activate immediately instead of waiting for a promoted run.
        #[arg(long)]
        activate: bool,
    },
    Activate { id: Uuid },
    List,
}

#[derive(Debug, Subcommand)]
enum RunCommand {
    Start {
        policy_id: Uuid,
        /// Process every batch and finalize before returning.
        #[arg(long)]
        drive: bool,
    },
    Drive { id: Uuid },
    Finalize { id: Uuid },
    Promote {
        id: Uuid,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    Cancel {
        id: Uuid,
        #[arg(long, default_value = "cancelled from cli")]
        reason: String,
    },
    Sweep,
    /// Write the run's evaluations to Parquet under the reports dir.
    Export {
        id: Uuid,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct DryRunArgs {
    file: PathBuf,
    #[arg(long, default_value = "sample")]
    mode: PreviewMode,
    #[arg(long)]
    sample_percent: Option<f64>,
    #[arg(long)]
    media_type: Option<MediaType>,
    #[arg(long)]
    country: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    seed: Option<String>,
    /// Also write preview.json and summary.md under the reports dir.
    #[arg(long)]
    write_report: bool,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{text}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            CatalogEngine::connect(config).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let port = config.web_port;
            let engine = CatalogEngine::connect(config).await?;
            let scheduler = maybe_build_scheduler(engine.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!("scheduler started");
            }
            reelgate_web::serve(engine, port).await?;
        }
        Commands::Worker => {
            let config = EngineConfig {
                scheduler_enabled: true,
                ..config
            };
            let engine = CatalogEngine::connect(config).await?;
            let Some(mut sched) = maybe_build_scheduler(engine).await? else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!("worker started; waiting for ctrl-c");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("worker stopped");
        }
        Commands::Policy(cmd) => {
            let engine = CatalogEngine::connect(config).await?;
            match cmd {
                PolicyCommand::Create { file, activate } => {
                    let policy_config = reelgate_eval::load_policy_config(&file)?;
                    let mut policy = engine.create_policy(policy_config).await?;
                    if activate {
                        policy = engine.activate_policy(policy.id).await?;
                    }
                    println!(
                        "policy created: id={} version={} active={}",
                        policy.id, policy.version, policy.is_active
                    );
                }
                PolicyCommand::Activate { id } => {
                    let policy = engine.activate_policy(id).await?;
                    println!("policy activated: id={} version={}", policy.id, policy.version);
                }
                PolicyCommand::List => print_json(&engine.list_policies().await?)?,
            }
        }
        Commands::Run(cmd) => {
            let reports_dir = config.reports_dir.clone();
            let engine = CatalogEngine::connect(config).await?;
            match cmd {
                RunCommand::Start { policy_id, drive } => {
                    let run = engine.start_run(policy_id).await?;
                    println!(
                        "run started: id={} policy_version={} total_ready={}",
                        run.id, run.target_policy_version, run.total_ready_snapshot
                    );
                    if drive {
                        print_json(&drive_run(&engine, run.id, BackoffPolicy::default()).await?)?;
                    }
                }
                RunCommand::Drive { id } => {
                    print_json(&drive_run(&engine, id, BackoffPolicy::default()).await?)?;
                }
                RunCommand::Finalize { id } => print_json(&engine.finalize_run(id).await?)?,
                RunCommand::Promote { id, by } => {
                    let run = engine.promote_run(id, &by).await?;
                    println!("run promoted: id={} policy_version={}", run.id, run.target_policy_version);
                }
                RunCommand::Cancel { id, reason } => {
                    let run = engine.cancel_run(id, &reason).await?;
                    println!("run cancelled: id={} status={}", run.id, run.status);
                }
                RunCommand::Sweep => print_json(&engine.sweep().await?)?,
                RunCommand::Export { id, out } => {
                    let dir = out.unwrap_or(reports_dir);
                    let manifest = export_run_snapshot(&engine, id, &dir).await?;
                    println!("run exported: manifest={}", manifest.display());
                }
            }
        }
        Commands::DryRun(args) => {
            let reports_dir = config.reports_dir.clone();
            let engine = CatalogEngine::connect(config).await?;
            let policy_config = reelgate_eval::load_policy_config(&args.file)?;
            let request = DryRunRequest {
                config: policy_config.clone(),
                mode: args.mode,
                sample_percent: args.sample_percent,
                media_type: args.media_type,
                country: args.country,
                limit: args.limit,
                seed: args.seed,
            };
            let report = engine.dry_run(request).await?;
            if args.write_report {
                let out = write_preview_report(&reports_dir, &policy_config, &report).await?;
                println!("dry run report: {}", out.display());
            }
            print_json(&report.summary)?;
        }
    }

    Ok(())
}
