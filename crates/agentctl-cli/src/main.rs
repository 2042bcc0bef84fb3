mod config;
mod control;
mod run_cmd;
mod telemetry;

use clap::{Parser, Subcommand};

use agentctl_db::pool;

use config::ResolvedConfig;
use run_cmd::{RunError, RunOptions};

#[derive(Parser)]
#[command(name = "agentctl", about = "Local-first orchestrator for autonomous coding agents")]
struct Cli {
    /// Database URL (overrides AGENTCTL_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an agentctl config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/agentctl")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the agentctl database (requires config file or env vars)
    DbInit,
    /// Run the orchestrator process
    Run {
        /// Transport port exposed to UI clients
        #[arg(long, default_value_t = 9400)]
        port: u16,
        /// Control API port
        #[arg(long, default_value_t = 9401)]
        control_port: u16,
        /// Scheduling mode
        #[arg(long, default_value = "standalone")]
        mode: String,
    },
}

/// Execute `agentctl init`: write the config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        orchestrator: config::OrchestratorSection::default(),
        profiles: Default::default(),
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `agentctl db-init`, add [profiles.*] sections, then `agentctl run`.");

    Ok(())
}

/// Execute `agentctl db-init`: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = ResolvedConfig::resolve(cli_db_url)?;

    println!("Initializing agentctl database...");

    pool::create_database(&resolved.db_config).await?;
    let db_pool = pool::connect(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;
    db_pool.close().await;

    println!("agentctl db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Run {
            port,
            control_port,
            mode,
        } => {
            let resolved = match ResolvedConfig::resolve(cli.database_url.as_deref()) {
                Ok(resolved) => resolved,
                Err(e) => {
                    eprintln!("{e:#}");
                    std::process::exit(1);
                }
            };
            let options = RunOptions {
                port,
                control_port,
                mode,
            };
            match run_cmd::run(resolved, options).await {
                Ok(()) => {}
                Err(RunError::HealthTimeout) => {
                    eprintln!("fatal: {}", RunError::HealthTimeout);
                    std::process::exit(2);
                }
                Err(RunError::Init(e)) => {
                    eprintln!("fatal: {e:#}");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
