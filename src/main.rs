use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use jobforge::auth::AllowAllAuthenticator;
use jobforge::job::JobOptions;
use jobforge::workspace::TypeFilter;
use jobforge::{BatchService, Config};

/// Thin CLI demonstrating the batch execution core. The daemon embedding
/// this core for real traffic would instead sit an HTTP façade in front of
/// `BatchService`; this binary exists to exercise it directly.
#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Multi-tenant batch execution core for the assistant CLI")]
#[command(version)]
struct Cli {
    /// Path to the TOML config file (defaults to ~/.jobforge/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Username to act as (stands in for the authenticated caller)
    #[arg(short, long, global = true, default_value = "local")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the service and idle, running periodic retention cleanup.
    Serve,
    #[command(subcommand)]
    Repo(RepoCommands),
    #[command(subcommand)]
    Job(JobCommands),
}

#[derive(Subcommand)]
enum RepoCommands {
    /// Register a repository and kick off its background clone.
    Register {
        name: String,
        url: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        indexer_aware: bool,
    },
    Unregister {
        name: String,
    },
    List,
    Get {
        name: String,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    Create {
        repository: String,
        prompt: String,
        #[arg(long)]
        git_aware: bool,
        #[arg(long)]
        indexer_aware: bool,
        #[arg(long)]
        timeout_seconds: Option<u64>,
    },
    Start {
        job_id: Uuid,
    },
    Cancel {
        job_id: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },
    Delete {
        job_id: Uuid,
    },
    Status {
        job_id: Uuid,
    },
    List,
    Upload {
        job_id: Uuid,
        file: PathBuf,
        #[arg(long)]
        overwrite: bool,
    },
    Ls {
        job_id: Uuid,
        #[arg(default_value = "")]
        path: String,
    },
    Cat {
        job_id: Uuid,
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let config = match cli.config {
        Some(path) => Config::from_file(&path)?,
        None => Config::load_or_default(),
    };

    // This demo CLI runs as whatever local user invoked it; a real façade
    // would swap in a PAM-backed `UserAuthenticator` here.
    let service = BatchService::start(config, Arc::new(AllowAllAuthenticator)).await?;
    let user = cli.user.as_str();

    match cli.command {
        Commands::Serve => {
            tracing::info!("jobforge service started");
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                match service.cleanup_retention() {
                    Ok(removed) if removed > 0 => tracing::info!("retention cleanup removed {removed} jobs"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("retention cleanup failed: {e}"),
                }
                let swept = service.enforce_age_limits().await;
                if swept > 0 {
                    tracing::info!("administrative age timeout forced cleanup of {swept} jobs");
                }
            }
        }
        Commands::Repo(RepoCommands::Register {
            name,
            url,
            description,
            indexer_aware,
        }) => {
            let repo = service.register_repository(&name, &url, &description, indexer_aware).await?;
            println!("{}", serde_json::to_string_pretty(&repo)?);
        }
        Commands::Repo(RepoCommands::Unregister { name }) => {
            service.unregister_repository(&name).await?;
            println!("unregistered `{name}`");
        }
        Commands::Repo(RepoCommands::List) => {
            let repos = service.list_repositories()?;
            println!("{}", serde_json::to_string_pretty(&repos)?);
        }
        Commands::Repo(RepoCommands::Get { name }) => {
            let repo = service.get_repository(&name)?;
            println!("{}", serde_json::to_string_pretty(&repo)?);
        }
        Commands::Job(JobCommands::Create {
            repository,
            prompt,
            git_aware,
            indexer_aware,
            timeout_seconds,
        }) => {
            let options = JobOptions {
                timeout_seconds,
                git_aware,
                indexer_aware,
                environment_overrides: Default::default(),
            };
            let job = service.create_job(user, &repository, &prompt, options).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Job(JobCommands::Start { job_id }) => {
            service.start_job(user, job_id).await?;
            println!("started {job_id}");
        }
        Commands::Job(JobCommands::Cancel { job_id, reason }) => {
            service.cancel_job(user, job_id, reason).await?;
            println!("cancelled {job_id}");
        }
        Commands::Job(JobCommands::Delete { job_id }) => {
            service.delete_job(user, job_id).await?;
            println!("deleted {job_id}");
        }
        Commands::Job(JobCommands::Status { job_id }) => {
            let job = service.get_job_status(user, job_id)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Job(JobCommands::List) => {
            let jobs = service.list_user_jobs(user);
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        Commands::Job(JobCommands::Upload {
            job_id,
            file,
            overwrite,
        }) => {
            let filename = file
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("`{}` has no file name", file.display()))?
                .to_string_lossy()
                .to_string();
            let mut handle = std::fs::File::open(&file)?;
            service.upload_file(user, job_id, &filename, &mut handle, overwrite)?;
            println!("uploaded {filename} to {job_id}");
        }
        Commands::Job(JobCommands::Ls { job_id, path }) => {
            let entries = service.list_workspace(user, job_id, &path, None, 10, TypeFilter::All)?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Commands::Job(JobCommands::Cat { job_id, path }) => {
            let text = service.read_workspace_file_text(user, job_id, &path)?;
            print!("{text}");
        }
    }

    Ok(())
}
