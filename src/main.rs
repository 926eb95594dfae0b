use clap::Parser;

mod cli;
mod commands;

use canopy::error;
use cli::{Args, Commands};

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => {
            std::process::exit(code);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> error::Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("CANOPY_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve {
            job_id,
            base,
            mount,
            changelist,
        } => {
            commands::serve_job(&job_id, &base, mount.as_deref(), changelist.as_deref()).await
        }
        Commands::List => {
            commands::list_mounts()?;
            Ok(0)
        }
        Commands::Remove { job_id } => {
            commands::remove_job(&job_id)?;
            Ok(0)
        }
        Commands::Lock { job_id } => {
            commands::lock_job(&job_id)?;
            Ok(0)
        }
        Commands::Unlock { job_id } => {
            commands::unlock_job(&job_id)?;
            Ok(0)
        }
    }
}
