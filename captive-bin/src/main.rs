use anyhow::Result;
use captive_bin::config::{self, Args};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let policy = match config::load_policy(&args) {
        Ok(policy) => Arc::new(policy),
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            std::process::exit(1);
        }
    };

    if args.check {
        println!("{}: OK", args.config_file.display());
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(policy.loglevel.as_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Config loaded: {:?}", policy);

    captive_bin::run(policy).await
}
