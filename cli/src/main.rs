//! brood CLI binary

#![allow(unused_crate_dependencies)]

use anyhow::Context;
use clap::Parser;
use cli::args::{Cli, Commands};
use cli::runner;
use std::io::Write;
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    brood_core::utils::init_tracing(&cli.log_level)?;

    match &cli.command {
        Commands::Run(args) => match runner::run(args).await {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                error!("Command failed: {}", e);
                eprintln!("brood: [{}] {}", e.code(), e);
                std::process::exit(127);
            }
        },
        Commands::Env(args) => {
            let env = runner::merged_environment(args).context("building environment")?;
            let mut out = std::io::stdout().lock();
            for entry in env.iter() {
                out.write_all(&entry.to_bytes())?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
        }
        Commands::Schema => {
            println!("{}", schema::process_options_schema());
        }
    }
    Ok(())
}
