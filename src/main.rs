//! pairsync — coincidence-detection core for a two-site quantum optics
//! experiment.
//!
//! Buffers picosecond timestamp streams from a hardware time tagger,
//! exchanges them with the twin site over an encrypted TCP link, estimates
//! the inter-site clock offset by FFT cross-correlation, and counts
//! per-detector-pair coincidences live. Run `pairsync --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod inspect;
mod mock;
mod offset;
mod run;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    // Load config (except for `init` which doesn't need it)
    let config = match &cli.command {
        Commands::Init => None,
        _ => {
            if !cli.config.exists() {
                std::fs::write(&cli.config, b"")?;
                eprintln!(
                    "Created '{}' — edit it or run `pairsync init` for a template.",
                    cli.config.display()
                );
            }
            Some(config::SiteConfig::load(&cli.config)?)
        }
    };

    match cli.command {
        Commands::Init => {
            let example = config::SiteConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Run { mock, duration, record_channels, interval, log } => {
            run::run(
                config.as_ref().unwrap(),
                mock,
                duration,
                record_channels,
                interval,
                log,
            )?;
        }
        Commands::Offset { local, remote, live, tau, bins } => {
            offset::run(config.as_ref().unwrap(), &local, &remote, live, tau, bins)?;
        }
        Commands::Inspect { file } => {
            inspect::run(&file)?;
        }
    }

    Ok(())
}
