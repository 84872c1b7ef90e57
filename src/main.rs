use clap::Parser;
use tracing::warn;

use mountlet::backend::protocol::SandboxBackend;
use mountlet::cli::args::{Cli, Commands};
use mountlet::cli::commands;
use mountlet::config::loader::load_config;
use mountlet::error::Result;
use mountlet::sandbox::factory::build_backend;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.global_opts.verbose);

    // Load configuration (file + CLI overrides)
    let mut config = load_config(cli.global_opts.config.as_deref())?;
    if let Some(backend) = cli.global_opts.backend.clone() {
        config.sandbox.backend = backend;
    }
    let format = cli.global_opts.format;

    // Dispatch to subcommand handler
    let exit_code = match cli.command {
        Commands::Backends => {
            commands::backends(format)?;
            0
        }
        Commands::Init(args) => {
            commands::init(args).await?;
            0
        }
        Commands::Config(args) => {
            commands::config(args, config).await?;
            0
        }
        command => {
            let backend = build_backend(&config).await?;
            let outcome = commands::dispatch(command, &backend, format).await;
            if let Err(e) = backend.shutdown().await {
                warn!(error = %e, "Failed to shut down sandbox");
            }
            outcome?
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn init_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
