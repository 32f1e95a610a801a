use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// mixd — headless companion daemon for a hardware volume mixer
#[derive(Parser)]
#[command(name = "mixd", version, about)]
struct Cli {
    /// Path to the config file (TOML).
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable JSON log output (for journald).
    #[arg(long)]
    json: bool,

    /// Validate config and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Init tracing.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mixd=info"));

    if cli.json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }

    info!("mixd v{}", env!("CARGO_PKG_VERSION"));

    // Load config.
    let config_path = cli
        .config
        .canonicalize()
        .unwrap_or_else(|_| cli.config.clone());
    let config = mixd::config::load(&config_path)?;

    if cli.check {
        println!(
            "config OK: {} sliders, {} switches, {} buttons mapped",
            config.slider_mapping.len(),
            config.switch_mapping.len(),
            config.button_actions.buttons.len(),
        );
        return Ok(());
    }

    info!(
        sliders = config.slider_mapping.len(),
        switches = config.switch_mapping.len(),
        buttons = config.button_actions.buttons.len(),
        "loaded config"
    );

    // Run the daemon with the host's default platform collaborators.
    mixd::daemon::run(config, config_path, mixd::daemon::Platform::default()).await?;

    Ok(())
}
