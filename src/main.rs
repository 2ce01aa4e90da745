use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use profview::{ClassLocation, ConverterConfig, NavigationMode, ServerOptions, ViewerServer};

#[derive(Parser)]
#[command(name = "profview")]
#[command(version)]
#[command(about = "Launch a profiler viewer for a given recording")]
struct Cli {
    /// The recording (.jfr) or pre-converted profile (.json.gz) to view
    file: PathBuf,

    /// Configuration passed directly to the converter, as a JSON object
    #[arg(short, long)]
    config: Option<String>,

    /// Port to run the server on, defaults to 4243 or a free port
    #[arg(short, long)]
    port: Option<u16>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "info" } else { "warn" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ConverterConfig::parse(cli.config.as_deref().unwrap_or(""))
        .context("invalid --config value")?;

    // In verbose mode wire up demo navigation callbacks so the source links
    // in the UI have something to talk to.
    let navigation = if cli.verbose {
        NavigationMode::from_callbacks(
            Some(Arc::new(|destination| {
                println!("Navigate to {}", destination);
            })),
            Some(Arc::new(|location: &ClassLocation| location.package.clone())),
        )
    } else {
        NavigationMode::Disabled
    };

    let options = ServerOptions::default()
        .with_port(cli.port)
        .with_config(Some(config))
        .with_navigation(navigation)
        .with_verbose(cli.verbose);
    let server = ViewerServer::get_or_start(options)?;
    let url = server
        .register_and_viewer_url(&cli.file, None)
        .with_context(|| format!("cannot register {}", cli.file.display()))?;

    println!("-------------------------------------------------");
    println!("Navigate to {} to launch the profiler view", url);
    println!("-------------------------------------------------");

    wait_for_shutdown(server)
}

/// Block until ctrl-c, then close the artifact cache so its on-disk
/// directory is removed before the process exits.
fn wait_for_shutdown(server: &ViewerServer) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(tokio::signal::ctrl_c())?;
    server.close_cache();
    Ok(())
}
