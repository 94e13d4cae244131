use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use stockpile_server::{Site, MANIFEST_FILE};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "stockpile-server", about = "Static repository server for Stockpile")]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 8321)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Directory holding repository.json and the package files.
    #[arg(long, default_value = "./stockpile-repo")]
    root: PathBuf,

    /// Require this bearer token on every request.
    #[arg(long, env = "STOCKPILE_SERVER_TOKEN")]
    token: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = std::fs::create_dir_all(&cli.root) {
        error!("failed to create {}: {e}", cli.root.display());
        return ExitCode::FAILURE;
    }
    if !cli.root.join(MANIFEST_FILE).is_file() {
        warn!("{} has no {MANIFEST_FILE}", cli.root.display());
    }

    let addr = format!("{}:{}", cli.bind, cli.port);
    info!("starting stockpile-server on {addr}");
    if cli.token.is_some() {
        info!("bearer authentication enabled");
    }

    let site = Arc::new(Site::new(cli.root).with_token(cli.token));
    match stockpile_server::run_server(&site, &addr) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server failed: {e}");
            ExitCode::FAILURE
        }
    }
}
