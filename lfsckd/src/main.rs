//! Daemon entrypoint: loads configuration, initializes logging, binds the
//! HTTP control surface, and runs until SIGTERM/Ctrl-C.

use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

use lfsckd::api;
use lfsckd::api::AppState;
use lfsckd::config::DaemonConfig;

#[derive(Parser, Debug)]
#[command(name = "lfsckd")]
#[command(about = "Distributed online filesystem consistency checker daemon")]
struct Args {
    /// Path to config file; overrides LFSCKD_CONFIG.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn init_logging(level: &str) {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", level);
    }
    env_logger::init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("LFSCKD_CONFIG", path);
    }
    let config = DaemonConfig::load();
    init_logging(&config.logging.level);

    let bind_addr = config.http.bind_addr.clone();
    let state = AppState::new(config);
    let app = api::router(state);

    let listener = TcpListener::bind(&bind_addr).await?;
    log::info!("lfsckd listening on http://{bind_addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("server error: {e}");
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigterm.recv() => log::info!("received SIGTERM, shutting down"),
        _ = tokio::signal::ctrl_c() => log::info!("received ctrl-c, shutting down"),
    }

    Ok(())
}
