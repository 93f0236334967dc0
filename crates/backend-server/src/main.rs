use std::sync::Arc;

use backend_http::{AppConfig, AppState, app_router};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "backend", about = "Health and Prometheus metrics service")]
struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value = "3000")]
    port: u16,

    /// Name used by external monitoring to select this service.
    #[arg(long, default_value = "backend")]
    app_name: String,

    /// Prefix for the default process metrics.
    #[arg(long, default_value = "backend_")]
    metrics_prefix: String,
}

impl Cli {
    fn app_config(&self) -> AppConfig {
        AppConfig {
            app_name: self.app_name.clone(),
            metrics_prefix: self.metrics_prefix.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("backend=info".parse()?)
        .add_directive("backend_http=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    run(Cli::parse()).await?;
    Ok(())
}

async fn run(cli: Cli) -> backend_common::Result<()> {
    let addr = format!("{}:{}", cli.host, cli.port);

    let state = Arc::new(AppState::new(cli.app_config())?);
    info!(
        app_name = %state.config.app_name,
        version = env!("CARGO_PKG_VERSION"),
        "metrics registry initialized"
    );
    let app = app_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("backend running on port {}", cli.port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("backend stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
