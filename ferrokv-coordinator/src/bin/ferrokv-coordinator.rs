use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use ferrokv_cluster::Registry;
use ferrokv_coordinator::build_router;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ferrokv-coordinator", about = "FerroKV routing coordinator")]
struct Cli {
    /// HTTP listening address for the coordinator.
    #[arg(long, env = "COORD_ADDR", default_value = "0.0.0.0:8080")]
    coord_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_observability();

    let cli = Cli::parse();
    info!(addr = %cli.coord_addr, "starting ferrokv-coordinator");

    let cluster = Arc::new(Registry::new());
    let app = build_router(cluster).layer(TraceLayer::new_for_http());

    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        info!("shutdown signal received");
    };

    let listener = tokio::net::TcpListener::bind(cli.coord_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("coordinator stopped");
    Ok(())
}

fn init_observability() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_line_number(true)
        .json();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,ferrokv_coordinator=debug".into());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();
}
