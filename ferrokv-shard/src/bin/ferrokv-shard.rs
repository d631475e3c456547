use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ferrokv_core::Role;
use ferrokv_shard::{build_router, run_registrar, run_replicator, ShardState};
use ferrokv_storage::WalManager;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const REGISTRAR_INTERVAL: Duration = Duration::from_secs(5);
const REPLICATION_TICK: Duration = Duration::from_secs(1);
const REPLICATION_PULL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "ferrokv-shard", about = "FerroKV stateful shard node")]
struct Cli {
    /// `leader` or `follower`.
    #[arg(long, env = "ROLE")]
    role: Role,

    /// This shard group's identifier; shared by the leader and its followers.
    #[arg(long, env = "SHARD_ID")]
    shard_id: String,

    /// The leader's replication endpoint. Required for followers, ignored
    /// for leaders.
    #[arg(long, env = "LEADER_URL")]
    leader_url: Option<String>,

    /// Where the coordinator is reachable for registration.
    #[arg(long, env = "COORDINATOR_URL")]
    coordinator_url: String,

    /// The address other nodes should use to reach this shard (may differ
    /// from the bind address behind a container NAT).
    #[arg(long, env = "MY_ADDRESS")]
    my_address: String,

    /// This process's own HTTP bind address.
    #[arg(long, env = "SHARD_ADDR", default_value = "0.0.0.0:9000")]
    shard_addr: SocketAddr,

    /// Directory the WAL file is written under, as `{data_dir}/{shard_id}.wal`.
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_observability();

    let cli = Cli::parse();
    if cli.role == Role::Follower && cli.leader_url.is_none() {
        anyhow::bail!("ROLE=follower requires LEADER_URL");
    }

    std::fs::create_dir_all(&cli.data_dir)?;
    let wal_path = cli.data_dir.join(format!("{}.wal", cli.shard_id));
    let wal = Arc::new(WalManager::open(&wal_path)?);
    info!(
        shard_id = %cli.shard_id,
        role = cli.role.as_str(),
        offset = wal.current_offset(),
        keys = wal.key_count(),
        "WAL recovered"
    );

    let state = ShardState::new(cli.shard_id.clone(), cli.role, wal.clone());
    let app = build_router(state).layer(TraceLayer::new_for_http());

    let http = reqwest::Client::builder().build()?;

    tokio::spawn(run_registrar(
        http.clone(),
        cli.coordinator_url.clone(),
        cli.shard_id.clone(),
        cli.my_address.clone(),
        cli.role,
        REGISTRAR_INTERVAL,
    ));

    if cli.role == Role::Follower {
        let leader_url = cli.leader_url.expect("checked above");
        tokio::spawn(run_replicator(
            http,
            leader_url,
            wal,
            REPLICATION_TICK,
            REPLICATION_PULL_TIMEOUT,
        ));
    }

    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        info!("shutdown signal received");
    };

    let listener = tokio::net::TcpListener::bind(cli.shard_addr).await?;
    info!(addr = %cli.shard_addr, shard_id = %cli.shard_id, "starting ferrokv-shard");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("shard stopped");
    Ok(())
}

fn init_observability() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_line_number(true)
        .json();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,ferrokv_shard=debug".into());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();
}
