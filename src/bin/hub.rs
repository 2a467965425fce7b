use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tailwatch::{
    actors::{client::ClientServices, manager::ManagerHandle},
    api::{ApiConfig, ApiState, spawn_api_server},
    config::load_config,
    filter::lua::LuaLoader,
    ssh::SystemSsh,
};
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Log level for the hub (error, warn, info, debug, trace)
    #[arg(long, default_value = "debug")]
    log_level: LevelFilter,
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![
        ("tailwatch", level),
        ("tailwatch_hub", level),
        ("tower_http", LevelFilter::DEBUG.min(level)),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.log_level);
    trace!("started with args: {args:?}");

    let loader = Arc::new(LuaLoader::new());
    let (raw, config) = load_config(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    config.validate(loader.as_ref())?;

    let services = ClientServices {
        loader,
        connector: Arc::new(SystemSsh::new()),
    };
    let manager = ManagerHandle::spawn(services, Some(args.config.clone()));

    let api_config = ApiConfig::from(&config);
    manager
        .build(config, raw)
        .await
        .context("initial build failed")?;

    let addr = spawn_api_server(api_config, ApiState::new(manager.clone())).await?;
    info!("hub ready on {addr}");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.close();

    Ok(())
}
