use clap::Parser;
use tailwatch::agent::{self, AgentParams};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Base64 encoded launch parameters
    params: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("tailwatch", LevelFilter::DEBUG),
        ("tailwatch_agent", LevelFilter::DEBUG),
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
    init();
    let args = Args::parse();

    let params = AgentParams::decode(&args.params)?;
    info!("tailing {} to {}", params.log_path, params.web_socket_addr);

    if let Err(e) = agent::run(params).await {
        error!("agent stopped: {e:#}");
        return Err(e);
    }
    Ok(())
}
