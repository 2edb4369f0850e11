use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use replistore::{
    cli::{Cli, Command},
    client,
    controller::{Controller, ControllerConfig},
    datanode,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Controller(args) => {
            let listener = TcpListener::bind(("0.0.0.0", args.cport)).await?;
            let config = ControllerConfig {
                replication: args.replication_factor,
                timeout: Duration::from_millis(args.timeout_ms),
                rebalance_period: Duration::from_secs(args.rebalance_period_secs),
            };
            let controller = Controller::new(listener, config);
            let addr = controller.local_addr()?;
            info!("controller listening on {}", addr);
            if let Err(err) = controller.run_until_ctrl_c().await {
                warn!("controller exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Datanode(args) => datanode::run(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
