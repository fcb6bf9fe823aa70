use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use laddr_rs::config::{Cli, Config};
use laddr_rs::exchange::interface::ExchangeInterface;
use laddr_rs::exchange::{rest, stream};
use laddr_rs::quoting::manager::OrderManager;
use laddr_rs::store::TableStore;
use laddr_rs::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init_tracing("laddr_rs=info");
    telemetry::init_metrics();

    let cfg = Arc::new(Config::from_env(cli)?);
    info!(symbol = %cfg.symbol, dry_run = cfg.dry_run, "starting ladder market maker");

    // Mirror first: the driver reads everything from it.
    let store = Arc::new(TableStore::new(cfg.max_table_len));
    let stream = stream::connect(&cfg, store.clone()).await?;

    let rest = rest::RestClient::new(&cfg)?;
    let client = match rest::authenticate(rest, &cfg).await {
        Ok(client) => client,
        Err(e) => {
            // No session exists, so there is nothing to unwind.
            error!(error = %e, "authentication failed, exiting");
            stream.shutdown();
            return Err(e.into());
        }
    };

    let exchange = ExchangeInterface::new(client, store, stream, &cfg);
    let manager = OrderManager::init(exchange, cfg).await?;
    manager.run().await?;
    info!("shutdown complete");
    Ok(())
}
