use anyhow::{Context, Result};
use spread_maker::engine::TradingEngine;
use spread_maker::exchange::KalshiClient;
use spread_maker::persistence::Ledger;
use spread_maker::Config;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(true)
        .init();

    info!("Starting Spread Maker v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    config.validate()?;
    info!(
        paper_trade = config.trading.paper_trade,
        assets = ?config.scanning.assets,
        min_spread = config.trading.min_spread_threshold,
        bankroll = %config.risk.max_total_exposure,
        "Configuration loaded"
    );
    if !config.trading.paper_trade {
        warn!("Live trading is enabled; real orders will be placed");
    }

    let exchange =
        Arc::new(KalshiClient::new(&config.kalshi).context("Failed to build Kalshi client")?);
    let ledger = Arc::new(Ledger::open(&config.database_path).context("Failed to open ledger")?);

    // Ctrl-C flips the flag; the running cycle finishes, then the
    // engine sweeps its open orders and exits.
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown_signal.store(true, Ordering::SeqCst);
        }
    });

    let mut engine = TradingEngine::new(config, exchange, ledger, shutdown);
    engine.run().await
}
