//! Agent Runner binary
//!
//! Loads configuration, wires paper or live providers, starts the
//! observability API and runs decision cycles until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use agent_runner::api::{self, ApiState};
use agent_runner::config::{AgentConfig, TradingMode};
use agent_runner::executor::GatewayExecutor;
use agent_runner::hyperliquid::{HyperliquidInfoClient, IndicatorMarketProvider};
use agent_runner::llm::OpenRouterClient;
use agent_runner::paper::{MarkingMarketProvider, PaperExchange};
use agent_runner::providers::{ExchangeStateProvider, ExecutionLayer, MarketSnapshotProvider};
use agent_runner::taapi::TaapiClient;
use agent_runner::{ActiveTradeStore, AgentRuntime, Diary};

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Stdout plus a non-blocking `agent.log` in the log directory
fn init_tracing(config: &AgentConfig) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&config.paths.log_dir)
        .with_context(|| format!("creating log dir {:?}", config.paths.log_dir))?;
    let appender = tracing_appender::rolling::never(&config.paths.log_dir, "agent.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(guard)
}

type Providers = (
    Arc<dyn MarketSnapshotProvider>,
    Arc<dyn ExchangeStateProvider>,
    Arc<dyn ExecutionLayer>,
);

fn build_providers(config: &AgentConfig) -> anyhow::Result<Providers> {
    let taapi = Arc::new(TaapiClient::new(&config.taapi)?);
    let info = Arc::new(HyperliquidInfoClient::new(
        &config.exchange.info_url,
        config.exchange.account.clone(),
        EXCHANGE_TIMEOUT,
    )?);
    let market: Arc<dyn MarketSnapshotProvider> =
        Arc::new(IndicatorMarketProvider::new(info.clone(), taapi));

    match config.trading_mode {
        TradingMode::Paper => {
            let paper = Arc::new(PaperExchange::new(
                config.exchange.paper_starting_balance,
                config.risk.max_leverage,
            ));
            info!(
                "Paper exchange with {} starting balance",
                config.exchange.paper_starting_balance
            );
            let market: Arc<dyn MarketSnapshotProvider> =
                Arc::new(MarkingMarketProvider::new(market, paper.clone()));
            let exchange: Arc<dyn ExchangeStateProvider> = paper.clone();
            let execution: Arc<dyn ExecutionLayer> = paper;
            Ok((market, exchange, execution))
        }
        TradingMode::Live => {
            let gateway_url = config
                .exchange
                .order_gateway_url
                .as_deref()
                .context("live mode requires ORDER_GATEWAY_URL")?;
            let execution: Arc<dyn ExecutionLayer> =
                Arc::new(GatewayExecutor::new(gateway_url, EXCHANGE_TIMEOUT)?);
            let exchange: Arc<dyn ExchangeStateProvider> = info;
            Ok((market, exchange, execution))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::load().context("loading configuration")?;
    let _guard = init_tracing(&config)?;

    info!("Starting Agent Runner...");
    info!(
        "Assets: {:?}, interval: {:?}, model: {}",
        config.assets, config.interval, config.llm.model
    );

    let (market, exchange, execution) = build_providers(&config)?;
    let model = Arc::new(OpenRouterClient::new(
        &config.llm,
        Some(config.paths.llm_log_file()),
    )?);

    let diary = Arc::new(Diary::new(config.paths.diary_file()));
    let store = ActiveTradeStore::load(config.paths.active_trades_file())
        .await
        .context("loading active trade records")?;
    info!("✓ Loaded {} active trade records", store.len());

    if config.api.enabled {
        let state = Arc::new(ApiState {
            diary: diary.clone(),
            log_dir: config.paths.log_dir.clone(),
        });
        let host = config.api.host.clone();
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, &host, port).await {
                warn!("Observability API stopped: {}", e);
            }
        });
    }

    let mut runtime = AgentRuntime::new(config, market, exchange, execution, model, diary, store);
    runtime.run_until(shutdown_signal()).await;

    info!("Agent Runner stopped after {} cycles", runtime.cycles_run());
    Ok(())
}
