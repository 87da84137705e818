use std::sync::Arc;

use dexsync::cli::{Cli, Commands, ConfigAction};
use dexsync::config::Config;
use dexsync::gateway::client::{StaticTokenProvider, TokenProvider};
use dexsync::session::SessionController;
use dexsync::{AppResult, init_logging};

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse_args();
    let config = Config::load_or_default(&cli.config_file);
    let _log_guard = init_logging(&cli.effective_log_level(), Some(&config.log.file_path))?;

    tracing::info!("DexSync starting...");
    tracing::debug!("CLI arguments: {:?}", cli);

    match cli.command {
        Commands::Run { symbols } => run_session(config, symbols).await,
        Commands::Config { action } => handle_config(action, &cli.config_file),
    }
}

async fn run_session(config: Config, symbols: Vec<String>) -> AppResult<()> {
    let token = std::env::var("DEXSYNC_AUTH_TOKEN").unwrap_or_default();
    let authenticated = !token.is_empty();
    if !authenticated {
        tracing::warn!("DEXSYNC_AUTH_TOKEN is not set; account stream disabled");
    }
    let tokens: Arc<dyn TokenProvider> = Arc::new(StaticTokenProvider::new(token));

    let session = SessionController::new(&config, tokens);
    session.store().on_state_change(|change| {
        tracing::debug!(?change, "state updated");
    });

    session.connect().await?;
    tracing::info!(url = %config.gateway.url, "connected to gateway");

    let symbols = if symbols.is_empty() {
        config.symbols.clone()
    } else {
        symbols
    };
    for symbol in &symbols {
        match session.subscribe_symbol(symbol).await {
            Ok(()) => tracing::info!(%symbol, "subscribed to market data and trades"),
            Err(error) => tracing::error!(%symbol, %error, "subscription failed"),
        }
    }
    if authenticated {
        if let Err(error) = session.subscribe_account().await {
            tracing::error!(%error, "account subscription failed");
        }
    }

    tokio::signal::ctrl_c().await?;
    let metrics = session.store().metrics();
    tracing::info!(?metrics, "session metrics at shutdown");
    session.shutdown();
    Ok(())
}

fn handle_config(action: Option<ConfigAction>, config_file: &str) -> AppResult<()> {
    match action {
        Some(ConfigAction::Show) | None => {
            let config = Config::load_or_default(config_file);
            config.display()?;
        }
        Some(ConfigAction::Reset) => {
            let config = Config::default();
            config.save_to_file(config_file)?;
            println!("Configuration reset to defaults: {config_file}");
        }
    }
    Ok(())
}
