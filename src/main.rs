mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{Cli, Commands};
use lexi_gateway::app::{AppState, GatewayConfig};
use lexi_gateway::models::ModelRegistry;

fn init_tracing(debug: bool, log_directory: Option<&str>) -> Option<WorkerGuard> {
    let default_directive = if debug {
        "lexi_gateway=debug,tower_http=debug"
    } else {
        "lexi_gateway=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive.into());

    match log_directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "lexi-gateway.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}

fn print_models(config: &GatewayConfig) {
    let registry = ModelRegistry::new(config.models.clone());
    println!("{:<24} {:<10} {:<32} {:>6}  FLAGS", "NAME", "PROVIDER", "MODEL", "COST");
    for name in registry.model_names() {
        let Ok(model) = registry.get_config(name) else {
            continue;
        };
        let flags: Vec<&str> = [
            (model.reasoning_model, "reasoning"),
            (model.web_search, "web-search"),
            (model.vision, "vision"),
            (model.priority, "priority"),
        ]
        .into_iter()
        .filter_map(|(set, label)| set.then_some(label))
        .collect();
        println!(
            "{:<24} {:<10} {:<32} {:>6}  {}",
            name,
            model.provider,
            model.wire_model_id,
            model.cost,
            flags.join(",")
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = GatewayConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let _guard = init_tracing(cli.debug, config.logging.directory.as_deref());

    match cli.command.unwrap_or(Commands::Serve { bind: None }) {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            info!("Starting Lexi gateway in {} environment", config.environment);
            let state = Arc::new(AppState::new(config).await.context("Failed to initialize gateway")?);
            lexi_gateway::server::serve(state, &bind).await?;
        }
        Commands::Models => print_models(&config),
        Commands::Balance { user } => {
            let state = AppState::new(config).await?;
            let balance = state.ledger().get_balance(&user).await?;
            println!("{}: {}", user, balance);
        }
        Commands::Recharge { user, amount } => {
            let amount = Decimal::from_str(amount.trim())
                .with_context(|| format!("Invalid amount: {}", amount))?;
            let state = AppState::new(config).await?;
            let new_balance = state.chat().recharge(&user, amount).await?;
            println!("{}: {}", user, new_balance);
        }
    }

    Ok(())
}
