use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lexi-gateway")]
#[command(about = "Credit-metered gateway for multiple LLM providers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Address to bind, overriding server.bind
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// List configured models
    Models,

    /// Show a user's credit balance
    Balance {
        #[arg(short, long)]
        user: String,
    },

    /// Add credit to a user's account
    Recharge {
        #[arg(short, long)]
        user: String,

        /// Amount of credit to add
        #[arg(short, long)]
        amount: String,
    },
}
