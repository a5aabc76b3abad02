pub mod config;
pub mod state;

pub use config::{AuthConfig, BillingConfig, GatewayConfig, LedgerBackend, LedgerConfig, ServerConfig, TokenEntry};
pub use state::AppState;
