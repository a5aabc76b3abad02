pub mod app;
pub mod auth;
pub mod chat;
pub mod error;
pub mod models;
pub mod server;
pub mod storage;

pub use error::{Error, Result};
