pub mod service;
pub mod types;

pub use service::{ChatService, ChatServiceConfig};
pub use types::{Billing, ChatOutcome, ChatReply, ChatSubmission, ReplyStatus, DEFAULT_QUERY_TYPE};
