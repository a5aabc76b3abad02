pub mod anthropic;
pub mod canonical;
pub mod deepseek;
pub mod gemini;
pub mod grok;
pub mod openai;
pub(crate) mod openai_compat;
pub mod provider;
pub mod registry;
pub mod router;

pub use canonical::{
    CanonicalMessage, CanonicalRequest, CanonicalResponse, FunctionArguments, FunctionCall, FunctionDeclaration,
    ImageData, ParameterSpec, ResponseStatus, Role,
};
pub use provider::{ModelProvider, ProviderCall};
pub use registry::{ModelConfig, ModelRegistry, ProviderKind};
pub use router::{HttpProviderFactory, ProviderFactory, ProviderRouter};
