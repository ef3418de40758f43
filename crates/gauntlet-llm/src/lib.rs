pub mod gateway;
pub mod providers;
pub mod scripted;

pub use gateway::HttpGateway;
pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;
pub use scripted::{ScriptedCall, ScriptedGateway};
