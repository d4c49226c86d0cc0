mod openai;

pub use openai::{ChatMessage, ContentPart, ImageUrl, LlmClient, LlmConfig, LlmError};
