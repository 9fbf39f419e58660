pub mod message;
pub mod plugin;

pub use message::{ConversationMessage, LogLevel, PipelineState, Role};
pub use plugin::{PipeOutput, Pipeline, PipelineError, TokenStream, wants_stream};
