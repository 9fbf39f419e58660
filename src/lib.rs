pub mod config;
pub mod flowise;
pub mod logger;
pub mod payload;
pub mod sse;

pub use config::{ConfigError, Valves};
pub use flowise::{FlowiseError, FlowisePipeline};
