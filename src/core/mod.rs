pub mod config;
pub mod error;
pub mod logging;
pub mod prompts;
pub mod schemas;
pub mod shutdown;
