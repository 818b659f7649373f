#![allow(clippy::result_large_err)]
// Library entrypoint for the CLI binary and integration tests.
pub mod core;
pub mod infer;
pub mod ops;
pub mod services;
pub mod storage;

pub use crate::core::{config, error, logging, prompts, schemas, shutdown};
pub use crate::ops::{dispatcher, ramp, speed, statistics, stop, sweep};
pub use crate::services::notify;
