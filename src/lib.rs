pub mod application;
pub mod batch;
pub mod branch;
pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod git;
pub mod health;
pub mod k8s;
pub mod log;
pub mod pool;
pub mod render;
pub mod rollout;
pub mod settings;
pub mod status;
pub mod util;

pub use context::Context;
pub use error::{Error, Result};
