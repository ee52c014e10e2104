//! Blue/green pool orchestration.

mod manager;
mod scale;

pub use manager::{PoolManager, SwapReport};
pub use scale::REPLICAS_ANNOTATION;
