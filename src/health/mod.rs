//! Fleet health checking.
//!
//! A probe is exec'd in every ready pod backing a service; the readings
//! reduce to a per-service verdict ("all ready pods agree and are correct")
//! and a global one.

mod checker;
mod test_pool;

pub use checker::{FleetVerdict, HealthcheckManager, PodReading, ProbeSpec, Reading, ServiceVerdict};
pub use test_pool::TestPoolStateChecker;
