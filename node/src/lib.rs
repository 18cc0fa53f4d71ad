//! RateMesh Node
//!
//! Assembles the rate engine from configuration and runs its background
//! loops: hourly statistics flush and data retention.

pub mod config;
pub mod node;
pub mod state;

pub use config::NodeConfig;
pub use node::RateNode;
pub use state::NodeState;
