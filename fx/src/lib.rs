//! RateMesh FX Engine
//!
//! Exchange-rate resolution over multiple unreliable rate sources.
//!
//! # Features
//!
//! - REST, plugin and manual rate providers tried in priority order
//! - Jittered rate cache over an in-process or Redis backend
//! - Multi-hop rate inference with a `-ln(rate)` shortest-path search
//! - Durable latest-rate table, append-only history and hourly statistics
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ratemesh_fx::{MemoryCacheBackend, MemoryRateStore, ProviderRegistry};
//! use ratemesh_fx::{RateFetchOrchestrator, ResolverConfig};
//!
//! let orchestrator = RateFetchOrchestrator::new(
//!     ResolverConfig::default(),
//!     Arc::new(ProviderRegistry::new()),
//!     Arc::new(MemoryCacheBackend::new()),
//!     Arc::new(MemoryRateStore::new()),
//! );
//!
//! let quote = orchestrator.resolve_rate("EUR", "GBP", None).await?;
//! let converted = orchestrator.convert(1000.0, "USD", "JPY", None).await?;
//! ```

pub mod audit;
pub mod cache;
pub mod conversion;
pub mod error;
pub mod graph;
pub mod monitor;
pub mod orchestrator;
pub mod provider;
pub mod store;

pub use cache::{
    CacheBackend, CacheEntry, MemoryCacheBackend, RateCache, RateCacheConfig, RateKey,
    RedisCacheBackend,
};
pub use conversion::ConversionResult;
pub use error::{RateError, RateResult};
pub use graph::{
    build_graph, find_all_paths, find_best_path, merge_graphs, PathResult, RateEdge, RateGraph,
};
pub use monitor::{MonitorStats, QueryOutcome, RateMonitor};
pub use orchestrator::{RateFetchOrchestrator, RateQuoteResult, RateRequest, ResolverConfig};
pub use provider::{
    ManualRateProvider, PluginRateProvider, PluginRegistry, ProviderDescriptor, ProviderRegistry,
    RateProvider, RestRateProvider,
};
pub use store::{MemoryRateStore, PgRateStore, RateStore, RetentionPolicy};
