//! A horizontally-scaled metric aggregation fabric.
//!
//! Edge instances accept samples, aggregate them in sharded lock-free
//! workers, and forward partially-aggregated state over gRPC to global
//! instances that finish the job. A stateless proxy tier re-routes batches
//! so every metric identity converges on one global aggregator, no matter
//! which proxy received it.
//!
//! The pieces compose left to right:
//!
//! ```text
//! samples -> shard -> Worker (aggregate) -> Flusher -> sinks | Forward
//!                                                               |
//!                              ProxyServer -> ring -> ImportServer -> Worker
//! ```
//!
//! [`samplers`] holds the aggregation kernel, [`worker`] the sharded
//! accumulators, [`proxy`] and [`import`] the two gRPC surfaces, and
//! [`ring`]/[`discovery`] the consistent-hash routing between them.

#[deny(missing_docs)]
pub mod config;
#[deny(missing_docs)]
pub mod discovery;
#[deny(missing_docs)]
pub mod flush;
#[deny(missing_docs)]
pub mod forward_client;
#[deny(missing_docs)]
pub mod import;
#[deny(missing_docs)]
pub mod proxy;
#[deny(missing_docs)]
pub mod ring;
#[deny(missing_docs)]
pub mod samplers;
#[deny(missing_docs)]
pub mod shard;
#[deny(missing_docs)]
pub mod sinks;
#[deny(missing_docs)]
pub mod stats;
#[deny(missing_docs)]
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use samplers::{InterMetric, Metric, MetricKey, MetricKind, MetricValue, Scope};
pub use worker::{Worker, WorkerHandle, WorkerMetrics};

/// Internal generated types - ideally you shouldn't need to do much with
/// them. Nevertheless, they are exported in case you need them.
pub mod proto;
