//! The import server: the gRPC surface a global aggregator exposes to
//! receive partial aggregation state from edge instances and proxies.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tonic::{Request, Response, Status};

use crate::proto;
use crate::proto::forward_server::{Forward, ForwardServer};
use crate::samplers::MetricKey;
use crate::shard;
use crate::stats::ImportStats;

/// Anything that can accept a wire metric for aggregation: worker handles
/// in production, recording doubles in tests.
pub trait MetricIngester: Send + Sync + 'static {
    /// Take ownership of one metric. Must not block.
    fn ingest_metric(&self, metric: proto::Metric);
}

/// A Forward service that shards incoming metrics across a fixed set of
/// ingesters. Routing recomputes the shard hash from each metric's key, so
/// it agrees with the packet-ingest path's precomputed digests.
#[derive(Debug)]
pub struct ImportServer<I> {
    ingesters: Vec<I>,
    stats: Arc<ImportStats>,
}

impl<I: MetricIngester> ImportServer<I> {
    /// Create a server over at least one ingester.
    pub fn new(ingesters: Vec<I>) -> Self {
        assert!(
            !ingesters.is_empty(),
            "an import server needs at least one ingester"
        );
        Self {
            ingesters,
            stats: Arc::new(ImportStats::default()),
        }
    }

    /// The server's counters, for scraping or assertions.
    pub fn stats(&self) -> Arc<ImportStats> {
        Arc::clone(&self.stats)
    }

    /// Bind `address` and serve until the process exits.
    pub async fn serve(self, address: SocketAddr) -> Result<(), tonic::transport::Error> {
        log::info!("import server listening on {address}");
        tonic::transport::Server::builder()
            .add_service(ForwardServer::new(self))
            .serve(address)
            .await
    }
}

#[tonic::async_trait]
impl<I: MetricIngester> Forward for ImportServer<I> {
    async fn send_metrics(
        &self,
        request: Request<proto::MetricList>,
    ) -> Result<Response<proto::Empty>, Status> {
        let start = Instant::now();
        let metrics = request.into_inner().metrics;
        let received = metrics.len();

        for metric in metrics {
            let Some(key) = MetricKey::from_proto(&metric) else {
                log::warn!("not routing metric '{}': unknown type", metric.name);
                self.stats.record_unroutable();
                continue;
            };
            let index = shard::worker_for_key(&key, self.ingesters.len());
            self.ingesters[index].ingest_metric(metric);
        }

        self.stats.record_request(received, start.elapsed());
        log::debug!(
            "imported {received} metrics in {}ns",
            start.elapsed().as_nanos()
        );
        // per-metric failures are counted, not surfaced; the RPC is
        // fire-and-forget from the caller's point of view
        Ok(Response::new(proto::Empty {}))
    }
}
