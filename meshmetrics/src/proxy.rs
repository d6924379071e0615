//! The forwarding proxy: a stateless re-router that partitions incoming
//! batches over the consistent-hash ring and fans the pieces out to the
//! global aggregators that own them.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use thiserror::Error;
use tonic::{Request, Response, Status};

use crate::forward_client::{ClientError, ForwardGrpcClient};
use crate::proto;
use crate::proto::forward_server::{Forward, ForwardServer};
use crate::ring::{Ring, SharedRing};
use crate::samplers::MetricKey;
use crate::stats::ProxyStats;

/// One independent forwarding failure. Failures never abort the rest of a
/// forwarding pass; they accumulate into a [`ForwardError`].
#[derive(Debug, Error)]
pub enum ForwardFailure {
    /// The ring produced no destination for some metrics; they were
    /// dropped.
    #[error("no destination for {metrics} metrics")]
    NoDestination {
        /// How many metrics were dropped.
        metrics: usize,
    },
    /// A destination's batch was lost to a dial or RPC failure.
    #[error("failed to forward {metrics} metrics to '{destination}': {source}")]
    Forward {
        /// The destination whose batch was lost.
        destination: String,
        /// How many metrics the batch held.
        metrics: usize,
        /// The dial or RPC error.
        source: ClientError,
    },
    /// A destination's batch was lost to the forward timeout.
    #[error("timed out forwarding {metrics} metrics to '{destination}'")]
    Timeout {
        /// The destination whose batch was lost.
        destination: String,
        /// How many metrics the batch held.
        metrics: usize,
    },
}

/// Every failure from one forwarding pass.
#[derive(Debug, Default)]
pub struct ForwardError {
    /// The individual failures, in no particular order.
    pub failures: Vec<ForwardFailure>,
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} forwarding failures:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, " [{failure}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for ForwardError {}

/// The proxy's Forward service. Stateless apart from the shared ring; any
/// number of proxies converge on the same metric-to-destination mapping.
#[derive(Debug, Clone)]
pub struct ProxyServer {
    destinations: Arc<SharedRing>,
    forward_timeout: Option<Duration>,
    stats: Arc<ProxyStats>,
}

impl ProxyServer {
    /// Create a proxy over a shared ring. A timeout, when given, bounds
    /// each destination's dial-and-send.
    pub fn new(destinations: Arc<SharedRing>, forward_timeout: Option<Duration>) -> Self {
        Self {
            destinations,
            forward_timeout,
            stats: Arc::new(ProxyStats::default()),
        }
    }

    /// The proxy's counters, for scraping or assertions.
    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    /// Bind `address` and serve until the process exits.
    pub async fn serve(self, address: SocketAddr) -> Result<(), tonic::transport::Error> {
        log::info!("proxy listening on {address}");
        tonic::transport::Server::builder()
            .add_service(ForwardServer::new(self))
            .serve(address)
            .await
    }

    /// Partition a batch across the current ring snapshot and forward each
    /// piece concurrently. Returns every failure; the callers that want
    /// back-pressure await this directly, while the RPC surface spawns it
    /// and drops the result.
    pub async fn forward_metrics(&self, list: proto::MetricList) -> Result<(), ForwardError> {
        let start = Instant::now();
        let metrics = list.metrics;
        let total = metrics.len();
        let ring = self.destinations.snapshot();

        let mut batches: HashMap<String, Vec<proto::Metric>> = HashMap::new();
        let mut undeliverable = 0usize;
        for metric in metrics {
            match destination_for(&ring, &metric) {
                Some(destination) => batches.entry(destination).or_default().push(metric),
                None => undeliverable += 1,
            }
        }

        let mut error = ForwardError::default();
        if undeliverable > 0 {
            log::error!("no destination for {undeliverable} metrics; dropping them");
            self.stats.record_failure(undeliverable);
            error.failures.push(ForwardFailure::NoDestination {
                metrics: undeliverable,
            });
        }

        // one task per destination; failures meet again at the join
        let forwards: Vec<_> = batches
            .into_iter()
            .map(|(destination, batch)| {
                tokio::spawn(send_batch(destination, batch, self.forward_timeout))
            })
            .collect();
        for joined in join_all(forwards).await {
            let failure = match joined {
                Ok(None) => continue,
                Ok(Some(failure)) => failure,
                Err(join_error) => {
                    log::error!("a forward task died: {join_error}");
                    continue;
                }
            };
            log::error!("{failure}");
            let lost = match &failure {
                ForwardFailure::NoDestination { metrics }
                | ForwardFailure::Forward { metrics, .. }
                | ForwardFailure::Timeout { metrics, .. } => *metrics,
            };
            self.stats.record_failure(lost);
            error.failures.push(failure);
        }

        self.stats.record_batch(total, start.elapsed());
        log::debug!(
            "proxied {total} metrics in {}ns",
            start.elapsed().as_nanos()
        );

        if error.failures.is_empty() {
            Ok(())
        } else {
            Err(error)
        }
    }
}

async fn send_batch(
    destination: String,
    batch: Vec<proto::Metric>,
    timeout: Option<Duration>,
) -> Option<ForwardFailure> {
    let metrics = batch.len();
    let send = async {
        let mut client = ForwardGrpcClient::connect(&destination).await?;
        client.send_metrics(batch).await
    };
    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, send).await,
        None => Ok(send.await),
    };
    match outcome {
        Ok(Ok(())) => None,
        Ok(Err(source)) => Some(ForwardFailure::Forward {
            destination,
            metrics,
            source,
        }),
        Err(_) => Some(ForwardFailure::Timeout {
            destination,
            metrics,
        }),
    }
}

fn destination_for(ring: &Ring, metric: &proto::Metric) -> Option<String> {
    let key = MetricKey::from_proto(metric)?;
    ring.get(&key.to_hash_string()).map(str::to_string)
}

#[tonic::async_trait]
impl Forward for ProxyServer {
    async fn send_metrics(
        &self,
        request: Request<proto::MetricList>,
    ) -> Result<Response<proto::Empty>, Status> {
        let proxy = self.clone();
        let list = request.into_inner();
        // fire and forget: the caller cannot distinguish success from a
        // forwarding failure, which is the accepted operational tradeoff
        tokio::spawn(async move {
            if let Err(error) = proxy.forward_metrics(list).await {
                log::error!("asynchronous forward failed: {error}");
            }
        });
        Ok(Response::new(proto::Empty {}))
    }
}
