//! The flush driver: on a fixed cadence, drain every worker, hand the
//! locally-aggregated metrics to sinks, and forward global partials to the
//! global tier.

use std::time::Duration;

use crate::forward_client::ForwardGrpcClient;
use crate::samplers::{HistogramAggregates, InterMetric};
use crate::sinks::MetricSink;
use crate::worker::WorkerHandle;

/// Drains workers on an interval and routes what they held.
pub struct Flusher {
    workers: Vec<WorkerHandle>,
    cadence: Duration,
    percentiles: Vec<f64>,
    aggregates: HistogramAggregates,
    sinks: Vec<Box<dyn MetricSink>>,
    forward_address: Option<String>,
}

impl Flusher {
    /// Create a flusher over a set of workers. `forward_address`, when
    /// given, receives every global-scope partial on each flush.
    pub fn new(
        workers: Vec<WorkerHandle>,
        cadence: Duration,
        percentiles: Vec<f64>,
        aggregates: HistogramAggregates,
        sinks: Vec<Box<dyn MetricSink>>,
        forward_address: Option<String>,
    ) -> Self {
        Self {
            workers,
            cadence,
            percentiles,
            aggregates,
            sinks,
            forward_address,
        }
    }

    /// Run flushes until the process exits. Spawn this on the runtime.
    pub async fn flush_forever(self) {
        let mut interval = tokio::time::interval(self.cadence);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.flush_once().await;
        }
    }

    /// One flush pass: drain every worker, fan local metrics to sinks, and
    /// forward global partials.
    pub async fn flush_once(&self) {
        let mut local = Vec::new();
        let mut global = Vec::new();
        for worker in &self.workers {
            let drained = worker.flush().await;
            local.extend(drained.flush_local(&self.percentiles, self.aggregates));
            global.extend(drained.export_global());
        }

        log::debug!(
            "flushing {} local metrics and {} global partials",
            local.len(),
            global.len()
        );

        for sink in &self.sinks {
            let routed: Vec<InterMetric> = local
                .iter()
                .filter(|metric| metric.sinks.route_to(sink.name()))
                .cloned()
                .collect();
            sink.flush(&routed);
        }

        if global.is_empty() {
            return;
        }
        let Some(address) = &self.forward_address else {
            log::warn!(
                "dropping {} global partials: no forward address configured",
                global.len()
            );
            return;
        };
        match ForwardGrpcClient::connect(address).await {
            Ok(mut client) => {
                if let Err(error) = client.send_metrics(global).await {
                    log::error!("failed to forward global partials: {error}");
                }
            }
            Err(error) => {
                log::error!("failed to forward global partials: {error}");
            }
        }
    }
}
