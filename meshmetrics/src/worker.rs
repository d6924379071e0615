//! Workers own a shard of metric identities each. All mutation for a shard
//! happens on that worker's task, which is what lets the samplers stay
//! lock-free.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::proto;
use crate::samplers::{
    Counter, Gauge, Histo, HistogramAggregates, InterMetric, JsonMetric, MergeError, Metric,
    MetricKey, MetricKind, Scope, Set,
};

/// Failures importing a metric across an instance boundary. Each failure
/// covers one metric; a batch is never failed wholesale.
#[derive(Debug, Error)]
pub enum ImportError {
    /// Local-only metrics must stay on the instance that observed them.
    #[error("refusing to import local-only metric '{name}'")]
    LocalOnlyScope {
        /// The offending metric.
        name: String,
    },
    /// The metric arrived without a value payload.
    #[error("metric '{name}' has no value")]
    MissingValue {
        /// The offending metric.
        name: String,
    },
    /// The metric's type enum was not one we know.
    #[error("metric '{name}' has an unknown type")]
    UnknownType {
        /// The offending metric.
        name: String,
    },
    /// The peer state could not be merged into the local sampler.
    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// One flush interval's accumulated samplers, keyed by metric identity and
/// partitioned by where each series should be aggregated.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    /// Counters aggregated here and forwarded.
    pub counters: HashMap<MetricKey, Counter>,
    /// Counters aggregated only on the global tier.
    pub global_counters: HashMap<MetricKey, Counter>,
    /// Gauges aggregated here and forwarded.
    pub gauges: HashMap<MetricKey, Gauge>,
    /// Gauges aggregated only on the global tier.
    pub global_gauges: HashMap<MetricKey, Gauge>,
    /// Histograms aggregated here and forwarded.
    pub histograms: HashMap<MetricKey, Histo>,
    /// Histograms that never leave this instance.
    pub local_histograms: HashMap<MetricKey, Histo>,
    /// Histograms aggregated only on the global tier.
    pub global_histograms: HashMap<MetricKey, Histo>,
    /// Timers aggregated here and forwarded.
    pub timers: HashMap<MetricKey, Histo>,
    /// Timers that never leave this instance.
    pub local_timers: HashMap<MetricKey, Histo>,
    /// Timers aggregated only on the global tier.
    pub global_timers: HashMap<MetricKey, Histo>,
    /// Sets, which aggregate everywhere regardless of scope.
    pub sets: HashMap<MetricKey, Set>,
}

impl WorkerMetrics {
    /// Flush every locally-aggregated sampler to InterMetrics. Global-only
    /// samplers are not flushed here; they leave through
    /// [`WorkerMetrics::export_global`].
    pub fn flush_local(
        &self,
        percentiles: &[f64],
        aggregates: HistogramAggregates,
    ) -> Vec<InterMetric> {
        let mut flushed = Vec::new();
        for counter in self.counters.values() {
            flushed.extend(counter.flush());
        }
        for gauge in self.gauges.values() {
            flushed.extend(gauge.flush());
        }
        for set in self.sets.values() {
            flushed.extend(set.flush());
        }
        for histogram in self.histograms.values().chain(self.local_histograms.values()) {
            flushed.extend(histogram.flush(percentiles, aggregates));
        }
        for timer in self.timers.values().chain(self.local_timers.values()) {
            flushed.extend(timer.flush(percentiles, aggregates));
        }
        flushed
    }

    /// Export every global-only sampler as a wire metric, ready to forward
    /// to the global tier.
    pub fn export_global(&self) -> Vec<proto::Metric> {
        let mut exported = Vec::new();
        for counter in self.global_counters.values() {
            let mut metric = counter.to_metric();
            metric.scope = proto::Scope::Global as i32;
            exported.push(metric);
        }
        for gauge in self.global_gauges.values() {
            let mut metric = gauge.to_metric();
            metric.scope = proto::Scope::Global as i32;
            exported.push(metric);
        }
        for histogram in self.global_histograms.values() {
            let mut metric = histogram.to_metric();
            metric.scope = proto::Scope::Global as i32;
            exported.push(metric);
        }
        for timer in self.global_timers.values() {
            let mut metric = timer.to_metric();
            metric.r#type = proto::Type::Timer as i32;
            metric.scope = proto::Scope::Global as i32;
            exported.push(metric);
        }
        exported
    }

    /// How many samplers are held across all maps.
    pub fn len(&self) -> usize {
        self.counters.len()
            + self.global_counters.len()
            + self.gauges.len()
            + self.global_gauges.len()
            + self.histograms.len()
            + self.local_histograms.len()
            + self.global_histograms.len()
            + self.timers.len()
            + self.local_timers.len()
            + self.global_timers.len()
            + self.sets.len()
    }

    /// Whether no samplers are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum WorkerCommand {
    Sample(Metric),
    ImportJson(JsonMetric),
    ImportGrpc(proto::Metric),
    Flush(oneshot::Sender<WorkerMetrics>),
}

/// The producer side of a worker task. Cheap to clone; every producer for
/// a shard funnels through the same queue, which serializes all mutation.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    /// Queue a sample for aggregation.
    pub fn ingest(&self, metric: Metric) {
        if self.commands.send(WorkerCommand::Sample(metric)).is_err() {
            log::debug!("dropping sample: worker has shut down");
        }
    }

    /// Queue a JSON-surface peer state for merging.
    pub fn import_json(&self, metric: JsonMetric) {
        if self.commands.send(WorkerCommand::ImportJson(metric)).is_err() {
            log::debug!("dropping imported metric: worker has shut down");
        }
    }

    /// Swap out the worker's accumulator and return it. A dead worker
    /// yields an empty accumulator.
    pub async fn flush(&self) -> WorkerMetrics {
        let (reply, response) = oneshot::channel();
        if self.commands.send(WorkerCommand::Flush(reply)).is_err() {
            return WorkerMetrics::default();
        }
        response.await.unwrap_or_default()
    }
}

impl crate::import::MetricIngester for WorkerHandle {
    fn ingest_metric(&self, metric: proto::Metric) {
        if self.commands.send(WorkerCommand::ImportGrpc(metric)).is_err() {
            log::debug!("dropping imported metric: worker has shut down");
        }
    }
}

/// Route a sample to its owning worker using the precomputed digest. The
/// packet-ingest entry point; it must agree with the import server's
/// key-hash routing.
pub fn dispatch(metric: Metric, workers: &[WorkerHandle]) {
    let index = crate::shard::worker_for_digest(metric.digest, workers.len());
    workers[index].ingest(metric);
}

/// A single-owner aggregation shard.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    metrics: WorkerMetrics,
}

impl Worker {
    /// Create a worker for direct (single-threaded) use.
    pub fn new(id: usize) -> Self {
        Self {
            id,
            metrics: WorkerMetrics::default(),
        }
    }

    /// Spawn the worker's task and return the producer handle. The task
    /// exits when every handle is dropped.
    pub fn spawn(id: usize) -> WorkerHandle {
        let (commands, queue) = mpsc::unbounded_channel();
        tokio::spawn(Worker::new(id).run(queue));
        WorkerHandle { commands }
    }

    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<WorkerCommand>) {
        log::debug!("worker {} started", self.id);
        while let Some(command) = queue.recv().await {
            match command {
                WorkerCommand::Sample(metric) => self.process_metric(metric),
                WorkerCommand::ImportJson(metric) => {
                    if let Err(error) = self.import_metric(metric) {
                        log::warn!("worker {} dropped an imported metric: {error}", self.id);
                    }
                }
                WorkerCommand::ImportGrpc(metric) => {
                    if let Err(error) = self.import_metric_grpc(metric) {
                        log::warn!("worker {} dropped an imported metric: {error}", self.id);
                    }
                }
                WorkerCommand::Flush(reply) => {
                    let _ = reply.send(self.flush());
                }
            }
        }
        log::debug!("worker {} stopped", self.id);
    }

    /// Fold one sample into the sampler owning its identity, creating the
    /// sampler on first sight.
    pub fn process_metric(&mut self, metric: Metric) {
        let Metric {
            key,
            value,
            sample_rate,
            tags,
            scope,
            ..
        } = metric;

        match key.kind {
            MetricKind::Counter => {
                let Some(sample) = value.as_f64() else {
                    log::warn!("ignoring non-numeric counter sample for '{}'", key.name);
                    return;
                };
                let counters = match scope {
                    Scope::GlobalOnly => &mut self.metrics.global_counters,
                    _ => &mut self.metrics.counters,
                };
                counters
                    .entry(key)
                    .or_insert_with_key(|k| Counter::new(&k.name, &tags))
                    .sample(sample, sample_rate);
            }
            MetricKind::Gauge => {
                let Some(sample) = value.as_f64() else {
                    log::warn!("ignoring non-numeric gauge sample for '{}'", key.name);
                    return;
                };
                let gauges = match scope {
                    Scope::GlobalOnly => &mut self.metrics.global_gauges,
                    _ => &mut self.metrics.gauges,
                };
                gauges
                    .entry(key)
                    .or_insert_with_key(|k| Gauge::new(&k.name, &tags))
                    .sample(sample, sample_rate);
            }
            MetricKind::Histogram => {
                let Some(sample) = value.as_f64() else {
                    log::warn!("ignoring non-numeric histogram sample for '{}'", key.name);
                    return;
                };
                let histograms = match scope {
                    Scope::LocalOnly => &mut self.metrics.local_histograms,
                    Scope::GlobalOnly => &mut self.metrics.global_histograms,
                    Scope::Mixed => &mut self.metrics.histograms,
                };
                histograms
                    .entry(key)
                    .or_insert_with_key(|k| Histo::new(&k.name, &tags))
                    .sample(sample, sample_rate);
            }
            MetricKind::Timer => {
                let Some(sample) = value.as_f64() else {
                    log::warn!("ignoring non-numeric timer sample for '{}'", key.name);
                    return;
                };
                let timers = match scope {
                    Scope::LocalOnly => &mut self.metrics.local_timers,
                    Scope::GlobalOnly => &mut self.metrics.global_timers,
                    Scope::Mixed => &mut self.metrics.timers,
                };
                timers
                    .entry(key)
                    .or_insert_with_key(|k| Histo::new(&k.name, &tags))
                    .sample(sample, sample_rate);
            }
            MetricKind::Set => {
                let member = value.into_text();
                self.metrics
                    .sets
                    .entry(key)
                    .or_insert_with_key(|k| Set::new(&k.name, &tags))
                    .sample(&member, sample_rate);
            }
        }
    }

    /// Merge a JSON-surface peer state into the sampler owning its
    /// identity.
    pub fn import_metric(&mut self, metric: JsonMetric) -> Result<(), ImportError> {
        let JsonMetric {
            key, tags, value, ..
        } = metric;
        match key.kind {
            MetricKind::Counter => self
                .metrics
                .counters
                .entry(key)
                .or_insert_with_key(|k| Counter::new(&k.name, &tags))
                .combine(&value)?,
            MetricKind::Gauge => self
                .metrics
                .gauges
                .entry(key)
                .or_insert_with_key(|k| Gauge::new(&k.name, &tags))
                .combine(&value)?,
            MetricKind::Histogram => self
                .metrics
                .histograms
                .entry(key)
                .or_insert_with_key(|k| Histo::new(&k.name, &tags))
                .combine(&value)?,
            MetricKind::Timer => self
                .metrics
                .timers
                .entry(key)
                .or_insert_with_key(|k| Histo::new(&k.name, &tags))
                .combine(&value)?,
            MetricKind::Set => self
                .metrics
                .sets
                .entry(key)
                .or_insert_with_key(|k| Set::new(&k.name, &tags))
                .combine(&value)?,
        }
        Ok(())
    }

    /// Merge a wire-format peer state into the sampler owning its identity.
    /// Rejects local-only metrics and metrics without a value.
    pub fn import_metric_grpc(&mut self, metric: proto::Metric) -> Result<(), ImportError> {
        let scope = proto::Scope::try_from(metric.scope).unwrap_or(proto::Scope::Mixed);
        if scope == proto::Scope::Local {
            return Err(ImportError::LocalOnlyScope { name: metric.name });
        }
        let Ok(kind) = proto::Type::try_from(metric.r#type) else {
            return Err(ImportError::UnknownType { name: metric.name });
        };
        let kind = MetricKind::from_proto(kind);
        let Some(value) = metric.value else {
            return Err(ImportError::MissingValue { name: metric.name });
        };

        let key = MetricKey {
            name: metric.name,
            kind,
            joined_tags: metric.tags.join(","),
        };
        let tags = metric.tags;
        let global = scope == proto::Scope::Global;

        match value {
            proto::metric::Value::Counter(counter) => {
                let counters = if global {
                    &mut self.metrics.global_counters
                } else {
                    &mut self.metrics.counters
                };
                counters
                    .entry(key)
                    .or_insert_with_key(|k| Counter::new(&k.name, &tags))
                    .merge_value(counter.value);
            }
            proto::metric::Value::Gauge(gauge) => {
                let gauges = if global {
                    &mut self.metrics.global_gauges
                } else {
                    &mut self.metrics.gauges
                };
                gauges
                    .entry(key)
                    .or_insert_with_key(|k| Gauge::new(&k.name, &tags))
                    .merge_value(gauge.value);
            }
            proto::metric::Value::Set(set) => {
                self.metrics
                    .sets
                    .entry(key)
                    .or_insert_with_key(|k| Set::new(&k.name, &tags))
                    .combine(&set.hyperloglog)?;
            }
            proto::metric::Value::Histogram(histogram) => {
                let Some(digest) = histogram.t_digest else {
                    return Err(ImportError::MissingValue { name: key.name });
                };
                let histograms = match (kind, global) {
                    (MetricKind::Timer, true) => &mut self.metrics.global_timers,
                    (MetricKind::Timer, false) => &mut self.metrics.timers,
                    (_, true) => &mut self.metrics.global_histograms,
                    (_, false) => &mut self.metrics.histograms,
                };
                histograms
                    .entry(key)
                    .or_insert_with_key(|k| Histo::new(&k.name, &tags))
                    .merge_digest(&digest);
            }
        }
        Ok(())
    }

    /// Swap the accumulator with a fresh one and hand the old one to the
    /// caller, who now owns it exclusively.
    pub fn flush(&mut self) -> WorkerMetrics {
        std::mem::take(&mut self.metrics)
    }

    /// This worker's shard index.
    pub fn id(&self) -> usize {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::Worker;
    use crate::proto;
    use crate::samplers::{
        Counter, Histo, Metric, MetricKind, MetricValue, Scope, Set,
    };

    fn counter_sample(name: &str, value: f64) -> Metric {
        Metric::new(
            name,
            MetricKind::Counter,
            Vec::new(),
            MetricValue::Number(value),
        )
    }

    #[test]
    fn flush_drains_the_accumulator() {
        let mut worker = Worker::new(1);
        worker.process_metric(counter_sample("a.b.c", 1.0));

        let flushed = worker.flush();
        assert_eq!(1, flushed.counters.len());

        let nothing = worker.flush();
        assert!(nothing.is_empty());
    }

    #[test]
    fn local_histograms_stay_local() {
        let mut worker = Worker::new(1);
        worker.process_metric(
            Metric::new(
                "a.b.c",
                MetricKind::Histogram,
                Vec::new(),
                MetricValue::Number(1.0),
            )
            .with_scope(Scope::LocalOnly),
        );

        let flushed = worker.flush();
        assert_eq!(1, flushed.local_histograms.len());
        assert_eq!(0, flushed.histograms.len());
    }

    #[test]
    fn global_scope_routes_to_global_maps() {
        let mut worker = Worker::new(1);
        worker.process_metric(counter_sample("a.b.c", 1.0).with_scope(Scope::GlobalOnly));
        worker.process_metric(
            Metric::new(
                "b.c.a",
                MetricKind::Gauge,
                Vec::new(),
                MetricValue::Number(1.0),
            )
            .with_scope(Scope::GlobalOnly),
        );

        assert_eq!(1, worker.metrics().global_counters.len());
        assert_eq!(0, worker.metrics().counters.len());
        assert_eq!(1, worker.metrics().global_gauges.len());
        assert_eq!(0, worker.metrics().gauges.len());
    }

    #[test]
    fn same_identity_reuses_one_sampler() {
        let mut worker = Worker::new(1);
        worker.process_metric(counter_sample("a.b.c", 1.0));
        worker.process_metric(counter_sample("a.b.c", 2.0));
        let flushed = worker.flush();
        assert_eq!(1, flushed.counters.len());
        let metric = &flushed.counters.values().next().unwrap().flush()[0];
        assert_eq!(3.0, metric.value);
    }

    #[test]
    fn imports_a_set_from_json() {
        let mut exported = Set::new("a.b.c", &[]);
        exported.sample("foo", 1.0);
        exported.sample("bar", 1.0);

        let mut worker = Worker::new(1);
        worker
            .import_metric(exported.export(Scope::Mixed))
            .unwrap();

        let flushed = worker.flush();
        assert_eq!(1, flushed.sets.len());
    }

    #[test]
    fn imports_a_histogram_from_json() {
        let mut exported = Histo::new("a.b.c", &[]);
        exported.sample(1.0, 1.0);
        exported.sample(2.0, 1.0);

        let mut worker = Worker::new(1);
        worker
            .import_metric(exported.export(Scope::Mixed).unwrap())
            .unwrap();

        let flushed = worker.flush();
        assert_eq!(1, flushed.histograms.len());
    }

    fn export_and_import(
        metric_type: proto::Type,
        scope: proto::Scope,
    ) -> super::WorkerMetrics {
        let mut histo = Histo::new("test.histo", &[]);
        histo.sample(1.0, 1.0);
        let mut metric = histo.to_metric();
        metric.r#type = metric_type as i32;
        metric.scope = scope as i32;

        let mut worker = Worker::new(1);
        worker.import_metric_grpc(metric).unwrap();
        worker.flush()
    }

    #[test]
    fn grpc_import_routes_by_type_and_scope() {
        assert_eq!(
            1,
            export_and_import(proto::Type::Histogram, proto::Scope::Mixed)
                .histograms
                .len()
        );
        assert_eq!(
            1,
            export_and_import(proto::Type::Histogram, proto::Scope::Global)
                .global_histograms
                .len()
        );
        assert_eq!(
            1,
            export_and_import(proto::Type::Timer, proto::Scope::Mixed)
                .timers
                .len()
        );
        assert_eq!(
            1,
            export_and_import(proto::Type::Timer, proto::Scope::Global)
                .global_timers
                .len()
        );
    }

    #[test]
    fn grpc_import_routes_scalars() {
        let mut counter = Counter::new("test.counter", &[]);
        counter.sample(2.0, 1.0);
        let mut metric = counter.to_metric();
        metric.scope = proto::Scope::Global as i32;

        let mut worker = Worker::new(1);
        worker.import_metric_grpc(metric).unwrap();
        assert_eq!(1, worker.metrics().global_counters.len());

        let mut set = Set::new("test.set", &[]);
        set.sample("value", 1.0);
        worker.import_metric_grpc(set.to_metric()).unwrap();
        assert_eq!(1, worker.metrics().sets.len());
    }

    #[test]
    fn grpc_import_rejects_local_scope() {
        let mut histo = Histo::new("test.histo", &[]);
        histo.sample(1.0, 1.0);
        let mut metric = histo.to_metric();
        metric.scope = proto::Scope::Local as i32;

        let mut worker = Worker::new(1);
        assert!(worker.import_metric_grpc(metric).is_err());
        assert!(worker.metrics().is_empty());
    }

    #[test]
    fn grpc_import_rejects_missing_values() {
        let metric = proto::Metric {
            name: "test".to_string(),
            r#type: proto::Type::Histogram as i32,
            value: None,
            ..Default::default()
        };

        let mut worker = Worker::new(1);
        assert!(worker.import_metric_grpc(metric).is_err());
    }

    #[test]
    fn grpc_import_rejects_unknown_types() {
        let metric = proto::Metric {
            name: "test".to_string(),
            r#type: 99,
            value: Some(proto::metric::Value::Counter(proto::CounterValue {
                value: 1,
            })),
            ..Default::default()
        };

        let mut worker = Worker::new(1);
        assert!(worker.import_metric_grpc(metric).is_err());
    }

    #[test_log::test(tokio::test)]
    async fn dispatch_agrees_with_key_routing() {
        let workers: Vec<_> = (0..4).map(super::Worker::spawn).collect();
        for i in 0..20 {
            super::dispatch(counter_sample(&format!("metric.{i}"), 1.0), &workers);
        }

        let mut total = 0;
        for (index, worker) in workers.iter().enumerate() {
            let flushed = worker.flush().await;
            for key in flushed.counters.keys() {
                assert_eq!(index, crate::shard::worker_for_key(key, workers.len()));
            }
            total += flushed.counters.len();
        }
        assert_eq!(20, total);
    }

    #[test_log::test(tokio::test)]
    async fn spawned_worker_serializes_through_its_queue() {
        let handle = Worker::spawn(0);
        handle.ingest(counter_sample("a.b.c", 1.0));
        handle.ingest(counter_sample("a.b.c", 2.0));

        let mut exported = Histo::new("d.e.f", &[]);
        exported.sample(1.0, 1.0);
        handle.import_json(exported.export(Scope::Mixed).unwrap());

        let flushed = handle.flush().await;
        assert_eq!(1, flushed.counters.len());
        assert_eq!(1, flushed.histograms.len());

        let empty = handle.flush().await;
        assert!(empty.is_empty());
    }
}
