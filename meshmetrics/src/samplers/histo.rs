use serde::{Deserialize, Serialize};

use crate::proto;

use super::tdigest::MergingDigest;
use super::{
    route_info, unix_timestamp, Aggregate, ExportError, HistogramAggregates, InterMetric,
    JsonMetric, MergeError, MetricKey, MetricKind, MetricType, Scope,
};

// A compact digest; we allocate one of these per histogram series.
const DIGEST_COMPRESSION: f64 = 100.0;

/// A distribution sampler: a t-digest for quantiles plus scalar accumulators
/// for the aggregates that merge exactly.
///
/// The scalar accumulators cover only the samples this instance observed.
/// They merge through the JSON surface but deliberately stay out of the
/// wire-format digest, so the global tier reports them without
/// double-counting.
#[derive(Debug, Clone)]
pub struct Histo {
    name: String,
    tags: Vec<String>,
    t_digest: MergingDigest,
    weight: f64,
    min: f64,
    max: f64,
    sum: f64,
    reciprocal_sum: f64,
}

/// The self-contained serialized form of a [`Histo`], carried as the value
/// of a [`JsonMetric`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoValue {
    /// The quantile sketch.
    pub t_digest: MergingDigest,
    /// Total sample weight.
    pub weight: f64,
    /// Smallest sample.
    pub min: f64,
    /// Largest sample.
    pub max: f64,
    /// Weighted sum of samples.
    pub sum: f64,
    /// Weighted sum of sample reciprocals.
    pub reciprocal_sum: f64,
}

impl Histo {
    /// Create an empty histogram.
    pub fn new(name: impl Into<String>, tags: &[String]) -> Self {
        Self {
            name: name.into(),
            tags: tags.to_vec(),
            t_digest: MergingDigest::new(DIGEST_COMPRESSION),
            weight: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            reciprocal_sum: 0.0,
        }
    }

    /// Add a sample with weight `1 / sample_rate`. Min and max track the
    /// raw per-sample extrema, not the weighted values.
    pub fn sample(&mut self, sample: f64, sample_rate: f32) {
        let weight = f64::from(1.0 / sample_rate);
        self.t_digest.add(sample, weight);

        self.weight += weight;
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
        self.sum += sample * weight;
        self.reciprocal_sum += (1.0 / sample) * weight;
    }

    /// Emit the configured aggregates and percentiles. Aggregates whose
    /// inputs never materialized are suppressed rather than emitted as
    /// misleading zeroes.
    pub fn flush(&self, percentiles: &[f64], aggregates: HistogramAggregates) -> Vec<InterMetric> {
        let now = unix_timestamp();
        let mut metrics = Vec::with_capacity(aggregates.count + percentiles.len());
        let sinks = route_info(&self.tags);

        if aggregates.value.contains(Aggregate::MAX) && self.max.is_finite() {
            metrics.push(InterMetric {
                name: format!("{}.max", self.name),
                timestamp: now,
                value: self.max,
                tags: self.tags.clone(),
                metric_type: MetricType::Gauge,
                sinks: sinks.clone(),
            });
        }
        if aggregates.value.contains(Aggregate::MIN) && self.min.is_finite() {
            metrics.push(InterMetric {
                name: format!("{}.min", self.name),
                timestamp: now,
                value: self.min,
                tags: self.tags.clone(),
                metric_type: MetricType::Gauge,
                sinks: sinks.clone(),
            });
        }
        if aggregates.value.contains(Aggregate::SUM) && self.sum != 0.0 {
            metrics.push(InterMetric {
                name: format!("{}.sum", self.name),
                timestamp: now,
                value: self.sum,
                tags: self.tags.clone(),
                metric_type: MetricType::Gauge,
                sinks: sinks.clone(),
            });
        }
        if aggregates.value.contains(Aggregate::AVERAGE) && self.sum != 0.0 && self.weight != 0.0 {
            // an average needs both a nonzero sum and some weight behind it
            metrics.push(InterMetric {
                name: format!("{}.avg", self.name),
                timestamp: now,
                value: self.sum / self.weight,
                tags: self.tags.clone(),
                metric_type: MetricType::Gauge,
                sinks: sinks.clone(),
            });
        }
        if aggregates.value.contains(Aggregate::COUNT) && self.weight != 0.0 {
            // left sparse when no local samples arrived, so downstream
            // flush intervals don't see misleading zeroes
            metrics.push(InterMetric {
                name: format!("{}.count", self.name),
                timestamp: now,
                value: self.weight,
                tags: self.tags.clone(),
                metric_type: MetricType::Counter,
                sinks: sinks.clone(),
            });
        }
        if aggregates.value.contains(Aggregate::MEDIAN) {
            metrics.push(InterMetric {
                name: format!("{}.median", self.name),
                timestamp: now,
                value: self.t_digest.quantile(0.5),
                tags: self.tags.clone(),
                metric_type: MetricType::Gauge,
                sinks: sinks.clone(),
            });
        }
        if aggregates.value.contains(Aggregate::HARMONIC_MEAN)
            && self.reciprocal_sum != 0.0
            && self.weight != 0.0
        {
            metrics.push(InterMetric {
                name: format!("{}.hmean", self.name),
                timestamp: now,
                value: self.weight / self.reciprocal_sum,
                tags: self.tags.clone(),
                metric_type: MetricType::Gauge,
                sinks: sinks.clone(),
            });
        }

        for &p in percentiles {
            metrics.push(InterMetric {
                name: format!("{}.{}percentile", self.name, (p * 100.0) as i32),
                timestamp: now,
                value: self.t_digest.quantile(p),
                tags: self.tags.clone(),
                metric_type: MetricType::Gauge,
                sinks: sinks.clone(),
            });
        }

        metrics
    }

    /// Serialize the full state (digest plus scalar accumulators) for the
    /// JSON surface.
    pub fn export(&self, scope: Scope) -> Result<JsonMetric, ExportError> {
        let state = HistoValue {
            t_digest: self.t_digest.clone(),
            weight: self.weight,
            min: self.min,
            max: self.max,
            sum: self.sum,
            reciprocal_sum: self.reciprocal_sum,
        };
        let value = bincode::serde::encode_to_vec(&state, bincode::config::standard())?;
        Ok(JsonMetric {
            key: MetricKey::new(&self.name, MetricKind::Histogram, &self.tags),
            tags: self.tags.clone(),
            value,
            scope,
        })
    }

    /// Merge a peer histogram's serialized state.
    ///
    /// Peers that predate the full-state format sent a bare t-digest; when
    /// the full decode fails we fall back to that shape and merge only the
    /// digest, which keeps mixed-version fleets mergeable.
    pub fn combine(&mut self, other: &[u8]) -> Result<(), MergeError> {
        let config = bincode::config::standard();
        match bincode::serde::decode_from_slice::<HistoValue, _>(other, config) {
            Ok((state, _)) => {
                self.t_digest.merge(&state.t_digest);
                self.weight += state.weight;
                self.min = self.min.min(state.min);
                self.max = self.max.max(state.max);
                self.sum += state.sum;
                self.reciprocal_sum += state.reciprocal_sum;
                Ok(())
            }
            Err(_) => {
                let (digest, _) =
                    bincode::serde::decode_from_slice::<MergingDigest, _>(other, config)?;
                self.t_digest.merge(&digest);
                Ok(())
            }
        }
    }

    /// Fold a wire-format peer digest into this histogram. The scalar
    /// accumulators stay local-only.
    pub fn merge_digest(&mut self, other: &proto::TDigest) {
        self.t_digest.merge_proto(other);
    }

    /// The wire representation: the digest only.
    pub fn to_metric(&self) -> proto::Metric {
        proto::Metric {
            name: self.name.clone(),
            r#type: proto::Type::Histogram as i32,
            tags: self.tags.clone(),
            scope: proto::Scope::Mixed as i32,
            value: Some(proto::metric::Value::Histogram(proto::HistogramValue {
                t_digest: Some(self.t_digest.to_proto()),
            })),
        }
    }

    /// The metric name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::{Histo, MergingDigest};
    use crate::samplers::{Aggregate, HistogramAggregates, MetricType, Scope};

    fn gated_aggregates() -> HistogramAggregates {
        (Aggregate::MIN
            | Aggregate::MAX
            | Aggregate::SUM
            | Aggregate::AVERAGE
            | Aggregate::COUNT
            | Aggregate::HARMONIC_MEAN)
            .into()
    }

    #[test]
    fn unsampled_histogram_flushes_nothing() {
        let histo = Histo::new("a.b.c", &[]);
        let flushed = histo.flush(&[], gated_aggregates());
        assert!(flushed.is_empty(), "flushed: {flushed:?}");
    }

    #[test]
    fn flush_emits_each_configured_aggregate() {
        let mut histo = Histo::new("a.b.c", &[]);
        histo.sample(1.0, 1.0);
        histo.sample(2.0, 1.0);
        histo.sample(4.0, 1.0);

        let aggregates: HistogramAggregates = (gated_aggregates().value | Aggregate::MEDIAN).into();
        let flushed = histo.flush(&[0.99], aggregates);
        let by_name: std::collections::HashMap<_, _> = flushed
            .iter()
            .map(|m| (m.name.as_str(), m))
            .collect();

        assert_eq!(8, flushed.len());
        assert_eq!(4.0, by_name["a.b.c.max"].value);
        assert_eq!(1.0, by_name["a.b.c.min"].value);
        assert_eq!(7.0, by_name["a.b.c.sum"].value);
        assert!((by_name["a.b.c.avg"].value - 7.0 / 3.0).abs() < 1e-9);
        assert_eq!(3.0, by_name["a.b.c.count"].value);
        assert_eq!(MetricType::Counter, by_name["a.b.c.count"].metric_type);
        // hmean = weight / sum(1/x) = 3 / 1.75
        assert!((by_name["a.b.c.hmean"].value - 3.0 / 1.75).abs() < 1e-9);
        assert!(by_name.contains_key("a.b.c.median"));
        assert!(by_name.contains_key("a.b.c.99percentile"));
    }

    #[test]
    fn sample_rate_weights_the_count() {
        let mut histo = Histo::new("a.b.c", &[]);
        histo.sample(10.0, 0.5);
        let flushed = histo.flush(&[], (Aggregate::COUNT | Aggregate::SUM).into());
        let by_name: std::collections::HashMap<_, _> =
            flushed.iter().map(|m| (m.name.as_str(), m)).collect();
        assert_eq!(2.0, by_name["a.b.c.count"].value);
        assert_eq!(20.0, by_name["a.b.c.sum"].value);
    }

    #[test]
    fn export_then_combine_merges_everything() {
        let mut remote = Histo::new("a.b.c", &[]);
        remote.sample(1.0, 1.0);
        remote.sample(2.0, 1.0);
        let exported = remote.export(Scope::Mixed).unwrap();

        let mut local = Histo::new("a.b.c", &[]);
        local.sample(10.0, 1.0);
        local.combine(&exported.value).unwrap();

        let flushed = local.flush(&[], gated_aggregates());
        let by_name: std::collections::HashMap<_, _> =
            flushed.iter().map(|m| (m.name.as_str(), m)).collect();
        assert_eq!(1.0, by_name["a.b.c.min"].value);
        assert_eq!(10.0, by_name["a.b.c.max"].value);
        assert_eq!(3.0, by_name["a.b.c.count"].value);
        assert_eq!(13.0, by_name["a.b.c.sum"].value);
    }

    #[test]
    fn combine_falls_back_to_bare_digests() {
        // a peer from before the full-state format: just a digest
        let mut bare = MergingDigest::new(100.0);
        bare.add(5.0, 1.0);
        bare.add(6.0, 1.0);
        let payload =
            bincode::serde::encode_to_vec(&bare, bincode::config::standard()).unwrap();

        let mut local = Histo::new("a.b.c", &[]);
        local.sample(1.0, 1.0);
        local.combine(&payload).unwrap();

        let flushed = local.flush(&[], gated_aggregates());
        let by_name: std::collections::HashMap<_, _> =
            flushed.iter().map(|m| (m.name.as_str(), m)).collect();
        // the scalar accumulators only saw the local sample
        assert_eq!(1.0, by_name["a.b.c.count"].value);
        assert_eq!(1.0, by_name["a.b.c.max"].value);
        // but the digest merged both sides
        let median = local.flush(&[0.5], Aggregate::empty().into())[0].value;
        assert!(median > 1.0, "median was {median}");
    }

    #[test]
    fn combine_rejects_garbage() {
        let mut histo = Histo::new("a.b.c", &[]);
        assert!(histo.combine(&[0xff]).is_err());
    }
}
