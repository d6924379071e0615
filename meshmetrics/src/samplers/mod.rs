//! The aggregation kernel: per-metric samplers that fold samples into
//! compact state, flush to [`InterMetric`]s, and merge serialized peer state.

mod counter;
mod gauge;
mod histo;
pub mod hll;
mod set;
pub mod tdigest;

pub use counter::Counter;
pub use gauge::Gauge;
pub use histo::{Histo, HistoValue};
pub use set::Set;

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proto;

/// Tags carrying this prefix are route directives: the suffix names the one
/// sink that should receive the metric. The prefix matches the veneur tag
/// convention so statsd clients already emitting it keep working.
const SINK_PREFIX: &str = "veneursinkonly:";

/// What a flushed metric is, for sinks that need to do the right thing
/// with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    /// A monotonic count over the flush interval.
    Counter,
    /// A point-in-time value.
    Gauge,
}

/// Every sampler variant a metric key can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// An accumulating counter.
    Counter,
    /// A last-write-wins gauge.
    Gauge,
    /// A t-digest-backed distribution.
    Histogram,
    /// A hyperloglog-backed distinct counter.
    Set,
    /// A histogram fed with timings.
    Timer,
}

impl MetricKind {
    /// The lowercase name used in metric keys and the JSON wire format.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Set => "set",
            MetricKind::Timer => "timer",
        }
    }

    /// The wire enum for this kind.
    pub fn to_proto(self) -> proto::Type {
        match self {
            MetricKind::Counter => proto::Type::Counter,
            MetricKind::Gauge => proto::Type::Gauge,
            MetricKind::Histogram => proto::Type::Histogram,
            MetricKind::Set => proto::Type::Set,
            MetricKind::Timer => proto::Type::Timer,
        }
    }

    /// The kind named by a wire enum.
    pub fn from_proto(value: proto::Type) -> Self {
        match value {
            proto::Type::Counter => MetricKind::Counter,
            proto::Type::Gauge => MetricKind::Gauge,
            proto::Type::Histogram => MetricKind::Histogram,
            proto::Type::Set => MetricKind::Set,
            proto::Type::Timer => MetricKind::Timer,
        }
    }
}

/// Whether a metric is aggregated on the instance that received it, on a
/// global aggregator, or both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Aggregate locally and forward for global aggregation.
    #[default]
    Mixed,
    /// Aggregate only on this instance. Never crosses an instance boundary.
    LocalOnly,
    /// Forward everything for global aggregation.
    GlobalOnly,
}

impl Scope {
    fn as_wire(self) -> u8 {
        match self {
            Scope::Mixed => 0,
            Scope::LocalOnly => 1,
            Scope::GlobalOnly => 2,
        }
    }

    /// The wire enum for this scope.
    pub fn to_proto(self) -> proto::Scope {
        match self {
            Scope::Mixed => proto::Scope::Mixed,
            Scope::LocalOnly => proto::Scope::Local,
            Scope::GlobalOnly => proto::Scope::Global,
        }
    }

    /// The scope named by a wire enum.
    pub fn from_proto(value: proto::Scope) -> Self {
        match value {
            proto::Scope::Mixed => Scope::Mixed,
            proto::Scope::Local => Scope::LocalOnly,
            proto::Scope::Global => Scope::GlobalOnly,
        }
    }
}

impl Serialize for Scope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Scope::Mixed),
            1 => Ok(Scope::LocalOnly),
            2 => Ok(Scope::GlobalOnly),
            other => Err(serde::de::Error::custom(format!(
                "unknown metric scope {other}"
            ))),
        }
    }
}

/// The identity of a logical series: two metrics with the same key are the
/// same series and are folded into the same sampler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    /// The metric name.
    pub name: String,
    /// The sampler variant.
    #[serde(rename = "type")]
    pub kind: MetricKind,
    /// The comma-joined, insertion-ordered tag list.
    #[serde(rename = "joinedTags")]
    pub joined_tags: String,
}

impl MetricKey {
    /// Build a key from a name, kind, and ordered tag list.
    pub fn new(name: impl Into<String>, kind: MetricKind, tags: &[String]) -> Self {
        Self {
            name: name.into(),
            kind,
            joined_tags: tags.join(","),
        }
    }

    /// Build a key from an incoming wire metric. None if the metric carries
    /// an unknown type.
    pub fn from_proto(metric: &proto::Metric) -> Option<Self> {
        let kind = proto::Type::try_from(metric.r#type).ok()?;
        Some(Self {
            name: metric.name.clone(),
            kind: MetricKind::from_proto(kind),
            joined_tags: metric.tags.join(","),
        })
    }

    /// The canonical string every hashing call site uses for this key.
    pub fn to_hash_string(&self) -> String {
        format!("{}|{}|{}", self.name, self.kind.as_str(), self.joined_tags)
    }
}

/// The sinks a metric should be restricted to. `None` means every sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteInformation(Option<HashSet<String>>);

impl RouteInformation {
    /// Extract route directives from a tag list. Tags without the directive
    /// prefix contribute nothing; no directives at all means "every sink".
    pub fn from_tags(tags: &[String]) -> Self {
        let mut routes: Option<HashSet<String>> = None;
        for tag in tags {
            if let Some(sink) = tag.strip_prefix(SINK_PREFIX) {
                routes.get_or_insert_with(HashSet::new).insert(sink.to_string());
            }
        }
        RouteInformation(routes)
    }

    /// Whether the named sink should receive this metric.
    pub fn route_to(&self, name: &str) -> bool {
        match &self.0 {
            None => true,
            Some(routes) => routes.contains(name),
        }
    }
}

/// A completed metric, ready for sinks. The boundary between aggregation
/// and everything downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct InterMetric {
    /// The fully-qualified name, including any aggregate suffix.
    pub name: String,
    /// Unix seconds at flush time.
    pub timestamp: i64,
    /// The flushed value.
    pub value: f64,
    /// The tags of the originating series, copied per emission.
    pub tags: Vec<String>,
    /// Counter or gauge semantics for downstream storage.
    pub metric_type: MetricType,
    /// Which sinks should receive this metric.
    pub sinks: RouteInformation,
}

bitflags::bitflags! {
    /// The summary statistics a histogram emits on flush.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Aggregate: u32 {
        /// Smallest locally-observed sample.
        const MIN = 1 << 0;
        /// Largest locally-observed sample.
        const MAX = 1 << 1;
        /// The t-digest's 50th percentile.
        const MEDIAN = 1 << 2;
        /// Weighted mean of local samples.
        const AVERAGE = 1 << 3;
        /// Total local sample weight.
        const COUNT = 1 << 4;
        /// Weighted sum of local samples.
        const SUM = 1 << 5;
        /// Weighted harmonic mean of local samples.
        const HARMONIC_MEAN = 1 << 6;
    }
}

impl Aggregate {
    /// Look up a single aggregate by its configuration name.
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name {
            "min" => Some(Aggregate::MIN),
            "max" => Some(Aggregate::MAX),
            "median" => Some(Aggregate::MEDIAN),
            "avg" => Some(Aggregate::AVERAGE),
            "count" => Some(Aggregate::COUNT),
            "sum" => Some(Aggregate::SUM),
            "hmean" => Some(Aggregate::HARMONIC_MEAN),
            _ => None,
        }
    }
}

/// An aggregate bitmask plus the number of set bits, so flush paths can
/// size their output without re-counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramAggregates {
    /// Which aggregates to emit.
    pub value: Aggregate,
    /// How many bits are set in `value`.
    pub count: usize,
}

impl From<Aggregate> for HistogramAggregates {
    fn from(value: Aggregate) -> Self {
        Self {
            value,
            count: value.bits().count_ones() as usize,
        }
    }
}

impl Default for HistogramAggregates {
    fn default() -> Self {
        (Aggregate::MIN | Aggregate::MAX | Aggregate::COUNT).into()
    }
}

/// A metric with its serialized sampler state, for sending aggregation
/// state from one instance to another over the JSON surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonMetric {
    /// The series identity.
    #[serde(rename = "metricKey")]
    pub key: MetricKey,
    /// The originating tag list.
    pub tags: Vec<String>,
    /// The sampler's self-contained serialized state. Counter and gauge are
    /// 8 little-endian bytes, set is a hyperloglog register file, and
    /// histogram is an encoded [`HistoValue`].
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    /// Where the metric should be aggregated.
    pub scope: Scope,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// A single parsed sample on its way to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// The series identity.
    pub key: MetricKey,
    /// The precomputed shard hash of the key, so hot ingest paths don't
    /// rehash per sample.
    pub digest: u32,
    /// The observed value.
    pub value: MetricValue,
    /// The client-side sampling rate; a rate of 0.25 means each sample
    /// stands for 4.
    pub sample_rate: f32,
    /// The tag list, insertion-ordered.
    pub tags: Vec<String>,
    /// Where this metric should be aggregated.
    pub scope: Scope,
}

impl Metric {
    /// Build a sample with its digest precomputed, at rate 1.0 and mixed
    /// scope.
    pub fn new(
        name: impl Into<String>,
        kind: MetricKind,
        tags: Vec<String>,
        value: MetricValue,
    ) -> Self {
        let key = MetricKey::new(name, kind, &tags);
        let digest = crate::shard::key_digest(&key);
        Self {
            key,
            digest,
            value,
            sample_rate: 1.0,
            tags,
            scope: Scope::Mixed,
        }
    }

    /// Override the sample rate.
    pub fn with_sample_rate(mut self, sample_rate: f32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Override the scope.
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }
}

/// The observed value of one sample. Sets observe strings; everything else
/// observes numbers.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// A numeric observation.
    Number(f64),
    /// A set member.
    Text(String),
}

impl MetricValue {
    /// The numeric view of this value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(value) => Some(*value),
            MetricValue::Text(_) => None,
        }
    }

    /// The set-member view of this value. Numbers are formatted.
    pub fn into_text(self) -> String {
        match self {
            MetricValue::Number(value) => value.to_string(),
            MetricValue::Text(text) => text,
        }
    }
}

/// Failures merging serialized peer state into a local sampler.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The payload was shorter than the fixed-width value it should hold.
    #[error("value payload is {got} bytes, expected {expected}")]
    Truncated {
        /// Bytes required.
        expected: usize,
        /// Bytes present.
        got: usize,
    },
    /// The hyperloglog state could not be decoded or merged.
    #[error(transparent)]
    Hll(#[from] hll::HllError),
    /// The histogram state was not a [`HistoValue`] nor a bare t-digest.
    #[error("could not decode histogram state: {0}")]
    HistogramDecode(#[from] bincode::error::DecodeError),
}

/// Failures serializing sampler state for export.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The histogram state could not be encoded.
    #[error("could not encode histogram state: {0}")]
    HistogramEncode(#[from] bincode::error::EncodeError),
}

pub(crate) fn route_info(tags: &[String]) -> RouteInformation {
    RouteInformation::from_tags(tags)
}

pub(crate) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("could not get system time")
        .as_secs() as i64
}
