use crate::proto;

use super::hll::{HyperLogLog, DEFAULT_PRECISION};
use super::{
    route_info, unix_timestamp, InterMetric, JsonMetric, MergeError, MetricKey, MetricKind,
    MetricType, Scope,
};

/// A distinct-value counter backed by a hyperloglog sketch.
#[derive(Debug, Clone)]
pub struct Set {
    name: String,
    tags: Vec<String>,
    hll: HyperLogLog,
}

impl Set {
    /// Create an empty set at the fabric-wide precision.
    pub fn new(name: impl Into<String>, tags: &[String]) -> Self {
        Self {
            name: name.into(),
            tags: tags.to_vec(),
            hll: HyperLogLog::new(DEFAULT_PRECISION)
                .expect("the default precision is always in range"),
        }
    }

    /// Observe a member. Duplicate members do not move the estimate.
    pub fn sample(&mut self, sample: &str, _sample_rate: f32) {
        self.hll.insert(sample.as_bytes());
    }

    /// Emit the cardinality estimate as a single gauge metric.
    pub fn flush(&self) -> Vec<InterMetric> {
        let tags = self.tags.clone();
        vec![InterMetric {
            name: self.name.clone(),
            timestamp: unix_timestamp(),
            value: self.hll.estimate(),
            sinks: route_info(&tags),
            tags,
            metric_type: MetricType::Gauge,
        }]
    }

    /// Serialize the sketch for the JSON surface.
    pub fn export(&self, scope: Scope) -> JsonMetric {
        JsonMetric {
            key: MetricKey::new(&self.name, MetricKind::Set, &self.tags),
            tags: self.tags.clone(),
            value: self.hll.to_bytes(),
            scope,
        }
    }

    /// Merge a peer sketch's serialized state. Fails if the peer was built
    /// with a different precision.
    pub fn combine(&mut self, other: &[u8]) -> Result<(), MergeError> {
        let peer = HyperLogLog::from_bytes(other)?;
        self.hll.merge(&peer)?;
        Ok(())
    }

    /// The wire representation of this set's state.
    pub fn to_metric(&self) -> proto::Metric {
        proto::Metric {
            name: self.name.clone(),
            r#type: proto::Type::Set as i32,
            tags: self.tags.clone(),
            scope: proto::Scope::Mixed as i32,
            value: Some(proto::metric::Value::Set(proto::SetValue {
                hyperloglog: self.hll.to_bytes(),
            })),
        }
    }

    /// The metric name.
    pub fn name(&self) -> &str {
        &self.name
    }
}
