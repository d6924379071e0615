use bytes::{Buf, BufMut};

use crate::proto;

use super::{
    route_info, unix_timestamp, InterMetric, JsonMetric, MergeError, MetricKey, MetricKind,
    MetricType, Scope,
};

/// An accumulating counter. Sampled values are scaled up by the inverse of
/// the sample rate before accumulation.
#[derive(Debug, Clone)]
pub struct Counter {
    name: String,
    tags: Vec<String>,
    value: i64,
}

impl Counter {
    /// Create an empty counter.
    pub fn new(name: impl Into<String>, tags: &[String]) -> Self {
        Self {
            name: name.into(),
            tags: tags.to_vec(),
            value: 0,
        }
    }

    /// Add a sample, scaled by the inverse sample rate.
    pub fn sample(&mut self, sample: f64, sample_rate: f32) {
        self.value += (sample as i64) * ((1.0 / sample_rate) as i64);
    }

    /// Emit the accumulated count as a single counter metric.
    pub fn flush(&self) -> Vec<InterMetric> {
        let tags = self.tags.clone();
        vec![InterMetric {
            name: self.name.clone(),
            timestamp: unix_timestamp(),
            value: self.value as f64,
            sinks: route_info(&tags),
            tags,
            metric_type: MetricType::Counter,
        }]
    }

    /// Serialize as 8 little-endian bytes for the JSON surface.
    pub fn export(&self, scope: Scope) -> JsonMetric {
        let mut value: Vec<u8> = Vec::with_capacity(8);
        value.put_i64_le(self.value);
        JsonMetric {
            key: MetricKey::new(&self.name, MetricKind::Counter, &self.tags),
            tags: self.tags.clone(),
            value,
            scope,
        }
    }

    /// Add a peer counter's serialized state.
    pub fn combine(&mut self, other: &[u8]) -> Result<(), MergeError> {
        if other.len() < 8 {
            return Err(MergeError::Truncated {
                expected: 8,
                got: other.len(),
            });
        }
        let mut buf = other;
        self.value += buf.get_i64_le();
        Ok(())
    }

    /// Add a peer counter's wire value.
    pub fn merge_value(&mut self, value: i64) {
        self.value += value;
    }

    /// The wire representation of this counter's state.
    pub fn to_metric(&self) -> proto::Metric {
        proto::Metric {
            name: self.name.clone(),
            r#type: proto::Type::Counter as i32,
            tags: self.tags.clone(),
            scope: proto::Scope::Mixed as i32,
            value: Some(proto::metric::Value::Counter(proto::CounterValue {
                value: self.value,
            })),
        }
    }

    /// The metric name.
    pub fn name(&self) -> &str {
        &self.name
    }
}
