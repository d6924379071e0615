use bytes::{Buf, BufMut};

use crate::proto;

use super::{
    route_info, unix_timestamp, InterMetric, JsonMetric, MergeError, MetricKey, MetricKind,
    MetricType, Scope,
};

/// A last-write-wins gauge.
#[derive(Debug, Clone)]
pub struct Gauge {
    name: String,
    tags: Vec<String>,
    value: f64,
}

impl Gauge {
    /// Create a gauge at zero.
    pub fn new(name: impl Into<String>, tags: &[String]) -> Self {
        Self {
            name: name.into(),
            tags: tags.to_vec(),
            value: 0.0,
        }
    }

    /// Take on the sampled value. The sample rate is irrelevant for gauges.
    pub fn sample(&mut self, sample: f64, _sample_rate: f32) {
        self.value = sample;
    }

    /// Emit the last value as a single gauge metric.
    pub fn flush(&self) -> Vec<InterMetric> {
        let tags = self.tags.clone();
        vec![InterMetric {
            name: self.name.clone(),
            timestamp: unix_timestamp(),
            value: self.value,
            sinks: route_info(&tags),
            tags,
            metric_type: MetricType::Gauge,
        }]
    }

    /// Serialize as 8 little-endian bytes for the JSON surface.
    pub fn export(&self, scope: Scope) -> JsonMetric {
        let mut value: Vec<u8> = Vec::with_capacity(8);
        value.put_f64_le(self.value);
        JsonMetric {
            key: MetricKey::new(&self.name, MetricKind::Gauge, &self.tags),
            tags: self.tags.clone(),
            value,
            scope,
        }
    }

    /// Overwrite with a peer gauge's serialized state. Gauges are not
    /// mergeable; last writer wins.
    pub fn combine(&mut self, other: &[u8]) -> Result<(), MergeError> {
        if other.len() < 8 {
            return Err(MergeError::Truncated {
                expected: 8,
                got: other.len(),
            });
        }
        let mut buf = other;
        self.value = buf.get_f64_le();
        Ok(())
    }

    /// Overwrite with a peer gauge's wire value.
    pub fn merge_value(&mut self, value: f64) {
        self.value = value;
    }

    /// The wire representation of this gauge's state.
    pub fn to_metric(&self) -> proto::Metric {
        proto::Metric {
            name: self.name.clone(),
            r#type: proto::Type::Gauge as i32,
            tags: self.tags.clone(),
            scope: proto::Scope::Mixed as i32,
            value: Some(proto::metric::Value::Gauge(proto::GaugeValue {
                value: self.value,
            })),
        }
    }

    /// The metric name.
    pub fn name(&self) -> &str {
        &self.name
    }
}
