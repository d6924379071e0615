//! The seam between aggregation and everything downstream: sinks consume
//! finished [`InterMetric`]s, filtered by each metric's route directives.

use crate::samplers::InterMetric;

/// A named consumer of flushed metrics.
pub trait MetricSink: Send + Sync {
    /// The sink's name, matched against `veneursinkonly:` route directives.
    fn name(&self) -> &'static str;

    /// Take one flush interval's metrics. Must not block the flush loop
    /// for long.
    fn flush(&self, metrics: &[InterMetric]);
}

/// A sink that logs metrics and drops them. Useful as a smoke-test
/// destination and as the example sink implementation.
pub struct LoggingSink {
    log_level: log::Level,
}

impl Default for LoggingSink {
    fn default() -> Self {
        Self {
            log_level: log::Level::Info,
        }
    }
}

impl MetricSink for LoggingSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn flush(&self, metrics: &[InterMetric]) {
        for metric in metrics {
            log::log!(
                self.log_level,
                "flushed: {} {} @{} tags={:?}",
                metric.name,
                metric.value,
                metric.timestamp,
                metric.tags,
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::{LoggingSink, MetricSink};
    use crate::samplers::{InterMetric, MetricType, RouteInformation};

    #[test]
    fn logging_sink_accepts_metrics() {
        let sink = LoggingSink::default();
        sink.flush(&[InterMetric {
            name: "a.b.c".to_string(),
            timestamp: 0,
            value: 1.0,
            tags: Vec::new(),
            metric_type: MetricType::Counter,
            sinks: RouteInformation::default(),
        }]);
    }
}
