//! Resolution of a logical service name to forwarding destinations, and the
//! background task that keeps the consistent-hash ring in step with it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ring::{Ring, SharedRing};

/// Failures resolving a service name.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The resolver could not produce any addresses.
    #[error("could not resolve '{service}': {source}")]
    Resolution {
        /// The service name being resolved.
        service: String,
        /// The underlying resolver error.
        source: std::io::Error,
    },
}

/// Resolves a logical service name to a list of `host:port` destinations.
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// The current destinations for `service`.
    async fn get_destinations_for_service(
        &self,
        service: &str,
    ) -> Result<Vec<String>, DiscoveryError>;
}

/// A discoverer that resolves A/AAAA records for the service name and
/// appends a fixed port to each address.
#[derive(Debug, Clone)]
pub struct DnsDiscoverer {
    port: u16,
}

impl DnsDiscoverer {
    /// Create a discoverer that appends `port` to every resolved address.
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Discoverer for DnsDiscoverer {
    async fn get_destinations_for_service(
        &self,
        service: &str,
    ) -> Result<Vec<String>, DiscoveryError> {
        let addresses = tokio::net::lookup_host((service, self.port))
            .await
            .map_err(|source| DiscoveryError::Resolution {
                service: service.to_string(),
                source,
            })?;
        Ok(addresses.map(|address| address.to_string()).collect())
    }
}

/// Rebuild the shared ring from the discoverer on a fixed cadence. A failed
/// resolution keeps the previous ring in place; requests racing a refresh
/// keep using the snapshot they already hold.
pub async fn refresh_destinations_forever(
    discoverer: impl Discoverer,
    service: String,
    cadence: Duration,
    ring: Arc<SharedRing>,
) {
    let mut interval = tokio::time::interval(cadence);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        match discoverer.get_destinations_for_service(&service).await {
            Ok(destinations) => {
                log::debug!(
                    "rebuilding the forward ring with {} destinations",
                    destinations.len()
                );
                ring.publish(Ring::new(destinations));
            }
            Err(error) => {
                log::error!("keeping the previous forward ring: {error}");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{refresh_destinations_forever, Discoverer, DiscoveryError, DnsDiscoverer};
    use crate::ring::SharedRing;

    struct StaticDiscoverer {
        destinations: Vec<String>,
    }

    #[async_trait]
    impl Discoverer for StaticDiscoverer {
        async fn get_destinations_for_service(
            &self,
            _service: &str,
        ) -> Result<Vec<String>, DiscoveryError> {
            Ok(self.destinations.clone())
        }
    }

    struct FailingDiscoverer;

    #[async_trait]
    impl Discoverer for FailingDiscoverer {
        async fn get_destinations_for_service(
            &self,
            service: &str,
        ) -> Result<Vec<String>, DiscoveryError> {
            Err(DiscoveryError::Resolution {
                service: service.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no records"),
            })
        }
    }

    #[test_log::test(tokio::test)]
    async fn dns_discoverer_appends_the_port() {
        let discoverer = DnsDiscoverer::new(8128);
        let destinations = discoverer
            .get_destinations_for_service("localhost")
            .await
            .unwrap();
        assert!(!destinations.is_empty());
        for destination in destinations {
            assert!(destination.ends_with(":8128"), "got {destination}");
        }
    }

    #[test_log::test(tokio::test)]
    async fn refresh_publishes_new_rings() {
        let ring = Arc::new(SharedRing::default());
        tokio::spawn(refresh_destinations_forever(
            StaticDiscoverer {
                destinations: vec!["10.0.0.1:8128".to_string(), "10.0.0.2:8128".to_string()],
            },
            "metrics-global".to_string(),
            Duration::from_millis(5),
            Arc::clone(&ring),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(2, ring.snapshot().members().len());
    }

    #[test_log::test(tokio::test)]
    async fn failed_discovery_keeps_the_previous_ring() {
        let ring = Arc::new(SharedRing::new(crate::ring::Ring::new(vec![
            "10.0.0.1:8128".to_string(),
        ])));
        tokio::spawn(refresh_destinations_forever(
            FailingDiscoverer,
            "metrics-global".to_string(),
            Duration::from_millis(5),
            Arc::clone(&ring),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(1, ring.snapshot().members().len());
    }
}
