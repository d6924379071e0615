//! The thin client side of the Forward service, shared by worker flush
//! paths and the proxy's per-destination fan-out.

use thiserror::Error;

use crate::proto;
use crate::proto::forward_client::ForwardClient;

/// Failures dialing or calling a forwarding destination.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The destination could not be dialed.
    #[error("could not connect to '{address}': {source}")]
    Connect {
        /// The destination address.
        address: String,
        /// The underlying transport error.
        source: tonic::transport::Error,
    },
    /// The SendMetrics call itself failed.
    #[error("SendMetrics failed: {0}")]
    Rpc(#[from] tonic::Status),
}

/// A connected Forward client.
#[derive(Debug, Clone)]
pub struct ForwardGrpcClient {
    client: ForwardClient<tonic::transport::Channel>,
}

impl ForwardGrpcClient {
    /// Dial a destination. Plain `host:port` addresses are dialed over
    /// cleartext h2c.
    pub async fn connect(address: &str) -> Result<Self, ClientError> {
        let endpoint = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let client = ForwardClient::connect(endpoint)
            .await
            .map_err(|source| ClientError::Connect {
                address: address.to_string(),
                source,
            })?;
        Ok(Self { client })
    }

    /// Send one batch of metrics.
    pub async fn send_metrics(&mut self, metrics: Vec<proto::Metric>) -> Result<(), ClientError> {
        self.client
            .send_metrics(proto::MetricList { metrics })
            .await?;
        Ok(())
    }
}
