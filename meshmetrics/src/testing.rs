//! In-process Forward servers and batch builders for exercising the
//! fan-out paths in tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};

use crate::proto;
use crate::proto::forward_server::{Forward, ForwardServer};

/// A real Forward server on an ephemeral local port that records every
/// metric it receives. Shuts down when dropped.
pub(crate) struct ForwardTestServer {
    address: SocketAddr,
    received: Arc<Mutex<Vec<proto::Metric>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ForwardTestServer {
    pub(crate) async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("could not bind a local listener");
        let address = listener
            .local_addr()
            .expect("a bound listener has an address");
        let received = Arc::new(Mutex::new(Vec::new()));
        let (shutdown, on_shutdown) = oneshot::channel();

        let service = CapturingForward {
            received: Arc::clone(&received),
        };
        tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(ForwardServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = on_shutdown.await;
                })
                .await;
        });

        Self {
            address,
            received,
            shutdown: Some(shutdown),
        }
    }

    pub(crate) fn address(&self) -> String {
        self.address.to_string()
    }

    pub(crate) fn received(&self) -> Vec<proto::Metric> {
        self.received.lock().expect("capture lock poisoned").clone()
    }
}

impl Drop for ForwardTestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

struct CapturingForward {
    received: Arc<Mutex<Vec<proto::Metric>>>,
}

#[tonic::async_trait]
impl Forward for CapturingForward {
    async fn send_metrics(
        &self,
        request: Request<proto::MetricList>,
    ) -> Result<Response<proto::Empty>, Status> {
        self.received
            .lock()
            .expect("capture lock poisoned")
            .extend(request.into_inner().metrics);
        Ok(Response::new(proto::Empty {}))
    }
}

/// A randomly-named counter metric, for fan-out tests that want an even
/// spread of identities.
pub(crate) fn random_forward_metric() -> proto::Metric {
    let mut rng = rand::thread_rng();
    proto::Metric {
        name: rng.gen::<u64>().to_string(),
        r#type: proto::Type::Counter as i32,
        tags: vec![rng.gen::<u64>().to_string()],
        scope: proto::Scope::Mixed as i32,
        value: Some(proto::metric::Value::Counter(proto::CounterValue {
            value: rng.gen(),
        })),
    }
}

/// Exactly `n` random counter metrics.
pub(crate) fn random_forward_metrics(n: usize) -> Vec<proto::Metric> {
    (0..n).map(|_| random_forward_metric()).collect()
}
