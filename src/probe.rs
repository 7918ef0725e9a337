use futures::future::BoxFuture;
use std::time::Duration;
use tokio::net::TcpStream;

/// Liveness check used to confirm that a running instance is reachable.
pub trait Probe: Send + Sync {
    fn probe<'a>(
        &'a self,
        address: &'a str,
        port: u16,
        timeout: Duration,
    ) -> BoxFuture<'a, bool>;
}

/// Succeeds if a TCP connection to `address:port` can be opened within the
/// timeout. The connection is dropped right away.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl Probe for TcpProbe {
    fn probe<'a>(
        &'a self,
        address: &'a str,
        port: u16,
        timeout: Duration,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let connect = TcpStream::connect((address, port));
            match tokio::time::timeout(timeout, connect).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    tracing::debug!("probe of {}:{} failed: {}", address, port, e);
                    false
                }
                Err(_) => {
                    tracing::debug!(
                        "probe of {}:{} timed out after {:?}",
                        address,
                        port,
                        timeout
                    );
                    false
                }
            }
        })
    }
}
