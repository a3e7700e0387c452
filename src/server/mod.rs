//! Exposition Server
//!
//! Serves the registry in the Prometheus text format plus health checks.
//! Handlers only read a snapshot, so a slow or failing source never delays a
//! scrape.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::metrics::MetricRegistry;

/// Content type of the text exposition format
pub const EXPOSITION_CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

/// HTTP endpoint over a bound listener
pub struct ExpositionServer {
    listener: TcpListener,
    registry: Arc<MetricRegistry>,
}

impl ExpositionServer {
    /// Bind the listener. Binding eagerly surfaces port conflicts at startup.
    pub async fn bind(addr: SocketAddr, registry: Arc<MetricRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind metrics server on {}: {}", addr, e)))?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled, then wait for
    /// in-flight connections to finish.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!("Metrics server listening on {}", addr);

        let tracker = TaskTracker::new();

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        // Per-connection accept failures (e.g. EMFILE) are transient
                        warn!(error = %e, "Metrics server accept error");
                        continue;
                    }
                },
            };

            let registry = self.registry.clone();
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                let service = service_fn(move |req| {
                    let registry = registry.clone();
                    async move { Ok::<_, Infallible>(route(&registry, &req)) }
                });

                let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                tokio::pin!(conn);

                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = shutdown.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };

                if let Err(e) = result {
                    debug!(%peer, error = %e, "Metrics server connection error");
                }
            });
        }

        drop(self.listener);
        tracker.close();
        tracker.wait().await;

        info!("Metrics server stopped");
        Ok(())
    }
}

/// Map a request onto a response
pub fn route<B>(registry: &MetricRegistry, req: &Request<B>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" => metrics(registry),
        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

fn metrics(registry: &MetricRegistry) -> Response<Full<Bytes>> {
    match registry.snapshot() {
        Ok(snapshot) => {
            let mut response = Response::new(Full::new(Bytes::from(
                snapshot.exposition().to_owned(),
            )));
            response.headers_mut().insert(
                CONTENT_TYPE,
                hyper::header::HeaderValue::from_static(EXPOSITION_CONTENT_TYPE),
            );
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            text(StatusCode::INTERNAL_SERVER_ERROR, "failed to render metrics")
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
