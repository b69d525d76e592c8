//! Metrics HTTP Endpoint
//!
//! Serves the store's Prometheus metrics and a JSON capacity report on a
//! separate port:
//!
//! - `/metrics`: Prometheus text format
//! - `/capacity`: [`StoreMeta`](crate::store::StoreMeta) as JSON
//! - `/health`: liveness probe

use crate::error::Result;
use crate::store::TieredBlockStore;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics endpoint server
pub struct MetricsEndpoint {
    store: Arc<TieredBlockStore>,
    addr: SocketAddr,
}

impl MetricsEndpoint {
    /// Create a new metrics endpoint
    ///
    /// # Example
    /// ```no_run
    /// use tiered_blockstore::config::StoreConfig;
    /// use tiered_blockstore::evictor::GreedyEvictor;
    /// use tiered_blockstore::metrics_endpoint::MetricsEndpoint;
    /// use tiered_blockstore::store::TieredBlockStore;
    /// use std::sync::Arc;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = StoreConfig::from_file("tiered_blockstore.yaml")?;
    /// let store = Arc::new(TieredBlockStore::from_config(&config, Arc::new(GreedyEvictor))?);
    /// let endpoint = MetricsEndpoint::new(store, "127.0.0.1:9091".parse()?);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(store: Arc<TieredBlockStore>, addr: SocketAddr) -> Self {
        Self { store, addr }
    }

    /// Bind the configured address and serve until the task is dropped
    pub async fn start(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("Metrics endpoint listening on http://{}", addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let store = Arc::clone(&self.store);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let store = Arc::clone(&store);
                    async move { handle_request(req, store).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection: {:?}", err);
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    store: Arc<TieredBlockStore>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.uri().path(), &store))
}

/// Build the response for `path`
pub fn route(path: &str, store: &TieredBlockStore) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => metrics_response(store),
        "/capacity" => capacity_response(store),
        "/health" => text_response(StatusCode::OK, "OK"),
        "/" => index_response(),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn metrics_response(store: &TieredBlockStore) -> Response<Full<Bytes>> {
    match store.encode_metrics() {
        Ok(body) => response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            body,
        ),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
        }
    }
}

fn capacity_response(store: &TieredBlockStore) -> Response<Full<Bytes>> {
    match serde_json::to_string_pretty(&store.store_meta()) {
        Ok(body) => response(StatusCode::OK, "application/json", body),
        Err(e) => {
            error!("Failed to serialize capacity report: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "capacity unavailable")
        }
    }
}

fn index_response() -> Response<Full<Bytes>> {
    let html = r#"<!DOCTYPE html>
<html>
<head>
    <title>Tiered Block Store</title>
</head>
<body>
    <h1>Tiered Block Store</h1>
    <ul>
        <li><a href="/metrics">/metrics</a> - Prometheus metrics</li>
        <li><a href="/capacity">/capacity</a> - Capacity by tier and directory</li>
        <li><a href="/health">/health</a> - Health check</li>
    </ul>
</body>
</html>"#;
    response(StatusCode::OK, "text/html; charset=utf-8", html.to_string())
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    response(status, "text/plain; charset=utf-8", body.to_string())
}

fn response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::test_support::hierarchy;
    use crate::allocator::AllocatorKind;
    use crate::config::RetryConfig;
    use crate::evictor::NoopEvictor;

    fn store() -> TieredBlockStore {
        TieredBlockStore::new(
            hierarchy(&[("MEM", 0, &[1000]), ("SSD", 1, &[2000])]),
            AllocatorKind::MaxFree,
            Arc::new(NoopEvictor),
            RetryConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_routes() {
        let store = store();
        assert_eq!(route("/health", &store).status(), StatusCode::OK);
        assert_eq!(route("/", &store).status(), StatusCode::OK);
        assert_eq!(route("/nope", &store).status(), StatusCode::NOT_FOUND);

        let metrics = route("/metrics", &store);
        assert_eq!(metrics.status(), StatusCode::OK);
        assert_eq!(
            metrics.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );

        let capacity = route("/capacity", &store);
        assert_eq!(
            capacity.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
