//! HTTP health server for Kubernetes probes.
//!
//! `/healthz` (liveness) always answers 200. `/readyz` (readiness)
//! answers 200 once a routing configuration has been applied and 503
//! before that.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::proxy::Router;

/// Handles one probe request.
pub async fn health_handler<B>(
    req: Request<B>,
    router: Arc<Router>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" => text(StatusCode::OK, "ok"),
        "/readyz" if router.is_ready() => text(StatusCode::OK, "ok"),
        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "no configuration"),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

/// Starts the HTTP health server on the given address.
///
/// Runs indefinitely, accepting connections and handling health requests.
pub async fn start_health_server(addr: SocketAddr, router: Arc<Router>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "health server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let router = Arc::clone(&router);

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(req, Arc::clone(&router)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "health connection error");
            }
        });
    }
}
