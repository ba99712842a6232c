//! Metrics and health endpoint
//!
//! - `GET /metrics`: controller metrics, Prometheus text format
//! - `GET /healthz`: `ok`

use crate::apis::metrics::gather_controller_metrics;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// HTTP server for the observability endpoints
pub struct MetricsServer {
    listener: TcpListener,
}

impl MetricsServer {
    /// Bind now so a port conflict fails startup
    pub async fn bind(addr: &str) -> Result<Self, String> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| format!("Failed to bind metrics server to {}: {}", addr, e))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, String> {
        self.listener
            .local_addr()
            .map_err(|e| format!("Failed to read metrics server address: {}", e))
    }

    /// Accept connections until the task is dropped
    pub async fn serve(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Metrics server listening on {}", addr);
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted metrics connection from {}", peer_addr);

                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                            Ok::<_, hyper::Error>(handle_request(&req))
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!("Metrics connection error: {}", e);
                        }
                    });
                }
                Err(e) => error!("Metrics accept error: {}", e),
            }
        }
    }
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn handle_request<B>(req: &Request<B>) -> Response<Full<Bytes>> {
    if *req.method() != Method::GET {
        return text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain",
            "method not allowed\n".to_string(),
        );
    }

    match req.uri().path() {
        "/metrics" => match gather_controller_metrics() {
            Ok(body) => text_response(
                StatusCode::OK,
                "text/plain; version=0.0.4",
                body,
            ),
            Err(e) => {
                error!("{}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e)
            }
        },
        "/healthz" => text_response(StatusCode::OK, "text/plain", "ok".to_string()),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "not found\n".to_string()),
    }
}
