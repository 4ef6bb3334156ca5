// src/health/server.rs
//! HTTP surface for the health aggregator
//!
//! | Route                 | Response                                   |
//! |-----------------------|--------------------------------------------|
//! | `/health`             | 200, JSON [`HealthReport`]                 |
//! | `/health/{subsystem}` | 200 JSON, 404 for unknown names            |
//! | `/readiness`          | 200 `ready` / 503 `not ready`              |
//! | `/liveness`           | 200 `alive` / 503 `not alive`              |
//! | `/metrics`            | Prometheus text format                     |
//!
//! [`HealthReport`]: super::aggregator::HealthReport

use super::aggregator::HealthAggregator;
use crate::observability::render_metrics;
use crate::utils::errors::{OrchestratorError, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct HealthServer {
    aggregator: HealthAggregator,
}

impl HealthServer {
    pub fn new(aggregator: HealthAggregator) -> Self {
        Self { aggregator }
    }

    /// Bind `addr` and serve until `shutdown` fires
    pub async fn start(self: Arc<Self>, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            OrchestratorError::ConfigError(format!("failed to bind health server on {}: {}", addr, e))
        })?;

        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("Health server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Health server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                debug!("Accepted connection from {}", addr);

                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_request(req).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Connection error: {}", e);
                }
            });
        }
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        debug!("{} {}", req.method(), req.uri());

        if req.method() != Method::GET {
            return Ok(text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
        }

        let path = req.uri().path().trim_end_matches('/');
        let response = match path {
            "/health" => json(StatusCode::OK, &self.aggregator.check_health().await),
            "/readiness" => {
                if self.aggregator.readiness().await {
                    text(StatusCode::OK, "ready")
                } else {
                    text(StatusCode::SERVICE_UNAVAILABLE, "not ready")
                }
            }
            "/liveness" => {
                if self.aggregator.liveness() {
                    text(StatusCode::OK, "alive")
                } else {
                    text(StatusCode::SERVICE_UNAVAILABLE, "not alive")
                }
            }
            "/metrics" => {
                let mut response = text(StatusCode::OK, render_metrics());
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            _ => match path.strip_prefix("/health/") {
                Some(name) => match self.aggregator.check_subsystem(name) {
                    Ok(health) => json(StatusCode::OK, &health),
                    Err(e) => text(StatusCode::NOT_FOUND, e.to_string()),
                },
                None => text(StatusCode::NOT_FOUND, "not found"),
            },
        };

        Ok(response)
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
