// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! The node's HTTP surface: a Prometheus `/metrics` scrape endpoint and a
//! `/healthz` liveness probe. No admin or control-plane routes — the
//! announce loop is driven entirely by its own timers and inbound messages.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tracing::{info, warn};

use crate::monitoring::metrics::Metrics;

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let families = metrics.registry.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    match String::from_utf8(buf) {
        Ok(body) => (StatusCode::OK, body),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, String::new()),
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

/// Build the router. Exposed separately from [`serve`] so tests can drive it
/// without binding a socket.
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(metrics)
}

/// Bind `listen_addr` and serve the metrics/health router until the process
/// is killed. Errors are logged and the task exits; the announce loop keeps
/// running independently of this surface.
pub async fn serve(listen_addr: SocketAddr, metrics: Arc<Metrics>) {
    let app = router(metrics);
    info!(%listen_addr, "metrics/health HTTP server listening");
    match tokio::net::TcpListener::bind(listen_addr).await {
        Ok(listener) => {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(?e, "metrics/health HTTP server stopped");
            }
        }
        Err(e) => warn!(?e, %listen_addr, "failed to bind metrics/health HTTP server"),
    }
}
