// Copyright (C) 2024, 2025 MVSPool Developers (see AUTHORS)
//
// This file is part of MVSPool
//
// MVSPool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// MVSPool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// MVSPool. If not, see <https://www.gnu.org/licenses/>.

use super::session::Session;
use super::{valid_login, valid_worker, ProxyServer};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Peer address extractor that degrades to `None` when the server runs
/// without connect-info (unit tests drive the router directly).
struct ClientIp(Option<SocketAddr>);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientIp(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

/// Routes of the HTTP work endpoint. Only POST is mapped, so other verbs get
/// 405 from the router.
pub fn router(server: Arc<ProxyServer>) -> Router {
    Router::new()
        .route("/{login}", post(handle_login_route))
        .route("/{login}/{worker}", post(handle_worker_route))
        .with_state(server)
}

/// Binds and serves the work endpoint until the shutdown signal fires.
pub async fn start_http_endpoint(
    server: Arc<ProxyServer>,
    shutdown_rx: oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listen = server.config.proxy.listen.clone();
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("HTTP work endpoint listening on {}", listen);

    let app = router(server);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
        info!("HTTP endpoint shutdown signal received");
    })
    .await?;
    Ok(())
}

async fn handle_login_route(
    State(server): State<Arc<ProxyServer>>,
    Path(login): Path<String>,
    client_ip: ClientIp,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve_work_request(server, login, None, client_ip, headers, body).await
}

async fn handle_worker_route(
    State(server): State<Arc<ProxyServer>>,
    Path((login, worker)): Path<(String, String)>,
    client_ip: ClientIp,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve_work_request(server, login, Some(worker), client_ip, headers, body).await
}

/// Request gating, in order: banned address, route shape, body size cap,
/// JSON-RPC decode, per-request id and login policy inside the dispatch.
async fn serve_work_request(
    server: Arc<ProxyServer>,
    login: String,
    worker: Option<String>,
    client_ip: ClientIp,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = remote_addr(&server, client_ip, &headers);
    if server.policy.is_banned(&ip) {
        return StatusCode::OK.into_response();
    }

    if !valid_login(&login) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if let Some(worker) = &worker {
        if !valid_worker(worker) {
            return StatusCode::NOT_FOUND.into_response();
        }
    }

    // The oversize body never reaches the JSON decoder.
    if body.len() > server.config.proxy.limit_body_size {
        warn!("socket flood from {}", ip);
        server.policy.apply_malformed_policy(&ip);
        return (StatusCode::EXPECTATION_FAILED, "Request too large").into_response();
    }

    let mut session = Session::new(ip.clone(), 0);
    session.login = Some(login);
    session.worker = worker.unwrap_or_default();

    // A body may carry several JSON-RPC documents back to back; each gets
    // its own reply line.
    let mut replies = Vec::new();
    let stream = serde_json::Deserializer::from_slice(&body).into_iter();
    for request in stream {
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed request from {}: {}", ip, e);
                server.policy.apply_malformed_policy(&ip);
                break;
            }
        };
        match server.handle_message(&mut session, &request).await {
            Some(response) => match serde_json::to_string(&response) {
                Ok(encoded) => replies.push(encoded),
                Err(e) => {
                    warn!("failed to encode response for {}: {}", ip, e);
                    break;
                }
            },
            // Missing id: charged to policy, no reply, stop reading.
            None => break,
        }
    }

    let mut body = replies.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn remote_addr(server: &ProxyServer, client_ip: ClientIp, headers: &HeaderMap) -> String {
    if server.config.proxy.behind_reverse_proxy {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
        {
            if forwarded.parse::<std::net::IpAddr>().is_ok() {
                return forwarded.to_string();
            }
        }
    }
    client_ip
        .0
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "0.0.0.0".to_string())
}
