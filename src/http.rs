//! HTTP control surface.
//!
//! A thin axum front over the router's control inbox: every handler
//! turns the request into a [`ControlRequest`] and waits on the reply
//! channel. Binds a TCP address, or a Unix socket when the configured
//! address is an absolute path.

use std::net::Ipv4Addr;

use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use crate::ipam::IpamError;
use crate::router::{ControlRequest, RouterHandle};

fn build_router(handle: RouterHandle) -> Router {
    Router::new()
        .route("/status", get(status_text))
        .route("/status-json", get(status_json))
        .route("/connect", post(connect))
        .route("/forget", post(forget))
        .route("/ip/{container}", post(allocate_ip).delete(free_ip))
        .route("/ip/{container}/{ip}", put(claim_ip))
        .route("/peer/{name}", delete(remove_peer))
        .with_state(handle)
}

/// Serve the control API until the process exits.
///
/// `addr` is `host:port`, or an absolute path for a Unix socket (any
/// stale socket file is removed first).
pub async fn serve(handle: RouterHandle, addr: String) -> std::io::Result<()> {
    let app = build_router(handle);
    if addr.starts_with('/') {
        let _ = std::fs::remove_file(&addr);
        let listener = tokio::net::UnixListener::bind(&addr)?;
        info!(%addr, "control API on unix socket");
        axum::serve(listener, app).await
    } else {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, "control API listening");
        axum::serve(listener, app).await
    }
}

fn unavailable() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "router unavailable").into_response()
}

fn ipam_error(e: IpamError) -> Response {
    let status = match e {
        IpamError::QuorumNotReached | IpamError::SpaceExhausted => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::BAD_REQUEST,
    };
    (status, e.to_string()).into_response()
}

async fn status_text(State(handle): State<RouterHandle>) -> Response {
    match handle.status().await {
        Ok(report) => report.to_string().into_response(),
        Err(_) => unavailable(),
    }
}

async fn status_json(State(handle): State<RouterHandle>) -> Response {
    match handle.status().await {
        Ok(report) => Json(report).into_response(),
        Err(_) => unavailable(),
    }
}

#[derive(Deserialize)]
struct PeerForm {
    peer: String,
}

async fn connect(State(handle): State<RouterHandle>, Form(form): Form<PeerForm>) -> Response {
    let (tx, rx) = tokio::sync::oneshot::channel();
    if handle.control(ControlRequest::Connect { peer: form.peer, reply: tx }).await.is_err() {
        return unavailable();
    }
    match rx.await {
        Ok(Ok(())) => StatusCode::OK.into_response(),
        Ok(Err(e)) => {
            (StatusCode::BAD_REQUEST, format!("invalid peer address: {}", e)).into_response()
        }
        Err(_) => unavailable(),
    }
}

async fn forget(State(handle): State<RouterHandle>, Form(form): Form<PeerForm>) -> Response {
    let (tx, rx) = tokio::sync::oneshot::channel();
    if handle.control(ControlRequest::Forget { peer: form.peer, reply: tx }).await.is_err() {
        return unavailable();
    }
    let _ = rx.await;
    StatusCode::OK.into_response()
}

async fn allocate_ip(
    State(handle): State<RouterHandle>,
    Path(container): Path<String>,
) -> Response {
    let (tx, rx) = tokio::sync::oneshot::channel();
    if handle.control(ControlRequest::Allocate { container, reply: tx }).await.is_err() {
        return unavailable();
    }
    match rx.await {
        Ok(Ok(ip)) => ip.to_string().into_response(),
        Ok(Err(e)) => ipam_error(e),
        Err(_) => unavailable(),
    }
}

async fn claim_ip(
    State(handle): State<RouterHandle>,
    Path((container, ip)): Path<(String, String)>,
) -> Response {
    let addr: Ipv4Addr = match ip.parse() {
        Ok(addr) => addr,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid ip address").into_response(),
    };
    let (tx, rx) = tokio::sync::oneshot::channel();
    if handle.control(ControlRequest::Claim { container, addr, reply: tx }).await.is_err() {
        return unavailable();
    }
    match rx.await {
        Ok(Ok(ip)) => ip.to_string().into_response(),
        Ok(Err(e)) => ipam_error(e),
        Err(_) => unavailable(),
    }
}

async fn free_ip(State(handle): State<RouterHandle>, Path(container): Path<String>) -> Response {
    let (tx, rx) = tokio::sync::oneshot::channel();
    if handle.control(ControlRequest::Free { container, reply: tx }).await.is_err() {
        return unavailable();
    }
    match rx.await {
        Ok(released) => {
            let lines: Vec<String> = released.iter().map(|a| a.to_string()).collect();
            lines.join("\n").into_response()
        }
        Err(_) => unavailable(),
    }
}

async fn remove_peer(State(handle): State<RouterHandle>, Path(name): Path<String>) -> Response {
    let (tx, rx) = tokio::sync::oneshot::channel();
    if handle.control(ControlRequest::RemovePeer { peer: name, reply: tx }).await.is_err() {
        return unavailable();
    }
    match rx.await {
        Ok(Ok(moved)) => format!("reassigned {} ranges", moved).into_response(),
        Ok(Err(e)) => (StatusCode::BAD_REQUEST, e).into_response(),
        Err(_) => unavailable(),
    }
}
