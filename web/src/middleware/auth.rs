use crate::{AppState, Error};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use log::*;
use sse::cluster::discovery::ServiceDiscovery;

/// Cluster RPC middleware: only peers presenting the cluster's Basic
/// credentials get through, everyone else gets 401 Unauthorized.
pub async fn require_peer(State(app_state): State<AppState>, request: Request, next: Next) -> Response {
    let principal = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| app_state.discovery.login(value));
    match principal {
        Some(principal) => {
            trace!("Peer RPC {} from {}", request.uri().path(), principal.account);
            next.run(request).await
        }
        None => {
            debug!("Rejected unauthenticated peer RPC {}", request.uri().path());
            Error::Unauthorized.into_response()
        }
    }
}
