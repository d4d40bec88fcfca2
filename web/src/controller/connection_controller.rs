use crate::controller::ApiResponse;
use crate::params::connection::{DisconnectParams, ListenersParams};
use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::*;
use sse::connection::ConnectionId;

/// POST add event names a connection listens for
pub async fn add_listeners(
    State(app_state): State<AppState>,
    Json(params): Json<ListenersParams>,
) -> Response {
    let id = ConnectionId::new(params.connection_id);
    if app_state
        .manager
        .registry()
        .add_listening(id, &params.listeners)
    {
        debug!("Connection {id} now listening for {:?}", params.listeners);
        Json(ApiResponse::new(StatusCode::OK.into(), params.listeners)).into_response()
    } else {
        (StatusCode::NOT_FOUND, "NOT FOUND").into_response()
    }
}

/// POST remove event names from a connection's listening set
pub async fn remove_listeners(
    State(app_state): State<AppState>,
    Json(params): Json<ListenersParams>,
) -> Response {
    let id = ConnectionId::new(params.connection_id);
    if app_state
        .manager
        .registry()
        .remove_listening(id, &params.listeners)
    {
        Json(ApiResponse::new(StatusCode::OK.into(), params.listeners)).into_response()
    } else {
        (StatusCode::NOT_FOUND, "NOT FOUND").into_response()
    }
}

/// POST disconnect a connection wherever in the cluster it lives
pub async fn disconnect(
    State(app_state): State<AppState>,
    Json(params): Json<DisconnectParams>,
) -> impl IntoResponse {
    let id = ConnectionId::new(params.connection_id);
    let disconnected = match &app_state.cluster {
        Some(cluster) => cluster.disconnect_by_connection_id(id).await,
        None => app_state.manager.disconnect_by_connection_id(id),
    };
    info!("Disconnect of connection {id} closed {disconnected} connections");
    Json(ApiResponse::new(StatusCode::OK.into(), disconnected))
}
