use super::envelope;
use crate::{AppState, Result};
use axum::extract::{Path, State};
use axum::Json;
use sse::cluster::wire::{RemoteDisconnectBody, RemoteResponse};
use sse::connection::ConnectionId;
use sse::error::invalid_target;

/// POST `RemoteConnectionService/{method}`
pub async fn disconnect(
    State(app_state): State<AppState>,
    Path(method): Path<String>,
    Json(body): Json<RemoteDisconnectBody>,
) -> Result<Json<RemoteResponse>> {
    let manager = &app_state.manager;
    let disconnected = match (method.as_str(), body) {
        (
            "disconnectByConnectionId",
            RemoteDisconnectBody {
                connection_id: Some(id),
                ..
            },
        ) => manager.disconnect_by_connection_id(ConnectionId::new(id)),
        (
            "disconnectByAccessToken",
            RemoteDisconnectBody {
                access_token: Some(access_token),
                ..
            },
        ) => manager.disconnect_by_access_token(&access_token),
        (
            "disconnectByUserId",
            RemoteDisconnectBody {
                user_id: Some(user_id),
                ..
            },
        ) => manager.disconnect_by_user_id(&user_id),
        (other, _) => {
            return Err(invalid_target(&format!("unsupported disconnect {other}")).into());
        }
    };
    Ok(Json(envelope(disconnected)?))
}
