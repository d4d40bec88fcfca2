use super::envelope;
use crate::{AppState, Result};
use axum::extract::{Path, State};
use axum::Json;
use serde_json::Value;
use sse::cluster::wire::RemoteResponse;
use sse::error::invalid_target;
use sse::message::{ConnectionQuery, Message};
use sse::qos::cluster_repository::RemoteDeleteBody;

/// POST `MessageRepository/{method}` against this node's repository.
pub async fn call(
    State(app_state): State<AppState>,
    Path(method): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<RemoteResponse>> {
    let repository = &app_state.repository;
    let response = match method.as_str() {
        "insert" => {
            let message: Message = serde_json::from_value(body)?;
            envelope(repository.insert(message)?)?
        }
        "select" => {
            let query: ConnectionQuery = serde_json::from_value(body)?;
            envelope(repository.select(&query))?
        }
        "list" => envelope(repository.list())?,
        "delete" => {
            let delete: RemoteDeleteBody = serde_json::from_value(body)?;
            envelope(repository.delete(&delete.id, delete.delivered_to))?
        }
        other => return Err(invalid_target(&format!("unknown repository method {other}")).into()),
    };
    Ok(Json(response))
}
