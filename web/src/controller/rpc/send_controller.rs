use super::envelope;
use crate::{AppState, Result};
use axum::extract::{Path, State};
use axum::Json;
use log::*;
use sse::cluster::wire::{decode_send, RemoteResponse, RemoteSendBody};
use sse::connection::ConnectionDto;

/// POST `SendService/{method}`: sends to this node's connections. With
/// `collect` the receivers are returned, otherwise their count.
pub async fn send(
    State(app_state): State<AppState>,
    Path(method): Path<String>,
    Json(body): Json<RemoteSendBody>,
) -> Result<Json<RemoteResponse>> {
    let collect = body.collect;
    let request = decode_send(&method, body)?;
    let receivers = app_state.manager.dispatch_collect(&request);
    trace!(
        "Peer send {method} of {} reached {} connections",
        request.event_name,
        receivers.len()
    );
    let response = if collect {
        let dtos: Vec<ConnectionDto> = receivers.iter().map(|c| c.to_dto()).collect();
        envelope(dtos)?
    } else {
        envelope(receivers.len())?
    };
    Ok(Json(response))
}
