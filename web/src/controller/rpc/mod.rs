//! Server side of the cluster RPC surface. Every handler answers for this
//! node only; peers do their own aggregation.

pub(crate) mod connection_query_controller;
pub(crate) mod message_repository_controller;
pub(crate) mod remote_connection_controller;
pub(crate) mod send_controller;

use serde::Serialize;
use sse::cluster::wire::RemoteResponse;

fn envelope<T: Serialize>(data: T) -> crate::Result<RemoteResponse> {
    Ok(RemoteResponse::new(serde_json::to_value(data)?))
}
