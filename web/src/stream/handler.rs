use crate::params::connection::ConnectParams;
use crate::{AppState, Error};
use async_stream::stream;
use axum::extract::{Query, State};
use axum::http::{header::USER_AGENT, HeaderMap};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use log::*;
use sse::access_user::AccessUser;
use sse::connection::{ConnectRequest, Connection};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Opens a push stream. The connection is registered right away; it becomes
/// writeable on the first poll of the response body and is disconnected when
/// the body is dropped.
pub(crate) async fn connect(
    State(app_state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Error> {
    debug!(
        "Establishing push stream for user {} (channel {:?})",
        params.user_id, params.channel
    );

    let mut access_user = AccessUser::new(params.user_id.clone(), params.access_token.clone());
    if let Some(tenant_id) = &params.tenant_id {
        access_user = access_user.with_tenant(tenant_id.clone());
    }
    let keepalive = params
        .keepalive_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| app_state.config.keepalive());
    let mut request = ConnectRequest::new(access_user)
        .listeners(params.listener_names())
        .keepalive(keepalive);
    request.channel = params.channel.clone();
    request.user_agent = header_value(&headers, USER_AGENT.as_str());
    request.client_ip = header_value(&headers, "x-forwarded-for")
        .and_then(|forwarded| forwarded.split(',').next().map(|ip| ip.trim().to_string()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let connection = app_state.manager.connect(request, tx)?;
    let guard = DisconnectOnDrop(Arc::clone(&connection));

    // Events arrive from the channel until the connection is disconnected,
    // which drops its sender.
    let stream = stream! {
        let _guard = guard;
        if let Err(e) = connection.writeable_ready() {
            warn!("Connection {} failed to flush buffered events: {e}", connection.id());
        }
        while let Some(event) = rx.recv().await {
            yield Ok::<Event, Infallible>(Event::from(event));
        }
        debug!("Push stream for connection {} ended", connection.id());
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Disconnects when the response body goes away, i.e. the client left.
struct DisconnectOnDrop(Arc<Connection>);

impl Drop for DisconnectOnDrop {
    fn drop(&mut self) {
        if self.0.disconnect() {
            debug!("Client left, connection {} disconnected", self.0.id());
        }
    }
}
