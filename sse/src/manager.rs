use crate::connection::{ConnectRequest, Connection, ConnectionId};
use crate::error::Result;
use crate::event::{PushEvent, CONNECT_FINISH};
use crate::message::{Audience, Filters};
use crate::registry::ConnectionRegistry;
use crate::send::{SendRequest, SendService, WriteScope};
use async_trait::async_trait;
use log::*;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

pub const DEFAULT_RECONNECT_TIME: Duration = Duration::from_millis(5000);

/// The local (single node) connection service: opens connections and
/// dispatches sends to the ones this node holds.
pub struct Manager {
    registry: Arc<ConnectionRegistry>,
    reconnect_time: Duration,
    server_name: String,
}

impl Manager {
    pub fn new() -> Self {
        Self::with_registry(Arc::new(ConnectionRegistry::new()))
    }

    pub fn with_registry(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            reconnect_time: DEFAULT_RECONNECT_TIME,
            server_name: "sse-server".to_string(),
        }
    }

    pub fn reconnect_time(mut self, reconnect_time: Duration) -> Self {
        self.reconnect_time = reconnect_time;
        self
    }

    pub fn server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Registers a new connection and queues its `connect-finish` event.
    pub fn connect(
        &self,
        request: ConnectRequest,
        sender: UnboundedSender<PushEvent>,
    ) -> Result<Arc<Connection>> {
        let connection = self.registry.register(request, sender)?;
        let finish = PushEvent::new(
            CONNECT_FINISH,
            json!({
                "connectionId": connection.id(),
                "serverTime": chrono::Utc::now().timestamp_millis(),
                "reconnectTime": self.reconnect_time.as_millis() as u64,
                "name": self.server_name,
                "version": env!("CARGO_PKG_VERSION"),
            }),
        )
        .with_id(connection.id().to_string())
        .with_retry(self.reconnect_time);
        connection.send(finish)?;
        info!(
            "Opened connection {} for user {}",
            connection.id(),
            connection.user_id()
        );
        Ok(connection)
    }

    pub fn disconnect_by_connection_id(&self, id: ConnectionId) -> usize {
        match self.registry.get(id) {
            Some(connection) if connection.disconnect() => 1,
            _ => 0,
        }
    }

    pub fn disconnect_by_access_token(&self, access_token: &str) -> usize {
        disconnect_all(self.registry.lookup_by_access_token(access_token))
    }

    pub fn disconnect_by_user_id(&self, user_id: &str) -> usize {
        disconnect_all(self.registry.lookup_by_user_id(user_id))
    }

    /// Connections an audience currently resolves to, ordered by id.
    pub fn resolve(&self, audience: &Audience) -> Vec<Arc<Connection>> {
        let filters = audience.filters;
        let candidates: Vec<Arc<Connection>> = if filters.contains(Filters::ACCESS_TOKEN) {
            flat_lookup(&audience.access_tokens, |k| self.registry.lookup_by_access_token(k))
        } else if filters.contains(Filters::USER_ID) {
            flat_lookup(&audience.user_ids, |k| self.registry.lookup_by_user_id(k))
        } else if filters.contains(Filters::TENANT) {
            flat_lookup(&audience.tenant_ids, |k| self.registry.lookup_by_tenant_id(k))
        } else if filters.contains(Filters::CHANNEL) {
            flat_lookup(&audience.channels, |k| self.registry.lookup_by_channel(k))
        } else {
            self.registry.all()
        };

        let mut seen = HashSet::new();
        let mut targets: Vec<Arc<Connection>> = candidates
            .into_iter()
            .filter(|c| seen.insert(c.id()))
            .filter(|c| audience.matches(c.as_ref()))
            .collect();
        targets.sort_by_key(|c| c.id());
        targets
    }

    /// Writes the request to every resolved connection and returns the ones
    /// that accepted it. A connection whose write fails is disconnected.
    pub fn dispatch_collect(&self, request: &SendRequest) -> Vec<Arc<Connection>> {
        let event = PushEvent::new(request.event_name.clone(), request.body.clone());
        self.resolve(&request.audience)
            .into_iter()
            .filter(|connection| {
                if request.scope == WriteScope::WriteableOnly && !connection.is_writeable() {
                    return false;
                }
                match connection.send(event.clone()) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            "Failed to send {} to connection {}: {e}. Disconnecting.",
                            request.event_name,
                            connection.id()
                        );
                        connection.disconnect();
                        false
                    }
                }
            })
            .collect()
    }

    pub fn shutdown(&self) -> usize {
        self.registry.shutdown()
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SendService for Manager {
    type Output = usize;

    async fn dispatch(&self, request: SendRequest) -> usize {
        self.dispatch_collect(&request).len()
    }
}

fn flat_lookup<F>(keys: &[String], lookup: F) -> Vec<Arc<Connection>>
where
    F: Fn(&str) -> Vec<Arc<Connection>>,
{
    keys.iter().flat_map(|key| lookup(key)).collect()
}

fn disconnect_all(connections: Vec<Arc<Connection>>) -> usize {
    connections.into_iter().filter(|c| c.disconnect()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_user::AccessUser;
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn open(manager: &Manager, user: &str, token: &str) -> (Arc<Connection>, mpsc::UnboundedReceiver<PushEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let request = ConnectRequest::new(AccessUser::new(user, token));
        (manager.connect(request, tx).unwrap(), rx)
    }

    #[tokio::test]
    async fn send_by_user_id_counts_live_connections() {
        let manager = Manager::new();
        let (first, _a) = open(&manager, "U1", "T1");
        let (_second, _b) = open(&manager, "U1", "T2");
        assert_eq!(first.id().value(), 1);

        assert_eq!(manager.send_by_user_id(vec!["U1".into()], "e", json!("b")).await, 2);
        assert_eq!(manager.disconnect_by_connection_id(first.id()), 1);
        assert_eq!(manager.send_by_user_id(vec!["U1".into()], "e", json!("b")).await, 1);
    }

    #[tokio::test]
    async fn connect_finish_is_the_first_frame() {
        let manager = Manager::new().reconnect_time(Duration::from_millis(3000));
        let (conn, mut rx) = open(&manager, "u1", "t1");
        conn.writeable_ready().unwrap();
        let finish = rx.recv().await.unwrap();
        assert_eq!(finish.name.as_deref(), Some(CONNECT_FINISH));
        assert_eq!(finish.retry, Some(3000));
        assert_eq!(finish.data["connectionId"], json!(conn.id().value()));
        assert_eq!(finish.data["reconnectTime"], json!(3000));
    }

    #[tokio::test]
    async fn failed_write_disconnects_only_that_connection() {
        let manager = Manager::new();
        let (broken, broken_rx) = open(&manager, "u1", "t1");
        let (healthy, mut healthy_rx) = open(&manager, "u2", "t2");
        broken.writeable_ready().unwrap();
        healthy.writeable_ready().unwrap();
        drop(broken_rx);

        assert_eq!(manager.send_all("news", json!({"n": 1})).await, 1);
        assert!(broken.is_disconnected());
        assert!(!healthy.is_disconnected());
        assert_eq!(manager.registry().connection_count(), 1);

        let _finish = healthy_rx.recv().await.unwrap();
        assert_eq!(healthy_rx.recv().await.unwrap().name.as_deref(), Some("news"));
    }

    #[tokio::test]
    async fn listening_variants_require_interest() {
        let manager = Manager::new();
        let (conn, _rx) = open(&manager, "u1", "t1");
        let (_other, _rx2) = open(&manager, "u2", "t2");
        manager.registry().add_listening(conn.id(), &["chat".to_string()]);

        assert_eq!(manager.send_all_listening("chat", Value::Null).await, 1);
        assert_eq!(
            manager
                .send_by_access_token_listening(vec!["t2".into()], "chat", Value::Null)
                .await,
            0
        );
        assert_eq!(manager.send_by_access_token(vec!["t2".into(), "t1".into()], "x", Value::Null).await, 2);
    }

    #[tokio::test]
    async fn tenant_and_channel_targeting() {
        let manager = Manager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let request = ConnectRequest::new(AccessUser::new("u1", "t1").with_tenant("acme")).channel("room");
        manager.connect(request, tx).unwrap();
        let (_plain, _rx2) = open(&manager, "u2", "t2");

        assert_eq!(manager.send_by_tenant_id(vec!["acme".into()], "e", Value::Null).await, 1);
        assert_eq!(manager.send_by_channel(vec!["room".into()], "e", Value::Null).await, 1);
        assert_eq!(manager.send_by_channel_listening(vec!["room".into()], "e", Value::Null).await, 0);
        assert_eq!(manager.send_by_tenant_id_listening(vec!["acme".into()], "e", Value::Null).await, 0);
        assert_eq!(manager.send_by_user_id_listening(vec!["u1".into()], "e", Value::Null).await, 0);
    }

    #[tokio::test]
    async fn writeable_only_scope_skips_buffering_connections() {
        let manager = Manager::new();
        let (ready, _a) = open(&manager, "u1", "t1");
        let (_pending, _b) = open(&manager, "u1", "t2");
        ready.writeable_ready().unwrap();

        let request = SendRequest::new(Audience::user_ids(vec!["u1".into()]), "e", Value::Null)
            .scoped(WriteScope::WriteableOnly);
        assert_eq!(manager.dispatch(request).await, 1);
    }

    #[test]
    fn disconnect_by_token_and_user() {
        let manager = Manager::new();
        let (_a, _ra) = open(&manager, "u1", "t1");
        let (_b, _rb) = open(&manager, "u1", "t1");
        let (_c, _rc) = open(&manager, "u2", "t2");
        assert_eq!(manager.disconnect_by_access_token("t1"), 2);
        assert_eq!(manager.disconnect_by_access_token("t1"), 0);
        assert_eq!(manager.disconnect_by_user_id("u2"), 1);
        assert_eq!(manager.disconnect_by_connection_id(ConnectionId::new(42)), 0);
    }
}
