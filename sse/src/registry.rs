use crate::access_user::AccessUser;
use crate::connection::{
    ChangeEvent, ConnectRequest, Connection, ConnectionDto, ConnectionId, ConnectionIdGenerator,
};
use crate::error::{closed_error, Result};
use crate::event::PushEvent;
use dashmap::DashMap;
use log::*;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub type ConnectionListener = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
type ScopedCallback = Box<dyn FnOnce(&Arc<Connection>) + Send>;

struct ScopedListener {
    access_token: String,
    channel: Option<String>,
    callback: ScopedCallback,
}

impl ScopedListener {
    fn matches(&self, connection: &Connection) -> bool {
        self.access_token == connection.access_token()
            && match &self.channel {
                Some(channel) => connection.channel() == Some(channel.as_str()),
                None => true,
            }
    }
}

/// All live connections of this node.
///
/// The primary map and the four secondary indices are only mutated together
/// under `mutation`; lookups read the maps directly.
pub struct ConnectionRegistry {
    id_generator: ConnectionIdGenerator,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    access_token_index: DashMap<String, HashSet<ConnectionId>>,
    user_index: DashMap<String, HashSet<ConnectionId>>,
    tenant_index: DashMap<String, HashSet<ConnectionId>>,
    channel_index: DashMap<String, HashSet<ConnectionId>>,
    mutation: Mutex<()>,
    closed: AtomicBool,
    connect_listeners: RwLock<Vec<ConnectionListener>>,
    disconnect_listeners: RwLock<Vec<ConnectionListener>>,
    scoped_connect_listeners: Mutex<Vec<ScopedListener>>,
    scoped_disconnect_listeners: Mutex<Vec<ScopedListener>>,
    listening_watchers: RwLock<Vec<ChangeListener>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_id_generator(ConnectionIdGenerator::new())
    }

    pub fn with_id_generator(id_generator: ConnectionIdGenerator) -> Self {
        Self {
            id_generator,
            connections: DashMap::new(),
            access_token_index: DashMap::new(),
            user_index: DashMap::new(),
            tenant_index: DashMap::new(),
            channel_index: DashMap::new(),
            mutation: Mutex::new(()),
            closed: AtomicBool::new(false),
            connect_listeners: RwLock::new(Vec::new()),
            disconnect_listeners: RwLock::new(Vec::new()),
            scoped_connect_listeners: Mutex::new(Vec::new()),
            scoped_disconnect_listeners: Mutex::new(Vec::new()),
            listening_watchers: RwLock::new(Vec::new()),
        }
    }

    /// Creates a connection, inserts it into every index and hooks its
    /// lifecycle back into the registry.
    pub fn register(
        self: &Arc<Self>,
        request: ConnectRequest,
        sender: UnboundedSender<PushEvent>,
    ) -> Result<Arc<Connection>> {
        if self.is_closed() {
            return Err(closed_error("connection registry is shut down"));
        }
        let connection = Connection::new(self.id_generator.next_id(), request, sender);
        self.insert(&connection)?;

        let registry = Arc::downgrade(self);
        connection.add_disconnect_listener(move |connection| {
            if let Some(registry) = registry.upgrade() {
                registry.notify_disconnect(connection);
                registry.unregister(connection);
            }
        });
        let registry = Arc::downgrade(self);
        connection.add_connect_listener(move |connection| {
            if let Some(registry) = registry.upgrade() {
                registry.notify_connect(connection);
            }
        });
        connection.arm_keepalive();

        debug!(
            "Registered connection {} for user {}",
            connection.id(),
            connection.user_id()
        );
        Ok(connection)
    }

    fn insert(&self, connection: &Arc<Connection>) -> Result<()> {
        let _guard = self.mutation.lock();
        if self.is_closed() {
            return Err(closed_error("connection registry is shut down"));
        }
        let id = connection.id();
        self.connections.insert(id, Arc::clone(connection));
        index_insert(&self.access_token_index, connection.access_token(), id);
        index_insert(&self.user_index, connection.user_id(), id);
        if let Some(tenant_id) = connection.tenant_id() {
            index_insert(&self.tenant_index, tenant_id, id);
        }
        if let Some(channel) = connection.channel() {
            index_insert(&self.channel_index, channel, id);
        }
        Ok(())
    }

    /// Removes a connection from all five structures. Returns false if it was
    /// not registered.
    pub fn unregister(&self, connection: &Connection) -> bool {
        let _guard = self.mutation.lock();
        let id = connection.id();
        if self.connections.remove(&id).is_none() {
            return false;
        }
        index_remove(&self.access_token_index, connection.access_token(), id);
        index_remove(&self.user_index, connection.user_id(), id);
        if let Some(tenant_id) = connection.tenant_id() {
            index_remove(&self.tenant_index, tenant_id, id);
        }
        if let Some(channel) = connection.channel() {
            index_remove(&self.channel_index, channel, id);
        }
        true
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn lookup_by_access_token(&self, access_token: &str) -> Vec<Arc<Connection>> {
        self.lookup(&self.access_token_index, access_token)
    }

    pub fn lookup_by_user_id(&self, user_id: &str) -> Vec<Arc<Connection>> {
        self.lookup(&self.user_index, user_id)
    }

    pub fn lookup_by_tenant_id(&self, tenant_id: &str) -> Vec<Arc<Connection>> {
        self.lookup(&self.tenant_index, tenant_id)
    }

    pub fn lookup_by_channel(&self, channel: &str) -> Vec<Arc<Connection>> {
        self.lookup(&self.channel_index, channel)
    }

    fn lookup(&self, index: &DashMap<String, HashSet<ConnectionId>>, key: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<ConnectionId> = match index.get(key) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Vec::new(),
        };
        ids.into_iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_count(&self) -> usize {
        self.user_index.len()
    }

    pub fn access_token_count(&self) -> usize {
        self.access_token_index.len()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.user_index.contains_key(user_id)
    }

    pub fn get_user(&self, user_id: &str) -> Option<AccessUser> {
        self.lookup_by_user_id(user_id)
            .first()
            .map(|connection| connection.access_user().clone())
    }

    pub fn users(&self) -> Vec<AccessUser> {
        self.distinct_users(|_| true)
    }

    pub fn users_by_listening(&self, listener: &str) -> Vec<AccessUser> {
        self.distinct_users(|c| c.is_listening(listener))
    }

    pub fn users_by_tenant_listening(&self, tenant_id: &str, listener: &str) -> Vec<AccessUser> {
        self.distinct_users(|c| c.tenant_id() == Some(tenant_id) && c.is_listening(listener))
    }

    fn distinct_users<F>(&self, predicate: F) -> Vec<AccessUser>
    where
        F: Fn(&Connection) -> bool,
    {
        let mut seen = HashSet::new();
        let mut connections = self.all();
        connections.sort_by_key(|c| c.id());
        connections
            .into_iter()
            .filter(|c| predicate(c.as_ref()))
            .filter(|c| seen.insert(c.user_id().to_string()))
            .map(|c| c.access_user().clone())
            .collect()
    }

    pub fn user_ids(&self) -> Vec<String> {
        keys(&self.user_index)
    }

    pub fn user_ids_by_listening(&self, listener: &str) -> Vec<String> {
        self.users_by_listening(listener)
            .into_iter()
            .map(|user| user.id)
            .collect()
    }

    pub fn user_ids_by_tenant_listening(&self, tenant_id: &str, listener: &str) -> Vec<String> {
        self.users_by_tenant_listening(tenant_id, listener)
            .into_iter()
            .map(|user| user.id)
            .collect()
    }

    pub fn access_tokens(&self) -> Vec<String> {
        keys(&self.access_token_index)
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        keys(&self.tenant_index)
    }

    pub fn channels(&self) -> Vec<String> {
        keys(&self.channel_index)
    }

    pub fn connections(&self) -> Vec<ConnectionDto> {
        let mut connections: Vec<ConnectionDto> = self.all().iter().map(|c| c.to_dto()).collect();
        connections.sort_by_key(|c| c.id);
        connections
    }

    /// Fires for every connection once it becomes writeable.
    pub fn on_connect(&self, listener: ConnectionListener) {
        self.connect_listeners.write().push(listener);
    }

    pub fn on_disconnect(&self, listener: ConnectionListener) {
        self.disconnect_listeners.write().push(listener);
    }

    /// One-shot connect callback scoped to an access token and optionally a
    /// channel. Fires right away if a matching connection is already
    /// writeable, otherwise when the first one becomes writeable.
    pub fn on_connect_scoped<F>(&self, access_token: &str, channel: Option<&str>, callback: F)
    where
        F: FnOnce(&Arc<Connection>) + Send + 'static,
    {
        let listener = ScopedListener {
            access_token: access_token.to_string(),
            channel: channel.map(str::to_string),
            callback: Box::new(callback),
        };
        if let Some(connection) = self.writeable_match(&listener) {
            (listener.callback)(&connection);
            return;
        }
        let access_token = listener.access_token.clone();
        self.scoped_connect_listeners.lock().push(listener);
        // A match may have turned writeable before the push.
        for connection in self.lookup_by_access_token(&access_token) {
            if !connection.is_writeable() {
                continue;
            }
            for scoped in take_matching(&self.scoped_connect_listeners, &connection) {
                (scoped.callback)(&connection);
            }
        }
    }

    fn writeable_match(&self, listener: &ScopedListener) -> Option<Arc<Connection>> {
        self.lookup_by_access_token(&listener.access_token)
            .into_iter()
            .find(|c| c.is_writeable() && listener.matches(c))
    }

    pub fn on_disconnect_scoped<F>(&self, access_token: &str, channel: Option<&str>, callback: F)
    where
        F: FnOnce(&Arc<Connection>) + Send + 'static,
    {
        self.scoped_disconnect_listeners.lock().push(ScopedListener {
            access_token: access_token.to_string(),
            channel: channel.map(str::to_string),
            callback: Box::new(callback),
        });
    }

    pub fn on_listening_change(&self, watcher: ChangeListener) {
        self.listening_watchers.write().push(watcher);
    }

    /// Adds listening interest to a connection. Returns false if the connection
    /// is unknown.
    pub fn add_listening(&self, id: ConnectionId, listeners: &[String]) -> bool {
        match self.get(id) {
            Some(connection) => {
                if let Some(change) = connection.add_listeners(listeners) {
                    self.notify_listening_change(&change);
                }
                true
            }
            None => false,
        }
    }

    pub fn remove_listening(&self, id: ConnectionId, listeners: &[String]) -> bool {
        match self.get(id) {
            Some(connection) => {
                if let Some(change) = connection.remove_listeners(listeners) {
                    self.notify_listening_change(&change);
                }
                true
            }
            None => false,
        }
    }

    fn notify_connect(&self, connection: &Arc<Connection>) {
        let listeners = self.connect_listeners.read().clone();
        for listener in listeners {
            listener(connection);
        }
        for scoped in take_matching(&self.scoped_connect_listeners, connection) {
            (scoped.callback)(connection);
        }
    }

    fn notify_disconnect(&self, connection: &Arc<Connection>) {
        let listeners = self.disconnect_listeners.read().clone();
        for listener in listeners {
            listener(connection);
        }
        for scoped in take_matching(&self.scoped_disconnect_listeners, connection) {
            (scoped.callback)(connection);
        }
    }

    fn notify_listening_change(&self, change: &ChangeEvent) {
        let watchers = self.listening_watchers.read().clone();
        for watcher in watchers {
            watcher(change);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Rejects new registrations and disconnects everything that is live.
    /// Returns how many connections were closed.
    pub fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let closed = self
            .all()
            .into_iter()
            .filter(|connection| connection.disconnect())
            .count();
        info!("Connection registry shut down, {closed} connections closed");
        closed
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn index_insert(index: &DashMap<String, HashSet<ConnectionId>>, key: &str, id: ConnectionId) {
    index.entry(key.to_string()).or_default().insert(id);
}

fn index_remove(index: &DashMap<String, HashSet<ConnectionId>>, key: &str, id: ConnectionId) {
    if let Some(mut entry) = index.get_mut(key) {
        entry.remove(&id);
        if entry.is_empty() {
            drop(entry);
            index.remove_if(key, |_, ids| ids.is_empty());
        }
    }
}

fn keys(index: &DashMap<String, HashSet<ConnectionId>>) -> Vec<String> {
    index
        .iter()
        .map(|entry| entry.key().clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn take_matching(listeners: &Mutex<Vec<ScopedListener>>, connection: &Connection) -> Vec<ScopedListener> {
    let mut listeners = listeners.lock();
    let (matched, remaining): (Vec<_>, Vec<_>) =
        listeners.drain(..).partition(|l| l.matches(connection));
    *listeners = remaining;
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn register(
        registry: &Arc<ConnectionRegistry>,
        user: AccessUser,
        channel: Option<&str>,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<PushEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut request = ConnectRequest::new(user);
        request.channel = channel.map(str::to_string);
        (registry.register(request, tx).unwrap(), rx)
    }

    #[test]
    fn register_then_unregister_clears_every_index() {
        let registry = Arc::new(ConnectionRegistry::new());
        let user = AccessUser::new("u1", "t1").with_tenant("acme");
        let (conn, _rx) = register(&registry, user, Some("room"));

        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.user_count(), 1);
        assert_eq!(registry.access_token_count(), 1);
        assert_eq!(registry.lookup_by_tenant_id("acme").len(), 1);
        assert_eq!(registry.lookup_by_channel("room").len(), 1);

        assert!(registry.unregister(&conn));
        assert!(!registry.unregister(&conn));
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.user_count(), 0);
        assert_eq!(registry.access_token_count(), 0);
        assert!(registry.lookup_by_access_token("t1").is_empty());
        assert!(registry.lookup_by_user_id("u1").is_empty());
        assert!(registry.lookup_by_tenant_id("acme").is_empty());
        assert!(registry.lookup_by_channel("room").is_empty());
        assert!(registry.tenant_ids().is_empty());
    }

    #[test]
    fn disconnecting_one_of_many_leaves_the_rest_under_the_token() {
        let registry = Arc::new(ConnectionRegistry::new());
        let connections: Vec<_> = (0..4)
            .map(|_| register(&registry, AccessUser::new("u1", "shared"), None))
            .collect();

        assert!(connections[1].0.disconnect());
        let remaining = registry.lookup_by_access_token("shared");
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().all(|c| c.id() != connections[1].0.id()));
    }

    #[test]
    fn ids_are_sequential_from_one() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (first, _a) = register(&registry, AccessUser::new("u1", "t1"), None);
        let (second, _b) = register(&registry, AccessUser::new("u1", "t2"), None);
        assert_eq!(first.id().value(), 1);
        assert_eq!(second.id().value(), 2);
    }

    #[test]
    fn global_listeners_fire_on_writeable_and_disconnect() {
        let registry = Arc::new(ConnectionRegistry::new());
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = connects.clone();
        registry.on_connect(Arc::new(move |_: &Arc<Connection>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = disconnects.clone();
        let observed = registry.clone();
        registry.on_disconnect(Arc::new(move |c: &Arc<Connection>| {
            // Still indexed while disconnect listeners run.
            assert!(observed.get(c.id()).is_some());
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let (conn, _rx) = register(&registry, AccessUser::new("u1", "t1"), None);
        assert_eq!(connects.load(Ordering::SeqCst), 0);
        conn.writeable_ready().unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        conn.disconnect();
        conn.disconnect();
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(registry.get(conn.id()).is_none());
    }

    #[test]
    fn scoped_connect_listener_is_one_shot_and_channel_scoped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        registry.on_connect_scoped("t1", Some("room"), move |c| {
            assert_eq!(c.channel(), Some("room"));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (lobby, _a) = register(&registry, AccessUser::new("u1", "t1"), Some("lobby"));
        lobby.writeable_ready().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let (room, _b) = register(&registry, AccessUser::new("u1", "t1"), Some("room"));
        room.writeable_ready().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let (again, _c) = register(&registry, AccessUser::new("u1", "t1"), Some("room"));
        again.writeable_ready().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scoped_connect_listener_fires_immediately_for_writeable_match() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _rx) = register(&registry, AccessUser::new("u1", "t1"), None);
        conn.writeable_ready().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        registry.on_connect_scoped("t1", None, move |_| flag.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn scoped_connect_listener_waits_for_a_created_match_to_connect() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _rx) = register(&registry, AccessUser::new("u1", "t1"), None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        registry.on_connect_scoped("t1", None, move |c| log.lock().push(c.is_writeable()));
        assert!(seen.lock().is_empty());

        conn.writeable_ready().unwrap();
        assert_eq!(*seen.lock(), vec![true]);
    }

    #[test]
    fn scoped_disconnect_listener_fires_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        registry.on_disconnect_scoped("t1", None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (first, _a) = register(&registry, AccessUser::new("u1", "t1"), None);
        let (second, _b) = register(&registry, AccessUser::new("u1", "t1"), None);
        first.disconnect();
        second.disconnect();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listening_watchers_see_add_and_remove() {
        let registry = Arc::new(ConnectionRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        registry.on_listening_change(Arc::new(move |change: &ChangeEvent| {
            log.lock().push((change.kind, change.after.clone()));
        }));
        let (conn, _rx) = register(&registry, AccessUser::new("u1", "t1"), None);

        assert!(registry.add_listening(conn.id(), &["chat".to_string()]));
        assert!(registry.remove_listening(conn.id(), &["chat".to_string()]));
        assert!(!registry.add_listening(ConnectionId::new(999), &["chat".to_string()]));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, crate::connection::ChangeKind::AddListener);
        assert_eq!(seen[0].1, vec!["chat".to_string()]);
        assert!(seen[1].1.is_empty());
    }

    #[test]
    fn queries_deduplicate_users() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, _a) = register(&registry, AccessUser::new("u1", "t1").with_tenant("acme"), None);
        let (_b, _b_rx) = register(&registry, AccessUser::new("u1", "t2").with_tenant("acme"), None);
        let (_c, _c_rx) = register(&registry, AccessUser::new("u2", "t3"), Some("room"));
        registry.add_listening(a.id(), &["chat".to_string()]);

        assert!(registry.is_online("u1"));
        assert!(!registry.is_online("u9"));
        assert_eq!(registry.users().len(), 2);
        assert_eq!(registry.user_ids(), vec!["u1".to_string(), "u2".to_string()]);
        assert_eq!(registry.user_ids_by_listening("chat"), vec!["u1".to_string()]);
        assert_eq!(
            registry.user_ids_by_tenant_listening("acme", "chat"),
            vec!["u1".to_string()]
        );
        assert!(registry.users_by_tenant_listening("other", "chat").is_empty());
        assert_eq!(registry.access_tokens().len(), 3);
        assert_eq!(registry.channels(), vec!["room".to_string()]);
        assert_eq!(registry.get_user("u2").unwrap().access_token, "t3");
        assert_eq!(registry.connections().len(), 3);
    }

    #[test]
    fn shutdown_closes_everything_and_rejects_new_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_a, _a_rx) = register(&registry, AccessUser::new("u1", "t1"), None);
        let (_b, _b_rx) = register(&registry, AccessUser::new("u2", "t2"), None);
        assert_eq!(registry.shutdown(), 2);
        assert_eq!(registry.connection_count(), 0);

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = registry
            .register(ConnectRequest::new(AccessUser::new("u3", "t3")), tx)
            .unwrap_err();
        assert_eq!(err.error_kind, crate::error::ErrorKind::ClosedRegistry);
    }
}
