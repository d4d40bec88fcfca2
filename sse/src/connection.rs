use crate::access_user::AccessUser;
use crate::error::{transport_error, Result};
use crate::event::{PushEvent, CONNECT_CLOSE};
use chrono::{DateTime, Utc};
use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

pub type UserId = String;

/// Process-unique connection identifier handed out by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic id source. Ids stay inside the positive 32-bit range and wrap
/// back to 1 after `i32::MAX` has been handed out.
#[derive(Debug)]
pub struct ConnectionIdGenerator {
    next: AtomicU64,
}

const MAX_CONNECTION_ID: u64 = i32::MAX as u64;

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.clamp(1, MAX_CONNECTION_ID)),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        let advance = |current: u64| {
            Some(if current >= MAX_CONNECTION_ID {
                1
            } else {
                current + 1
            })
        };
        let id = match self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, advance)
        {
            Ok(previous) | Err(previous) => previous,
        };
        ConnectionId(id)
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Created,
    Writeable,
    Disconnected,
}

/// Everything needed to open a connection.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub access_user: AccessUser,
    pub channel: Option<String>,
    pub listeners: Vec<String>,
    /// Zero means the connection never expires.
    pub keepalive: Duration,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl ConnectRequest {
    pub fn new(access_user: AccessUser) -> Self {
        Self {
            access_user,
            channel: None,
            listeners: Vec::new(),
            keepalive: Duration::ZERO,
            client_ip: None,
            user_agent: None,
        }
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn listeners<I, S>(mut self, listeners: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.listeners = listeners.into_iter().map(Into::into).collect();
        self
    }

    pub fn keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    AddListener,
    RemoveListener,
}

/// A change of one connection's listening set.
#[derive(Clone)]
pub struct ChangeEvent {
    pub connection: Arc<Connection>,
    pub kind: ChangeKind,
    pub before: Vec<String>,
    pub after: Vec<String>,
}

type ConnectionCallback = Box<dyn FnOnce(&Arc<Connection>) + Send>;

pub struct Connection {
    id: ConnectionId,
    access_user: AccessUser,
    channel: Option<String>,
    created_at: DateTime<Utc>,
    client_ip: Option<String>,
    user_agent: Option<String>,
    disconnected: AtomicBool,
    inner: Mutex<ConnectionInner>,
    connect_listeners: Mutex<Vec<ConnectionCallback>>,
    disconnect_listeners: Mutex<Vec<ConnectionCallback>>,
}

struct ConnectionInner {
    state: ConnectionState,
    completed: bool,
    send_error: Option<String>,
    early_send_queue: VecDeque<PushEvent>,
    listeners: HashSet<String>,
    sender: Option<UnboundedSender<PushEvent>>,
    keepalive: Duration,
    keepalive_task: Option<JoinHandle<()>>,
    attributes: Map<String, Value>,
    send_count: u64,
}

impl ConnectionInner {
    fn is_active(&self) -> bool {
        !self.completed && self.send_error.is_none()
    }

    fn write(&mut self, id: ConnectionId, event: PushEvent) -> Result<()> {
        let sender = match &self.sender {
            Some(sender) => sender,
            None => return Err(transport_error("connection has no open stream")),
        };
        match sender.send(event) {
            Ok(()) => {
                self.send_count += 1;
                Ok(())
            }
            Err(e) => {
                let message = format!("connection {id} stream closed: {e}");
                self.send_error = Some(message.clone());
                Err(transport_error(&message))
            }
        }
    }
}

impl Connection {
    pub fn new(id: ConnectionId, request: ConnectRequest, sender: UnboundedSender<PushEvent>) -> Arc<Self> {
        Arc::new(Self {
            id,
            access_user: request.access_user,
            channel: request.channel,
            created_at: Utc::now(),
            client_ip: request.client_ip,
            user_agent: request.user_agent,
            disconnected: AtomicBool::new(false),
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Created,
                completed: false,
                send_error: None,
                early_send_queue: VecDeque::new(),
                listeners: request.listeners.into_iter().collect(),
                sender: Some(sender),
                keepalive: request.keepalive,
                keepalive_task: None,
                attributes: Map::new(),
                send_count: 0,
            }),
            connect_listeners: Mutex::new(Vec::new()),
            disconnect_listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn access_user(&self) -> &AccessUser {
        &self.access_user
    }

    pub fn user_id(&self) -> &str {
        &self.access_user.id
    }

    pub fn access_token(&self) -> &str {
        &self.access_user.access_token
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.access_user.tenant_id.as_deref()
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// True strictly before completion or a transport error.
    pub fn is_active(&self) -> bool {
        self.inner.lock().is_active()
    }

    pub fn is_writeable(&self) -> bool {
        self.inner.lock().state == ConnectionState::Writeable
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn listeners(&self) -> Vec<String> {
        let mut listeners: Vec<String> = self.inner.lock().listeners.iter().cloned().collect();
        listeners.sort();
        listeners
    }

    pub fn is_listening(&self, name: &str) -> bool {
        self.inner.lock().listeners.contains(name)
    }

    pub fn keepalive(&self) -> Duration {
        self.inner.lock().keepalive
    }

    pub fn send_count(&self) -> u64 {
        self.inner.lock().send_count
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.inner.lock().attributes.get(key).cloned()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.inner.lock().attributes.insert(key.into(), value)
    }

    /// Queue or write one event.
    ///
    /// Before the stream is writeable events are buffered and the call
    /// succeeds; they are flushed in order by [`Connection::writeable_ready`].
    pub fn send(&self, event: PushEvent) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.is_active() {
            return Err(transport_error(&format!("connection {} is not active", self.id)));
        }
        match inner.state {
            ConnectionState::Created => {
                inner.early_send_queue.push_back(event);
                Ok(())
            }
            ConnectionState::Writeable => inner.write(self.id, event),
            ConnectionState::Disconnected => Err(transport_error(&format!(
                "connection {} is disconnected",
                self.id
            ))),
        }
    }

    /// Marks the transport writeable, flushes the early buffer and fires the
    /// connect listeners. Only the first call has an effect.
    pub fn writeable_ready(self: &Arc<Self>) -> Result<()> {
        let flushed = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Created || !inner.is_active() {
                return Ok(());
            }
            inner.state = ConnectionState::Writeable;
            let queued = std::mem::take(&mut inner.early_send_queue);
            let mut flushed = Ok(());
            for event in queued {
                if let Err(e) = inner.write(self.id, event) {
                    flushed = Err(e);
                    break;
                }
            }
            flushed
        };

        let callbacks = std::mem::take(&mut *self.connect_listeners.lock());
        for callback in callbacks {
            callback(self);
        }
        flushed
    }

    /// Runs `callback` once the connection becomes writeable, or right away if
    /// it already is.
    pub fn add_connect_listener<F>(self: &Arc<Self>, callback: F)
    where
        F: FnOnce(&Arc<Connection>) + Send + 'static,
    {
        if self.is_writeable() {
            callback(self);
        } else {
            self.connect_listeners.lock().push(Box::new(callback));
        }
    }

    /// Runs `callback` when the connection disconnects, or right away if it
    /// already has.
    pub fn add_disconnect_listener<F>(self: &Arc<Self>, callback: F)
    where
        F: FnOnce(&Arc<Connection>) + Send + 'static,
    {
        if self.is_disconnected() {
            callback(self);
        } else {
            self.disconnect_listeners.lock().push(Box::new(callback));
        }
    }

    pub fn add_listeners(self: &Arc<Self>, names: &[String]) -> Option<ChangeEvent> {
        self.change_listeners(ChangeKind::AddListener, |listeners| {
            for name in names {
                listeners.insert(name.clone());
            }
        })
    }

    pub fn remove_listeners(self: &Arc<Self>, names: &[String]) -> Option<ChangeEvent> {
        self.change_listeners(ChangeKind::RemoveListener, |listeners| {
            for name in names {
                listeners.remove(name);
            }
        })
    }

    fn change_listeners<F>(self: &Arc<Self>, kind: ChangeKind, update: F) -> Option<ChangeEvent>
    where
        F: FnOnce(&mut HashSet<String>),
    {
        let (before, after) = {
            let mut inner = self.inner.lock();
            let before = sorted(&inner.listeners);
            update(&mut inner.listeners);
            (before, sorted(&inner.listeners))
        };
        if before == after {
            return None;
        }
        Some(ChangeEvent {
            connection: Arc::clone(self),
            kind,
            before,
            after,
        })
    }

    /// Arms (or re-arms) the keepalive timer. A zero duration disarms it.
    pub fn set_keepalive(self: &Arc<Self>, keepalive: Duration) {
        self.inner.lock().keepalive = keepalive;
        self.arm_keepalive();
    }

    pub(crate) fn arm_keepalive(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.keepalive_task.take() {
            previous.abort();
        }
        if inner.keepalive.is_zero() || !inner.is_active() {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("No runtime to arm keepalive for connection {}: {e}", self.id);
                return;
            }
        };
        let keepalive = inner.keepalive;
        let weak: Weak<Connection> = Arc::downgrade(self);
        inner.keepalive_task = Some(handle.spawn(async move {
            tokio::time::sleep(keepalive).await;
            if let Some(connection) = weak.upgrade() {
                debug!(
                    "Connection {} reached keepalive of {:?}, disconnecting",
                    connection.id, keepalive
                );
                connection.disconnect();
            }
        }));
    }

    /// Moves the connection into `Disconnected`. Returns false if it already was.
    ///
    /// In order: disconnect listeners run (the registry's hook removes the
    /// connection from every index), the keepalive timer is cancelled, a
    /// best-effort close frame is written, and the stream is ended.
    pub fn disconnect(self: &Arc<Self>) -> bool {
        if self
            .disconnected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let callbacks = std::mem::take(&mut *self.disconnect_listeners.lock());
        for callback in callbacks {
            callback(self);
        }
        self.connect_listeners.lock().clear();

        let sender = {
            let mut inner = self.inner.lock();
            if let Some(task) = inner.keepalive_task.take() {
                task.abort();
            }
            if inner.is_active() && inner.state == ConnectionState::Writeable {
                let close = PushEvent::new(CONNECT_CLOSE, Value::Null).with_id(self.id.to_string());
                if let Err(e) = inner.write(self.id, close) {
                    trace!("Close frame for connection {} not delivered: {e}", self.id);
                }
            }
            inner.completed = true;
            inner.state = ConnectionState::Disconnected;
            inner.early_send_queue.clear();
            inner.sender.take()
        };
        drop(sender);
        debug!("Connection {} disconnected", self.id);
        true
    }

    pub fn to_dto(&self) -> ConnectionDto {
        let inner = self.inner.lock();
        ConnectionDto {
            id: self.id,
            user_id: self.access_user.id.clone(),
            access_token: self.access_user.access_token.clone(),
            tenant_id: self.access_user.tenant_id.clone(),
            channel: self.channel.clone(),
            listeners: sorted(&inner.listeners),
            state: inner.state,
            created_at: self.created_at,
            keepalive_ms: inner.keepalive.as_millis() as u64,
            send_count: inner.send_count,
            client_ip: self.client_ip.clone(),
            user_agent: self.user_agent.clone(),
            access_user: self.access_user.clone(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.access_user.id)
            .field("channel", &self.channel)
            .field("state", &self.state())
            .finish()
    }
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut items: Vec<String> = set.iter().cloned().collect();
    items.sort();
    items
}

/// Serializable snapshot of a connection, used by queries and the cluster RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDto {
    pub id: ConnectionId,
    pub user_id: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub listeners: Vec<String>,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub keepalive_ms: u64,
    #[serde(default)]
    pub send_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub access_user: AccessUser,
}
