//! At-least-once delivery on top of the connection services.
//!
//! A send that reaches no writeable connection is stored in the message
//! repository. Every time a connection becomes writeable, or starts listening
//! for more events, the repository is searched for messages addressed to it;
//! each one delivered is deleted with the receiving connection attached, which
//! resolves the sender's [`PendingDelivery`].

use crate::cluster::service::ClusterConnectionService;
use crate::connection::{ChangeEvent, ChangeKind, Connection, ConnectionDto};
use crate::manager::Manager;
use crate::message::{ConnectionQuery, Message};
use crate::qos::cluster_repository::ClusterMessageRepository;
use crate::qos::repository::MessageRepository;
use crate::send::{SendRequest, SendService, WriteScope};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use log::*;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

pub struct AtLeastOnceDelivery {
    local: Arc<Manager>,
    cluster: Option<Arc<ClusterConnectionService>>,
    repository: Arc<dyn MessageRepository>,
    cluster_repository: Option<Arc<ClusterMessageRepository>>,
    pending: DashMap<String, oneshot::Sender<Vec<ConnectionDto>>>,
    in_flight: Arc<DashSet<String>>,
}

impl AtLeastOnceDelivery {
    /// Single node delivery over `local` connections and `repository`.
    pub fn new(local: Arc<Manager>, repository: Arc<dyn MessageRepository>) -> Arc<Self> {
        Self::install(Self {
            local,
            cluster: None,
            repository,
            cluster_repository: None,
            pending: DashMap::new(),
            in_flight: Arc::new(DashSet::new()),
        })
    }

    /// Cluster wide delivery: sends reach every node and stored messages are
    /// read from every node's repository.
    pub fn clustered(
        cluster: Arc<ClusterConnectionService>,
        cluster_repository: Arc<ClusterMessageRepository>,
    ) -> Arc<Self> {
        Self::install(Self {
            local: Arc::clone(cluster.local()),
            repository: Arc::clone(cluster_repository.local()),
            cluster: Some(cluster),
            cluster_repository: Some(cluster_repository),
            pending: DashMap::new(),
            in_flight: Arc::new(DashSet::new()),
        })
    }

    fn install(delivery: Self) -> Arc<Self> {
        let delivery = Arc::new(delivery);

        let weak = Arc::downgrade(&delivery);
        delivery
            .repository
            .add_delete_listener(Arc::new(move |message: &Message, delivered_to: Option<&ConnectionDto>| {
                if let Some(delivery) = weak.upgrade() {
                    delivery.complete(&message.id, delivered_to);
                }
            }));

        let weak: Weak<Self> = Arc::downgrade(&delivery);
        delivery.local.registry().on_connect(Arc::new(move |connection: &Arc<Connection>| {
            if let Some(delivery) = weak.upgrade() {
                delivery.trigger(connection);
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(&delivery);
        delivery
            .local
            .registry()
            .on_listening_change(Arc::new(move |change: &ChangeEvent| {
                if matches!(change.kind, ChangeKind::AddListener) {
                    if let Some(delivery) = weak.upgrade() {
                        delivery.trigger(&change.connection);
                    }
                }
            }));

        delivery
    }

    pub fn local(&self) -> &Arc<Manager> {
        &self.local
    }

    pub fn repository(&self) -> &Arc<dyn MessageRepository> {
        &self.repository
    }

    /// Futures still waiting for their message to be delivered.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn complete(&self, message_id: &str, delivered_to: Option<&ConnectionDto>) {
        if let Some((_, sender)) = self.pending.remove(message_id) {
            let receivers = delivered_to.cloned().into_iter().collect();
            // The caller may have dropped its future.
            let _ = sender.send(receivers);
        }
    }

    /// Looks up stored messages for `connection` and resends them.
    pub fn trigger(self: &Arc<Self>, connection: &Arc<Connection>) {
        if self.cluster_repository.is_none() {
            let messages = self.repository.select(connection.as_ref());
            self.resend_local(messages, connection);
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    "No runtime to query the cluster for connection {}, resending local messages only",
                    connection.id()
                );
                let messages = self.repository.select(connection.as_ref());
                self.resend_local(messages, connection);
                return;
            }
        };
        let delivery = Arc::clone(self);
        let connection = Arc::clone(connection);
        handle.spawn(async move {
            let query = ConnectionQuery::from(connection.as_ref());
            let messages = match &delivery.cluster_repository {
                Some(cluster_repository) => cluster_repository.select(&query).await,
                None => delivery.repository.select(&query),
            };
            delivery.resend(messages, &connection).await;
        });
    }

    /// Writes `messages` to `connection` in order. Messages held by a peer are
    /// claimed from it first and written only if the claim succeeds. Stops at
    /// the first message the connection cannot take. Returns how many were
    /// written.
    pub async fn resend(&self, messages: Vec<Message>, connection: &Arc<Connection>) -> usize {
        let mut sent = 0;
        for message in messages {
            let outcome = match (self.remote_owner(&message), &self.cluster_repository) {
                (Some(owner), Some(cluster_repository)) => {
                    self.resend_claimed(cluster_repository, message, &owner, connection)
                        .await
                }
                _ => self.resend_one(message, connection),
            };
            match outcome {
                Resend::Sent => sent += 1,
                Resend::Skipped => {}
                Resend::Stopped => break,
            }
        }
        if sent > 0 {
            debug!("Resent {sent} stored messages to connection {}", connection.id());
        }
        sent
    }

    /// Like [`resend`](Self::resend) for messages held by this node's
    /// repository; peer owned messages are left for the async path.
    pub fn resend_local(&self, messages: Vec<Message>, connection: &Arc<Connection>) -> usize {
        let mut sent = 0;
        for message in messages {
            if self.remote_owner(&message).is_some() {
                continue;
            }
            match self.resend_one(message, connection) {
                Resend::Sent => sent += 1,
                Resend::Skipped => {}
                Resend::Stopped => break,
            }
        }
        if sent > 0 {
            debug!("Resent {sent} stored messages to connection {}", connection.id());
        }
        sent
    }

    fn remote_owner(&self, message: &Message) -> Option<String> {
        message
            .repository_id
            .clone()
            .filter(|owner| owner.as_str() != self.repository.id())
    }

    fn resend_one(&self, message: Message, connection: &Arc<Connection>) -> Resend {
        let _guard = match InFlight::acquire(&self.in_flight, &message.id) {
            Some(guard) => guard,
            None => return Resend::Skipped,
        };
        if !self.repository.contains(&message.id) {
            return Resend::Skipped;
        }
        if !connection.is_active() || !connection.is_writeable() {
            return Resend::Stopped;
        }
        if let Err(e) = connection.send(message.to_push_event()) {
            warn!(
                "Resend of {} to connection {} failed: {e}",
                message.id,
                connection.id()
            );
            return Resend::Stopped;
        }
        self.repository.delete(&message.id, Some(connection.to_dto()));
        Resend::Sent
    }

    async fn resend_claimed(
        &self,
        cluster_repository: &ClusterMessageRepository,
        message: Message,
        owner: &str,
        connection: &Arc<Connection>,
    ) -> Resend {
        let _guard = match InFlight::acquire(&self.in_flight, &message.id) {
            Some(guard) => guard,
            None => return Resend::Skipped,
        };
        if !connection.is_active() || !connection.is_writeable() {
            return Resend::Stopped;
        }
        let claimed = cluster_repository
            .delete(&message.id, Some(owner), Some(connection.to_dto()))
            .await;
        if claimed.is_none() {
            debug!("Message {} was already taken from {owner}", message.id);
            return Resend::Skipped;
        }
        if let Err(e) = connection.send(message.to_push_event()) {
            error!(
                "Message {} claimed from {owner} could not be written to connection {}: {e}",
                message.id,
                connection.id()
            );
            return Resend::Stopped;
        }
        Resend::Sent
    }

    /// Local connections that turned writeable between the send attempt and
    /// the insert.
    fn sweep(&self, message: &Message) {
        for connection in self.local.resolve(&message.audience) {
            if connection.is_writeable() {
                self.resend_local(vec![message.clone()], &connection);
            }
        }
    }
}

#[async_trait]
impl SendService for AtLeastOnceDelivery {
    type Output = PendingDelivery;

    async fn dispatch(&self, request: SendRequest) -> PendingDelivery {
        let request = request.scoped(WriteScope::WriteableOnly);
        let receivers: Vec<ConnectionDto> = match &self.cluster {
            Some(cluster) => cluster.dispatch_collect(request.clone()).await,
            None => self
                .local
                .dispatch_collect(&request)
                .iter()
                .map(|c| c.to_dto())
                .collect(),
        };
        if !receivers.is_empty() {
            return PendingDelivery::ready(None, receivers);
        }

        let message = Message::new(request.event_name, request.body, request.audience);
        let id = message.id.clone();
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id.clone(), sender);
        let inserted = match &self.cluster_repository {
            Some(cluster_repository) => cluster_repository.insert(message.clone()),
            None => self.repository.insert(message.clone()),
        };
        if let Err(e) = inserted {
            warn!("Could not store message {id} for later delivery: {e}");
            self.pending.remove(&id);
            return PendingDelivery::ready(Some(id), Vec::new());
        }
        debug!("Stored message {id} ({}) until a receiver connects", message.event_name);
        self.sweep(&message);
        PendingDelivery::waiting(id, receiver)
    }
}

enum Resend {
    Sent,
    Skipped,
    Stopped,
}

/// Marks a message as being delivered by this node. Released on drop.
struct InFlight {
    set: Arc<DashSet<String>>,
    id: String,
}

impl InFlight {
    fn acquire(set: &Arc<DashSet<String>>, id: &str) -> Option<Self> {
        if set.insert(id.to_string()) {
            Some(Self {
                set: Arc::clone(set),
                id: id.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

/// Resolves to the connections that received a send.
///
/// Ready immediately when the send reached someone; otherwise resolves once
/// the stored message is delivered, or with no receivers if it is dropped
/// undelivered.
pub struct PendingDelivery {
    message_id: Option<String>,
    state: PendingState,
}

enum PendingState {
    Ready(Option<Vec<ConnectionDto>>),
    Waiting(oneshot::Receiver<Vec<ConnectionDto>>),
}

impl PendingDelivery {
    fn ready(message_id: Option<String>, receivers: Vec<ConnectionDto>) -> Self {
        Self {
            message_id,
            state: PendingState::Ready(Some(receivers)),
        }
    }

    fn waiting(message_id: String, receiver: oneshot::Receiver<Vec<ConnectionDto>>) -> Self {
        Self {
            message_id: Some(message_id),
            state: PendingState::Waiting(receiver),
        }
    }

    /// Id of the stored message, if the send had to be stored.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, PendingState::Ready(_))
    }
}

impl Future for PendingDelivery {
    type Output = Vec<ConnectionDto>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            PendingState::Ready(receivers) => Poll::Ready(receivers.take().unwrap_or_default()),
            PendingState::Waiting(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|received| received.unwrap_or_default()),
        }
    }
}
