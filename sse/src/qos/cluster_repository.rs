use crate::cluster::aggregate::{checkout_current, map_reduce, AggregateOptions, Combiner};
use crate::cluster::discovery::ServiceDiscovery;
use crate::cluster::remote::{decode, RemotePeer, RemoteTimeouts, RpcClient};
use crate::cluster::wire::MESSAGE_REPOSITORY;
use crate::connection::ConnectionDto;
use crate::error::Result;
use crate::message::{ConnectionQuery, Message};
use crate::qos::repository::MessageRepository;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// One peer's message repository, as seen from this node.
#[async_trait]
pub trait RemoteMessageRepository: Send + Sync {
    fn id(&self) -> &str;

    async fn insert(&self, message: &Message) -> Result<String>;

    /// Pending messages on the peer for `query`, stamped with this
    /// repository's id.
    async fn select(&self, query: &ConnectionQuery) -> Result<Vec<Message>>;

    async fn list(&self) -> Result<Vec<Message>>;

    async fn delete(&self, id: &str, delivered_to: Option<ConnectionDto>) -> Result<Option<Message>>;

    fn close(&self);
}

/// JSON body of `MessageRepository/delete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDeleteBody {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_to: Option<ConnectionDto>,
}

pub struct HttpRemoteMessageRepository {
    rpc: RpcClient,
}

impl HttpRemoteMessageRepository {
    pub fn new(peer: &RemotePeer, timeouts: RemoteTimeouts) -> Result<Self> {
        Ok(Self {
            rpc: RpcClient::new(peer, timeouts)?,
        })
    }

    fn stamp(&self, mut messages: Vec<Message>) -> Vec<Message> {
        for message in &mut messages {
            message.repository_id = Some(self.rpc.peer_id().to_string());
        }
        messages
    }
}

#[async_trait]
impl RemoteMessageRepository for HttpRemoteMessageRepository {
    fn id(&self) -> &str {
        self.rpc.peer_id()
    }

    async fn insert(&self, message: &Message) -> Result<String> {
        decode(self.rpc.post(MESSAGE_REPOSITORY, "insert", message).await?)
    }

    async fn select(&self, query: &ConnectionQuery) -> Result<Vec<Message>> {
        let messages = decode(self.rpc.post(MESSAGE_REPOSITORY, "select", query).await?)?;
        Ok(self.stamp(messages))
    }

    async fn list(&self) -> Result<Vec<Message>> {
        let messages = decode(self.rpc.post(MESSAGE_REPOSITORY, "list", &json!({})).await?)?;
        Ok(self.stamp(messages))
    }

    async fn delete(&self, id: &str, delivered_to: Option<ConnectionDto>) -> Result<Option<Message>> {
        let body = RemoteDeleteBody {
            id: id.to_string(),
            delivered_to,
        };
        decode(self.rpc.post(MESSAGE_REPOSITORY, "delete", &body).await?)
    }

    fn close(&self) {
        self.rpc.close();
    }
}

/// The local repository plus every peer's, read and deleted through the same
/// map-reduce as connection queries.
pub struct ClusterMessageRepository {
    local: Arc<dyn MessageRepository>,
    discovery: Arc<dyn ServiceDiscovery>,
    options: AggregateOptions,
}

impl ClusterMessageRepository {
    pub fn new(local: Arc<dyn MessageRepository>, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        Self {
            local,
            discovery,
            options: AggregateOptions::default(),
        }
    }

    pub fn with_options(mut self, options: AggregateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn local(&self) -> &Arc<dyn MessageRepository> {
        &self.local
    }

    pub fn insert(&self, message: Message) -> Result<String> {
        self.local.insert(message)
    }

    pub async fn select(&self, query: &ConnectionQuery) -> Vec<Message> {
        let checkout = checkout_current(|| self.discovery.message_repository_list_ref());
        let peers = checkout.as_deref().map(Vec::as_slice).unwrap_or(&[]);
        let remote_query = Arc::new(query.clone());
        map_reduce(
            "select_messages",
            peers,
            self.options,
            move |peer| {
                let query = Arc::clone(&remote_query);
                async move { peer.select(&query).await }
            },
            || self.local.select(query),
            &Combiner::concat(),
        )
        .await
    }

    pub async fn list(&self) -> Vec<Message> {
        let checkout = checkout_current(|| self.discovery.message_repository_list_ref());
        let peers = checkout.as_deref().map(Vec::as_slice).unwrap_or(&[]);
        map_reduce(
            "list_messages",
            peers,
            self.options,
            |peer| async move { peer.list().await },
            || self.local.list(),
            &Combiner::concat(),
        )
        .await
    }

    /// Deletes `id` from the repository that owns it. `None` (or the local
    /// id) means this node's repository; only the owner is asked.
    pub async fn delete(
        &self,
        id: &str,
        repository_id: Option<&str>,
        delivered_to: Option<ConnectionDto>,
    ) -> Option<Message> {
        let owner = match repository_id {
            Some(owner) if owner != self.local.id() => owner,
            _ => return self.local.delete(id, delivered_to),
        };
        let checkout = checkout_current(|| self.discovery.message_repository_list_ref());
        let owners: Vec<_> = checkout
            .as_deref()
            .map(|peers| peers.iter().filter(|p| p.id() == owner).cloned().collect())
            .unwrap_or_default();
        let key = id.to_string();
        map_reduce(
            "delete_message",
            &owners,
            self.options,
            move |peer| {
                let key = key.clone();
                let delivered_to = delivered_to.clone();
                async move { peer.delete(&key, delivered_to).await }
            },
            || None,
            &Combiner::first_non_null(),
        )
        .await
    }
}
