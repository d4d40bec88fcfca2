use crate::access_user::RemoteUser;
use crate::cluster::aggregate::{checkout_current, map_reduce, AggregateOptions, Combiner};
use crate::cluster::discovery::ServiceDiscovery;
use crate::cluster::remote::RemoteConnectionService;
use crate::connection::{ConnectionDto, ConnectionId};
use crate::manager::Manager;
use crate::send::{SendRequest, SendService};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

type Peer = dyn RemoteConnectionService;

/// Connection queries, sends and disconnects over the whole cluster: every
/// call runs on every peer and on the local node, and the answers are merged.
pub struct ClusterConnectionService {
    local: Arc<Manager>,
    discovery: Arc<dyn ServiceDiscovery>,
    options: AggregateOptions,
}

impl ClusterConnectionService {
    pub fn new(local: Arc<Manager>, discovery: Arc<dyn ServiceDiscovery>) -> Self {
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

    pub fn local(&self) -> &Arc<Manager> {
        &self.local
    }

    pub fn discovery(&self) -> &Arc<dyn ServiceDiscovery> {
        &self.discovery
    }

    /// Holds a checkout of the peer list for the whole aggregation.
    async fn aggregate<R, F, Fut, L>(&self, operation: &str, remote: F, local: L, combiner: Combiner<R>) -> R
    where
        R: Send + 'static,
        F: Fn(Arc<Peer>) -> Fut + Send,
        Fut: Future<Output = crate::error::Result<R>> + Send + 'static,
        L: FnOnce() -> R + Send,
    {
        let checkout = checkout_current(|| self.discovery.connection_service_list_ref());
        let peers = checkout.as_deref().map(Vec::as_slice).unwrap_or(&[]);
        map_reduce(operation, peers, self.options, remote, local, &combiner).await
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        let key = user_id.to_string();
        self.aggregate(
            "is_online",
            move |peer| {
                let key = key.clone();
                async move { peer.is_online(&key).await }
            },
            || self.local.registry().is_online(user_id),
            Combiner::or(),
        )
        .await
    }

    pub async fn get_user(&self, user_id: &str) -> Option<RemoteUser> {
        let key = user_id.to_string();
        self.aggregate(
            "get_user",
            move |peer| {
                let key = key.clone();
                async move { peer.get_user(&key).await }
            },
            || self.local.registry().get_user(user_id).map(RemoteUser::from),
            Combiner::first_non_null(),
        )
        .await
    }

    pub async fn users(&self) -> Vec<RemoteUser> {
        self.aggregate(
            "users",
            |peer| async move { peer.users().await },
            || into_remote(self.local.registry().users()),
            union_users(),
        )
        .await
    }

    pub async fn users_by_listening(&self, listener: &str) -> Vec<RemoteUser> {
        let key = listener.to_string();
        self.aggregate(
            "users_by_listening",
            move |peer| {
                let key = key.clone();
                async move { peer.users_by_listening(&key).await }
            },
            || into_remote(self.local.registry().users_by_listening(listener)),
            union_users(),
        )
        .await
    }

    pub async fn users_by_tenant_listening(&self, tenant_id: &str, listener: &str) -> Vec<RemoteUser> {
        let keys = (tenant_id.to_string(), listener.to_string());
        self.aggregate(
            "users_by_tenant_listening",
            move |peer| {
                let (tenant_id, listener) = keys.clone();
                async move { peer.users_by_tenant_listening(&tenant_id, &listener).await }
            },
            || {
                into_remote(
                    self.local
                        .registry()
                        .users_by_tenant_listening(tenant_id, listener),
                )
            },
            union_users(),
        )
        .await
    }

    pub async fn user_ids(&self) -> Vec<String> {
        self.aggregate(
            "user_ids",
            |peer| async move { peer.user_ids().await },
            || self.local.registry().user_ids(),
            Combiner::union(),
        )
        .await
    }

    pub async fn user_ids_by_listening(&self, listener: &str) -> Vec<String> {
        let key = listener.to_string();
        self.aggregate(
            "user_ids_by_listening",
            move |peer| {
                let key = key.clone();
                async move { peer.user_ids_by_listening(&key).await }
            },
            || self.local.registry().user_ids_by_listening(listener),
            Combiner::union(),
        )
        .await
    }

    pub async fn user_ids_by_tenant_listening(&self, tenant_id: &str, listener: &str) -> Vec<String> {
        let keys = (tenant_id.to_string(), listener.to_string());
        self.aggregate(
            "user_ids_by_tenant_listening",
            move |peer| {
                let (tenant_id, listener) = keys.clone();
                async move { peer.user_ids_by_tenant_listening(&tenant_id, &listener).await }
            },
            || {
                self.local
                    .registry()
                    .user_ids_by_tenant_listening(tenant_id, listener)
            },
            Combiner::union(),
        )
        .await
    }

    pub async fn access_tokens(&self) -> Vec<String> {
        self.aggregate(
            "access_tokens",
            |peer| async move { peer.access_tokens().await },
            || self.local.registry().access_tokens(),
            Combiner::union(),
        )
        .await
    }

    pub async fn tenant_ids(&self) -> Vec<String> {
        self.aggregate(
            "tenant_ids",
            |peer| async move { peer.tenant_ids().await },
            || self.local.registry().tenant_ids(),
            Combiner::union(),
        )
        .await
    }

    pub async fn channels(&self) -> Vec<String> {
        self.aggregate(
            "channels",
            |peer| async move { peer.channels().await },
            || self.local.registry().channels(),
            Combiner::union(),
        )
        .await
    }

    pub async fn access_token_count(&self) -> usize {
        self.aggregate(
            "access_token_count",
            |peer| async move { peer.access_token_count().await },
            || self.local.registry().access_token_count(),
            Combiner::sum(),
        )
        .await
    }

    pub async fn user_count(&self) -> usize {
        self.aggregate(
            "user_count",
            |peer| async move { peer.user_count().await },
            || self.local.registry().user_count(),
            Combiner::sum(),
        )
        .await
    }

    pub async fn connection_count(&self) -> usize {
        self.aggregate(
            "connection_count",
            |peer| async move { peer.connection_count().await },
            || self.local.registry().connection_count(),
            Combiner::sum(),
        )
        .await
    }

    pub async fn connections(&self) -> Vec<ConnectionDto> {
        self.aggregate(
            "connections",
            |peer| async move { peer.connections().await },
            || self.local.registry().connections(),
            Combiner::concat(),
        )
        .await
    }

    /// Sends across the cluster and returns every connection that accepted.
    pub async fn dispatch_collect(&self, request: SendRequest) -> Vec<ConnectionDto> {
        let shared = Arc::new(request);
        let remote_request = Arc::clone(&shared);
        self.aggregate(
            "dispatch_collect",
            move |peer| {
                let request = Arc::clone(&remote_request);
                async move { peer.dispatch_collect(&request).await }
            },
            || {
                self.local
                    .dispatch_collect(&shared)
                    .iter()
                    .map(|c| c.to_dto())
                    .collect()
            },
            Combiner::concat(),
        )
        .await
    }

    pub async fn disconnect_by_connection_id(&self, id: ConnectionId) -> usize {
        self.aggregate(
            "disconnect_by_connection_id",
            move |peer| async move { peer.disconnect_by_connection_id(id).await },
            || self.local.disconnect_by_connection_id(id),
            Combiner::sum(),
        )
        .await
    }

    pub async fn disconnect_by_access_token(&self, access_token: &str) -> usize {
        let key = access_token.to_string();
        self.aggregate(
            "disconnect_by_access_token",
            move |peer| {
                let key = key.clone();
                async move { peer.disconnect_by_access_token(&key).await }
            },
            || self.local.disconnect_by_access_token(access_token),
            Combiner::sum(),
        )
        .await
    }

    pub async fn disconnect_by_user_id(&self, user_id: &str) -> usize {
        let key = user_id.to_string();
        self.aggregate(
            "disconnect_by_user_id",
            move |peer| {
                let key = key.clone();
                async move { peer.disconnect_by_user_id(&key).await }
            },
            || self.local.disconnect_by_user_id(user_id),
            Combiner::sum(),
        )
        .await
    }
}

#[async_trait]
impl SendService for ClusterConnectionService {
    type Output = usize;

    async fn dispatch(&self, request: SendRequest) -> usize {
        let shared = Arc::new(request);
        let remote_request = Arc::clone(&shared);
        self.aggregate(
            "dispatch",
            move |peer| {
                let request = Arc::clone(&remote_request);
                async move { peer.dispatch(&request).await }
            },
            || self.local.dispatch_collect(&shared).len(),
            Combiner::sum(),
        )
        .await
    }
}

fn into_remote(users: Vec<crate::access_user::AccessUser>) -> Vec<RemoteUser> {
    users.into_iter().map(RemoteUser::from).collect()
}

/// Union keyed by user id; the first node to report a user wins.
fn union_users() -> Combiner<Vec<RemoteUser>> {
    Combiner::new(Vec::new, |mut left, right| {
        for user in right {
            if !left.iter().any(|known| known.user_id() == user.user_id()) {
                left.push(user);
            }
        }
        left
    })
}
