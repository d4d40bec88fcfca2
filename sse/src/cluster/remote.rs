use crate::access_user::{AutoType, RemoteUser, TypeRegistry};
use crate::cluster::wire::{
    encode_send, RemoteDisconnectBody, RemoteResponse, CONNECTION_QUERY_SERVICE,
    REMOTE_CONNECTION_SERVICE, SEND_SERVICE,
};
use crate::connection::{ConnectionDto, ConnectionId};
use crate::error::{closed_error, invalid_target, Result};
use crate::send::SendRequest;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::*;
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Address, credentials and identifier of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub id: String,
    pub base_url: String,
    pub account: String,
    pub password: String,
}

impl RemotePeer {
    pub fn new(base_url: impl Into<String>, account: impl Into<String>, password: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            id: base_url.clone(),
            base_url,
            account: account.into(),
            password: password.into(),
        }
    }

    pub fn basic_authorization(&self) -> String {
        basic_authorization(&self.account, &self.password)
    }
}

pub fn basic_authorization(account: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{account}:{password}")))
}

#[derive(Debug, Clone, Copy)]
pub struct RemoteTimeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl Default for RemoteTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(2000),
            read: Duration::from_millis(10_000),
        }
    }
}

/// Thin JSON-over-HTTP client shared by the remote services.
pub(crate) struct RpcClient {
    peer_id: String,
    base_url: Url,
    client: reqwest::Client,
    authorization: String,
    closed: AtomicBool,
}

impl RpcClient {
    pub(crate) fn new(peer: &RemotePeer, timeouts: RemoteTimeouts) -> Result<Self> {
        let mut base_url = Url::parse(&peer.base_url)
            .map_err(|e| invalid_target(&format!("peer url {}: {e}", peer.base_url)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.read)
            .build()?;
        Ok(Self {
            peer_id: peer.id.clone(),
            base_url,
            client,
            authorization: peer.basic_authorization(),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn url(&self, service: &str, method: &str) -> Result<Url> {
        self.base_url
            .join(&format!("{service}/{method}"))
            .map_err(|e| invalid_target(&format!("{service}/{method}: {e}")))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error(&format!("remote client {} is closed", self.peer_id)));
        }
        Ok(())
    }

    pub(crate) async fn get(&self, service: &str, method: &str, query: &[(&str, &str)]) -> Result<RemoteResponse> {
        self.ensure_open()?;
        let url = self.url(service, method)?;
        trace!("GET {url} on peer {}", self.peer_id);
        let response = self
            .client
            .get(url)
            .query(query)
            .header(AUTHORIZATION, &self.authorization)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<RemoteResponse>().await?)
    }

    pub(crate) async fn post<B>(&self, service: &str, method: &str, body: &B) -> Result<RemoteResponse>
    where
        B: Serialize + ?Sized + Sync,
    {
        self.ensure_open()?;
        let url = self.url(service, method)?;
        trace!("POST {url} on peer {}", self.peer_id);
        let response = self
            .client
            .post(url)
            .json(body)
            .header(AUTHORIZATION, &self.authorization)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<RemoteResponse>().await?)
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closed remote client for peer {}", self.peer_id);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub(crate) fn decode<T: DeserializeOwned>(response: RemoteResponse) -> Result<T> {
    Ok(serde_json::from_value(response.data)?)
}

/// One peer's connection services, as seen from this node.
#[async_trait]
pub trait RemoteConnectionService: Send + Sync {
    fn id(&self) -> &str;

    async fn is_online(&self, user_id: &str) -> Result<bool>;
    async fn get_user(&self, user_id: &str) -> Result<Option<RemoteUser>>;
    async fn users(&self) -> Result<Vec<RemoteUser>>;
    async fn users_by_listening(&self, listener: &str) -> Result<Vec<RemoteUser>>;
    async fn users_by_tenant_listening(&self, tenant_id: &str, listener: &str) -> Result<Vec<RemoteUser>>;
    async fn user_ids(&self) -> Result<Vec<String>>;
    async fn user_ids_by_listening(&self, listener: &str) -> Result<Vec<String>>;
    async fn user_ids_by_tenant_listening(&self, tenant_id: &str, listener: &str) -> Result<Vec<String>>;
    async fn access_tokens(&self) -> Result<Vec<String>>;
    async fn tenant_ids(&self) -> Result<Vec<String>>;
    async fn channels(&self) -> Result<Vec<String>>;
    async fn access_token_count(&self) -> Result<usize>;
    async fn user_count(&self) -> Result<usize>;
    async fn connection_count(&self) -> Result<usize>;
    async fn connections(&self) -> Result<Vec<ConnectionDto>>;

    /// Sends on the peer and returns how many connections accepted.
    async fn dispatch(&self, request: &SendRequest) -> Result<usize>;
    /// Sends on the peer and returns the connections that accepted.
    async fn dispatch_collect(&self, request: &SendRequest) -> Result<Vec<ConnectionDto>>;

    async fn disconnect_by_connection_id(&self, id: ConnectionId) -> Result<usize>;
    async fn disconnect_by_access_token(&self, access_token: &str) -> Result<usize>;
    async fn disconnect_by_user_id(&self, user_id: &str) -> Result<usize>;

    /// Releases the client; later calls fail with `ClosedRegistry`.
    fn close(&self);
}

pub struct HttpRemoteConnectionService {
    rpc: RpcClient,
    types: Arc<TypeRegistry>,
    auto_type: AutoType,
}

impl HttpRemoteConnectionService {
    pub fn new(
        peer: &RemotePeer,
        timeouts: RemoteTimeouts,
        types: Arc<TypeRegistry>,
        auto_type: AutoType,
    ) -> Result<Self> {
        Ok(Self {
            rpc: RpcClient::new(peer, timeouts)?,
            types,
            auto_type,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.rpc.is_closed()
    }

    async fn query(&self, method: &str, params: &[(&str, &str)]) -> Result<RemoteResponse> {
        self.rpc.get(CONNECTION_QUERY_SERVICE, method, params).await
    }

    async fn query_users(&self, method: &str, params: &[(&str, &str)]) -> Result<Vec<RemoteUser>> {
        let values: Vec<Value> = decode(self.query(method, params).await?)?;
        self.types.reconstruct_all(values, self.auto_type)
    }

    async fn disconnect(&self, method: &str, body: RemoteDisconnectBody) -> Result<usize> {
        decode(self.rpc.post(REMOTE_CONNECTION_SERVICE, method, &body).await?)
    }
}

#[async_trait]
impl RemoteConnectionService for HttpRemoteConnectionService {
    fn id(&self) -> &str {
        self.rpc.peer_id()
    }

    async fn is_online(&self, user_id: &str) -> Result<bool> {
        decode(self.query("isOnline", &[("userId", user_id)]).await?)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<RemoteUser>> {
        let response = self.query("getUser", &[("userId", user_id)]).await?;
        match response.into_hinted_data() {
            Value::Null => Ok(None),
            value => self.types.reconstruct(value, self.auto_type).map(Some),
        }
    }

    async fn users(&self) -> Result<Vec<RemoteUser>> {
        self.query_users("users", &[]).await
    }

    async fn users_by_listening(&self, listener: &str) -> Result<Vec<RemoteUser>> {
        self.query_users("usersByListening", &[("listener", listener)])
            .await
    }

    async fn users_by_tenant_listening(&self, tenant_id: &str, listener: &str) -> Result<Vec<RemoteUser>> {
        self.query_users(
            "usersByTenantListening",
            &[("tenantId", tenant_id), ("listener", listener)],
        )
        .await
    }

    async fn user_ids(&self) -> Result<Vec<String>> {
        decode(self.query("userIds", &[]).await?)
    }

    async fn user_ids_by_listening(&self, listener: &str) -> Result<Vec<String>> {
        decode(self.query("userIdsByListening", &[("listener", listener)]).await?)
    }

    async fn user_ids_by_tenant_listening(&self, tenant_id: &str, listener: &str) -> Result<Vec<String>> {
        let params = [("tenantId", tenant_id), ("listener", listener)];
        decode(self.query("userIdsByTenantListening", &params).await?)
    }

    async fn access_tokens(&self) -> Result<Vec<String>> {
        decode(self.query("accessTokens", &[]).await?)
    }

    async fn tenant_ids(&self) -> Result<Vec<String>> {
        decode(self.query("tenantIds", &[]).await?)
    }

    async fn channels(&self) -> Result<Vec<String>> {
        decode(self.query("channels", &[]).await?)
    }

    async fn access_token_count(&self) -> Result<usize> {
        decode(self.query("accessTokenCount", &[]).await?)
    }

    async fn user_count(&self) -> Result<usize> {
        decode(self.query("userCount", &[]).await?)
    }

    async fn connection_count(&self) -> Result<usize> {
        decode(self.query("connectionCount", &[]).await?)
    }

    async fn connections(&self) -> Result<Vec<ConnectionDto>> {
        decode(self.query("connections", &[]).await?)
    }

    async fn dispatch(&self, request: &SendRequest) -> Result<usize> {
        let (method, body) = encode_send(request, false)?;
        decode(self.rpc.post(SEND_SERVICE, method, &body).await?)
    }

    async fn dispatch_collect(&self, request: &SendRequest) -> Result<Vec<ConnectionDto>> {
        let (method, body) = encode_send(request, true)?;
        decode(self.rpc.post(SEND_SERVICE, method, &body).await?)
    }

    async fn disconnect_by_connection_id(&self, id: ConnectionId) -> Result<usize> {
        let body = RemoteDisconnectBody {
            connection_id: Some(id.value()),
            ..RemoteDisconnectBody::default()
        };
        self.disconnect("disconnectByConnectionId", body).await
    }

    async fn disconnect_by_access_token(&self, access_token: &str) -> Result<usize> {
        let body = RemoteDisconnectBody {
            access_token: Some(access_token.to_string()),
            ..RemoteDisconnectBody::default()
        };
        self.disconnect("disconnectByAccessToken", body).await
    }

    async fn disconnect_by_user_id(&self, user_id: &str) -> Result<usize> {
        let body = RemoteDisconnectBody {
            user_id: Some(user_id.to_string()),
            ..RemoteDisconnectBody::default()
        };
        self.disconnect("disconnectByUserId", body).await
    }

    fn close(&self) {
        self.rpc.close();
    }
}
