use crate::message::Audience;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether a send may count connections that are not yet writeable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteScope {
    /// Buffered writes to not-yet-writeable connections count as accepted.
    #[default]
    Any,
    /// Only connections that are writeable right now are written to.
    WriteableOnly,
}

/// One logical send: an addressing target plus the event to push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub audience: Audience,
    pub event_name: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub scope: WriteScope,
}

impl SendRequest {
    pub fn new(audience: Audience, event_name: impl Into<String>, body: Value) -> Self {
        Self {
            audience,
            event_name: event_name.into(),
            body,
            scope: WriteScope::Any,
        }
    }

    pub fn scoped(mut self, scope: WriteScope) -> Self {
        self.scope = scope;
        self
    }
}

/// The broadcast surface: five addressing targets, each with a variant that
/// additionally requires the connection to listen for the event name.
///
/// Implementors only provide [`SendService::dispatch`]; `Output` is a recipient
/// count for the local and cluster services and a pending-delivery future for
/// the at-least-once service.
#[async_trait]
pub trait SendService: Send + Sync {
    type Output: Send;

    async fn dispatch(&self, request: SendRequest) -> Self::Output;

    async fn send_all(&self, event_name: &str, body: Value) -> Self::Output {
        self.dispatch(SendRequest::new(Audience::all(), event_name, body))
            .await
    }

    async fn send_all_listening(&self, event_name: &str, body: Value) -> Self::Output {
        let audience = Audience::all().listening(event_name);
        self.dispatch(SendRequest::new(audience, event_name, body)).await
    }

    async fn send_by_channel(&self, channels: Vec<String>, event_name: &str, body: Value) -> Self::Output {
        self.dispatch(SendRequest::new(Audience::channels(channels), event_name, body))
            .await
    }

    async fn send_by_channel_listening(
        &self,
        channels: Vec<String>,
        event_name: &str,
        body: Value,
    ) -> Self::Output {
        let audience = Audience::channels(channels).listening(event_name);
        self.dispatch(SendRequest::new(audience, event_name, body)).await
    }

    async fn send_by_access_token(
        &self,
        access_tokens: Vec<String>,
        event_name: &str,
        body: Value,
    ) -> Self::Output {
        let audience = Audience::access_tokens(access_tokens);
        self.dispatch(SendRequest::new(audience, event_name, body)).await
    }

    async fn send_by_access_token_listening(
        &self,
        access_tokens: Vec<String>,
        event_name: &str,
        body: Value,
    ) -> Self::Output {
        let audience = Audience::access_tokens(access_tokens).listening(event_name);
        self.dispatch(SendRequest::new(audience, event_name, body)).await
    }

    async fn send_by_user_id(&self, user_ids: Vec<String>, event_name: &str, body: Value) -> Self::Output {
        self.dispatch(SendRequest::new(Audience::user_ids(user_ids), event_name, body))
            .await
    }

    async fn send_by_user_id_listening(
        &self,
        user_ids: Vec<String>,
        event_name: &str,
        body: Value,
    ) -> Self::Output {
        let audience = Audience::user_ids(user_ids).listening(event_name);
        self.dispatch(SendRequest::new(audience, event_name, body)).await
    }

    async fn send_by_tenant_id(&self, tenant_ids: Vec<String>, event_name: &str, body: Value) -> Self::Output {
        self.dispatch(SendRequest::new(Audience::tenant_ids(tenant_ids), event_name, body))
            .await
    }

    async fn send_by_tenant_id_listening(
        &self,
        tenant_ids: Vec<String>,
        event_name: &str,
        body: Value,
    ) -> Self::Output {
        let audience = Audience::tenant_ids(tenant_ids).listening(event_name);
        self.dispatch(SendRequest::new(audience, event_name, body)).await
    }
}
