//! Addressing: which connections a send or a pending message targets.
//!
//! Direct sends and the at-least-once resend path both decide eligibility
//! through [`Audience::matches`], so the two can never disagree.

use crate::connection::Connection;
use crate::event::PushEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::{BitOr, BitOrAssign};

/// Bitmask of the addressing dimensions that must match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filters(u8);

impl Filters {
    pub const NONE: Filters = Filters(0);
    pub const TENANT: Filters = Filters(1 << 1);
    pub const ACCESS_TOKEN: Filters = Filters(1 << 2);
    pub const USER_ID: Filters = Filters(1 << 3);
    pub const LISTENER_NAME: Filters = Filters(1 << 4);
    pub const CHANNEL: Filters = Filters(1 << 5);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Filters(bits)
    }

    pub fn contains(self, other: Filters) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Filters {
    type Output = Filters;

    fn bitor(self, rhs: Filters) -> Filters {
        Filters(self.0 | rhs.0)
    }
}

impl BitOrAssign for Filters {
    fn bitor_assign(&mut self, rhs: Filters) {
        self.0 |= rhs.0;
    }
}

/// The identity fields addressing is evaluated against.
pub trait Addressable {
    fn access_token(&self) -> &str;
    fn user_id(&self) -> &str;
    fn tenant_id(&self) -> Option<&str>;
    fn channel(&self) -> Option<&str>;
    fn is_listening(&self, name: &str) -> bool;
}

impl Addressable for Connection {
    fn access_token(&self) -> &str {
        Connection::access_token(self)
    }

    fn user_id(&self) -> &str {
        Connection::user_id(self)
    }

    fn tenant_id(&self) -> Option<&str> {
        Connection::tenant_id(self)
    }

    fn channel(&self) -> Option<&str> {
        Connection::channel(self)
    }

    fn is_listening(&self, name: &str) -> bool {
        Connection::is_listening(self, name)
    }
}

/// A connection's identity detached from the connection, so a peer can select
/// pending messages for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionQuery {
    pub access_token: String,
    pub user_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub listeners: Vec<String>,
}

impl From<&Connection> for ConnectionQuery {
    fn from(connection: &Connection) -> Self {
        Self {
            access_token: connection.access_token().to_string(),
            user_id: connection.user_id().to_string(),
            tenant_id: connection.tenant_id().map(str::to_string),
            channel: connection.channel().map(str::to_string),
            listeners: connection.listeners(),
        }
    }
}

impl Addressable for ConnectionQuery {
    fn access_token(&self) -> &str {
        &self.access_token
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    fn is_listening(&self, name: &str) -> bool {
        self.listeners.iter().any(|l| l == name)
    }
}

/// Which connections a send targets. An empty filter set targets everyone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audience {
    pub filters: Filters,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tenant_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_name: Option<String>,
}

impl Audience {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn channels(channels: Vec<String>) -> Self {
        Self {
            filters: Filters::CHANNEL,
            channels,
            ..Self::default()
        }
    }

    pub fn access_tokens(access_tokens: Vec<String>) -> Self {
        Self {
            filters: Filters::ACCESS_TOKEN,
            access_tokens,
            ..Self::default()
        }
    }

    pub fn user_ids(user_ids: Vec<String>) -> Self {
        Self {
            filters: Filters::USER_ID,
            user_ids,
            ..Self::default()
        }
    }

    pub fn tenant_ids(tenant_ids: Vec<String>) -> Self {
        Self {
            filters: Filters::TENANT,
            tenant_ids,
            ..Self::default()
        }
    }

    /// Additionally require the target to listen for `name`.
    pub fn listening(mut self, name: impl Into<String>) -> Self {
        self.filters |= Filters::LISTENER_NAME;
        self.listener_name = Some(name.into());
        self
    }

    pub fn matches(&self, target: &dyn Addressable) -> bool {
        let filters = self.filters;
        if filters.contains(Filters::TENANT)
            && !target.tenant_id().is_some_and(|tenant| contains(&self.tenant_ids, tenant))
        {
            return false;
        }
        if filters.contains(Filters::ACCESS_TOKEN)
            && !contains(&self.access_tokens, target.access_token())
        {
            return false;
        }
        if filters.contains(Filters::USER_ID) && !contains(&self.user_ids, target.user_id()) {
            return false;
        }
        if filters.contains(Filters::CHANNEL)
            && !target.channel().is_some_and(|channel| contains(&self.channels, channel))
        {
            return false;
        }
        if filters.contains(Filters::LISTENER_NAME)
            && !self.listener_name.as_deref().is_some_and(|name| target.is_listening(name))
        {
            return false;
        }
        true
    }
}

fn contains(values: &[String], key: &str) -> bool {
    values.iter().any(|v| v == key)
}

/// A message waiting for at-least-once delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub event_name: String,
    #[serde(default)]
    pub body: Value,
    pub audience: Audience,
    pub created_at: DateTime<Utc>,
    /// Id of the repository holding the message; set when read from a cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
}

impl Message {
    pub fn new(event_name: impl Into<String>, body: Value, audience: Audience) -> Self {
        Self {
            id: format!("qos-{}", uuid::Uuid::new_v4()),
            event_name: event_name.into(),
            body,
            audience,
            created_at: Utc::now(),
            repository_id: None,
        }
    }

    pub fn to_push_event(&self) -> PushEvent {
        PushEvent::new(self.event_name.clone(), self.body.clone())
            .with_id(self.id.clone())
            .with_comment("resend")
    }
}
