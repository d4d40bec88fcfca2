//! Request and response shapes of the cluster RPC surface.
//!
//! Reads go to `GET {base}/ConnectionQueryService/{method}`, sends to
//! `POST {base}/SendService/{method}`, disconnects to
//! `POST {base}/RemoteConnectionService/{method}` and the message store to
//! `POST {base}/MessageRepository/{method}`. Every response is wrapped in
//! [`RemoteResponse`].

use crate::error::{invalid_target, Result};
use crate::message::{Audience, Filters};
use crate::send::{SendRequest, WriteScope};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONNECTION_QUERY_SERVICE: &str = "ConnectionQueryService";
pub const SEND_SERVICE: &str = "SendService";
pub const REMOTE_CONNECTION_SERVICE: &str = "RemoteConnectionService";
pub const MESSAGE_REPOSITORY: &str = "MessageRepository";

pub const SEND_BY_AUDIENCE: &str = "sendByAudience";

/// Envelope around every RPC answer. `type` carries the `@type` of a user
/// payload when the answer is a single user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse {
    #[serde(default)]
    pub data: Value,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl RemoteResponse {
    pub fn new(data: Value) -> Self {
        Self { data, kind: None }
    }

    pub fn typed(data: Value, kind: Option<String>) -> Self {
        Self { data, kind }
    }

    /// Fills in a missing `@type` on `data` from the envelope's `type`.
    pub fn into_hinted_data(self) -> Value {
        match (self.data, self.kind) {
            (Value::Object(mut map), Some(kind)) => {
                map.entry("@type").or_insert(Value::String(kind));
                Value::Object(map)
            }
            (data, _) => data,
        }
    }
}

/// JSON body of a `SendService` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSendBody {
    pub event_name: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_tokens: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_ids: Option<Vec<String>>,
    /// Full addressing for `sendByAudience`, used when no single target fits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<Audience>,
    #[serde(default)]
    pub scope_on_writeable: bool,
    /// Answer with the receiving connections instead of a count.
    #[serde(default)]
    pub collect: bool,
}

/// JSON body of a `RemoteConnectionService` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDisconnectBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Maps a send request onto its `SendService` method name and body. Combined
/// filters, or a listener name other than the event name, go out as
/// `sendByAudience`.
pub fn encode_send(request: &SendRequest, collect: bool) -> Result<(&'static str, RemoteSendBody)> {
    let audience = &request.audience;
    let listening = audience.filters.contains(Filters::LISTENER_NAME);
    let base = Filters::from_bits(audience.filters.bits() & !Filters::LISTENER_NAME.bits());

    let mut body = RemoteSendBody {
        event_name: request.event_name.clone(),
        body: request.body.clone(),
        scope_on_writeable: request.scope == WriteScope::WriteableOnly,
        collect,
        ..RemoteSendBody::default()
    };
    if listening && audience.listener_name.as_deref() != Some(request.event_name.as_str()) {
        body.audience = Some(audience.clone());
        return Ok((SEND_BY_AUDIENCE, body));
    }
    let method = match (base, listening) {
        (Filters::NONE, false) => "sendAll",
        (Filters::NONE, true) => "sendAllListening",
        (Filters::CHANNEL, l) => {
            body.channels = Some(audience.channels.clone());
            if l { "sendByChannelListening" } else { "sendByChannel" }
        }
        (Filters::ACCESS_TOKEN, l) => {
            body.access_tokens = Some(audience.access_tokens.clone());
            if l { "sendByAccessTokenListening" } else { "sendByAccessToken" }
        }
        (Filters::USER_ID, l) => {
            body.user_ids = Some(audience.user_ids.clone());
            if l { "sendByUserIdListening" } else { "sendByUserId" }
        }
        (Filters::TENANT, l) => {
            body.tenant_ids = Some(audience.tenant_ids.clone());
            if l { "sendByTenantIdListening" } else { "sendByTenantId" }
        }
        _ => {
            body.audience = Some(audience.clone());
            SEND_BY_AUDIENCE
        }
    };
    Ok((method, body))
}

/// Rebuilds a send request from a `SendService` method name and body.
pub fn decode_send(method: &str, body: RemoteSendBody) -> Result<SendRequest> {
    let scope = if body.scope_on_writeable {
        WriteScope::WriteableOnly
    } else {
        WriteScope::Any
    };
    if method == SEND_BY_AUDIENCE {
        let audience = body
            .audience
            .ok_or_else(|| invalid_target(&format!("{method} requires audience")))?;
        return Ok(SendRequest::new(audience, body.event_name, body.body).scoped(scope));
    }
    let (base, listening) = match method.strip_suffix("Listening") {
        Some(base) => (base, true),
        None => (method, false),
    };
    let missing = |field: &str| invalid_target(&format!("{method} requires {field}"));
    let audience = match base {
        "sendAll" => Audience::all(),
        "sendByChannel" => Audience::channels(body.channels.ok_or_else(|| missing("channels"))?),
        "sendByAccessToken" => {
            Audience::access_tokens(body.access_tokens.ok_or_else(|| missing("accessTokens"))?)
        }
        "sendByUserId" => Audience::user_ids(body.user_ids.ok_or_else(|| missing("userIds"))?),
        "sendByTenantId" => {
            Audience::tenant_ids(body.tenant_ids.ok_or_else(|| missing("tenantIds"))?)
        }
        _ => return Err(invalid_target(&format!("unknown send method {method}"))),
    };
    let audience = if listening {
        audience.listening(body.event_name.clone())
    } else {
        audience
    };
    Ok(SendRequest::new(audience, body.event_name, body.body).scoped(scope))
}
