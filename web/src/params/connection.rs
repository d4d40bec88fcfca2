use serde::Deserialize;

/// Query string of `GET /sse/connect`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConnectParams {
    pub(crate) access_token: String,
    pub(crate) user_id: String,
    pub(crate) tenant_id: Option<String>,
    pub(crate) channel: Option<String>,
    /// Comma separated event names.
    pub(crate) listeners: Option<String>,
    pub(crate) keepalive_ms: Option<u64>,
}

impl ConnectParams {
    pub(crate) fn listener_names(&self) -> Vec<String> {
        self.listeners
            .as_deref()
            .map(|names| {
                names
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListenersParams {
    pub(crate) connection_id: u64,
    pub(crate) listeners: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DisconnectParams {
    pub(crate) connection_id: u64,
}
