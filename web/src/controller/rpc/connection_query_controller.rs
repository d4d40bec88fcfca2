use super::envelope;
use crate::{AppState, Result};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde_json::Value;
use sse::cluster::wire::RemoteResponse;
use sse::error::invalid_target;
use std::collections::HashMap;

/// GET `ConnectionQueryService/{method}`
pub async fn query(
    State(app_state): State<AppState>,
    Path(method): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<RemoteResponse>> {
    let registry = app_state.manager.registry();
    let param = |name: &str| params.get(name).map(String::as_str).unwrap_or_default();

    let response = match method.as_str() {
        "isOnline" => envelope(registry.is_online(param("userId")))?,
        "getUser" => match registry.get_user(param("userId")) {
            Some(user) => {
                let kind = Some(user.kind.clone());
                RemoteResponse::typed(serde_json::to_value(user)?, kind)
            }
            None => RemoteResponse::new(Value::Null),
        },
        "users" => envelope(registry.users())?,
        "usersByListening" => envelope(registry.users_by_listening(param("listener")))?,
        "usersByTenantListening" => envelope(
            registry.users_by_tenant_listening(param("tenantId"), param("listener")),
        )?,
        "userIds" => envelope(registry.user_ids())?,
        "userIdsByListening" => envelope(registry.user_ids_by_listening(param("listener")))?,
        "userIdsByTenantListening" => envelope(
            registry.user_ids_by_tenant_listening(param("tenantId"), param("listener")),
        )?,
        "accessTokens" => envelope(registry.access_tokens())?,
        "tenantIds" => envelope(registry.tenant_ids())?,
        "channels" => envelope(registry.channels())?,
        "accessTokenCount" => envelope(registry.access_token_count())?,
        "userCount" => envelope(registry.user_count())?,
        "connectionCount" => envelope(registry.connection_count())?,
        "connections" => envelope(registry.connections())?,
        other => return Err(invalid_target(&format!("unknown query method {other}")).into()),
    };
    Ok(Json(response))
}
