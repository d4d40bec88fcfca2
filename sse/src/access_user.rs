//! The identity a connection is opened under, and the rules for rebuilding it
//! from a peer's response.
//!
//! Every serialized `AccessUser` carries an explicit `@type` discriminator.
//! Remote payloads are only ever reconstructed into a typed value when their
//! discriminator is present in an injected [`TypeRegistry`]; anything else is
//! either rejected or kept as a plain JSON map, depending on [`AutoType`].

use crate::error::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const ACCESS_USER_TYPE: &str = "access-user";
pub const TENANT_ACCESS_USER_TYPE: &str = "tenant-access-user";
const TYPE_FIELD: &str = "@type";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessUser {
    #[serde(rename = "@type")]
    pub kind: String,
    pub id: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, flatten)]
    pub attributes: Map<String, Value>,
}

impl AccessUser {
    pub fn new(id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            kind: ACCESS_USER_TYPE.to_string(),
            id: id.into(),
            access_token: access_token.into(),
            tenant_id: None,
            name: None,
            attributes: Map::new(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.kind = TENANT_ACCESS_USER_TYPE.to_string();
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// How a peer's user payload is turned back into a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutoType {
    /// Never reconstruct; always return the raw map.
    Disabled,
    /// Reconstruct, failing the call when the discriminator is unknown or invalid.
    ReconstructOrThrow,
    /// Reconstruct when possible, otherwise fall back to the raw map.
    ReconstructOrMap,
}

#[derive(Debug, PartialEq, Eq)]
pub struct AutoTypeParseError;

impl FromStr for AutoType {
    type Err = AutoTypeParseError;

    fn from_str(value: &str) -> core::result::Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "disabled" => Ok(AutoType::Disabled),
            "reconstruct-or-throw" => Ok(AutoType::ReconstructOrThrow),
            "reconstruct-or-map" => Ok(AutoType::ReconstructOrMap),
            _ => Err(AutoTypeParseError),
        }
    }
}

impl fmt::Display for AutoType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AutoType::Disabled => write!(f, "disabled"),
            AutoType::ReconstructOrThrow => write!(f, "reconstruct-or-throw"),
            AutoType::ReconstructOrMap => write!(f, "reconstruct-or-map"),
        }
    }
}

/// A user returned by a peer: either reconstructed or left as a map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteUser {
    Typed(AccessUser),
    Untyped(Map<String, Value>),
}

impl RemoteUser {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            RemoteUser::Typed(user) => Some(user.id.as_str()),
            RemoteUser::Untyped(map) => map.get("id").and_then(Value::as_str),
        }
    }
}

impl From<AccessUser> for RemoteUser {
    fn from(user: AccessUser) -> Self {
        RemoteUser::Typed(user)
    }
}

type Validator = Arc<dyn Fn(&AccessUser) -> bool + Send + Sync>;

/// Allow-list of `@type` discriminators that may be reconstructed.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    validators: HashMap<String, Validator>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that accepts the two built-in user shapes.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ACCESS_USER_TYPE, |_| true);
        registry.register(TENANT_ACCESS_USER_TYPE, |user| user.tenant_id.is_some());
        registry
    }

    pub fn register<F>(&mut self, kind: &str, validator: F)
    where
        F: Fn(&AccessUser) -> bool + Send + Sync + 'static,
    {
        self.validators.insert(kind.to_string(), Arc::new(validator));
    }

    pub fn is_allowed(&self, kind: &str) -> bool {
        self.validators.contains_key(kind)
    }

    pub fn reconstruct(&self, value: Value, policy: AutoType) -> Result<RemoteUser> {
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(Error::new(
                    ErrorKind::TypeReconstruction,
                    &format!("expected a user object, got {other}"),
                ))
            }
        };

        if policy == AutoType::Disabled {
            return Ok(RemoteUser::Untyped(map));
        }

        match self.try_typed(&map) {
            Ok(user) => Ok(RemoteUser::Typed(user)),
            Err(e) if policy == AutoType::ReconstructOrThrow => Err(e),
            Err(e) => {
                log::debug!("Falling back to untyped user payload: {e}");
                Ok(RemoteUser::Untyped(map))
            }
        }
    }

    pub fn reconstruct_all(&self, values: Vec<Value>, policy: AutoType) -> Result<Vec<RemoteUser>> {
        values
            .into_iter()
            .map(|value| self.reconstruct(value, policy))
            .collect()
    }

    fn try_typed(&self, map: &Map<String, Value>) -> Result<AccessUser> {
        let kind = map
            .get(TYPE_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::new(ErrorKind::TypeReconstruction, "missing @type"))?;
        let validator = self.validators.get(kind).ok_or_else(|| {
            Error::new(
                ErrorKind::TypeReconstruction,
                &format!("@type {kind} is not registered"),
            )
        })?;
        let user: AccessUser = serde_json::from_value(Value::Object(map.clone())).map_err(|e| {
            Error {
                source: Some(Box::new(e)),
                error_kind: ErrorKind::TypeReconstruction,
            }
        })?;
        if validator(&user) {
            Ok(user)
        } else {
            Err(Error::new(
                ErrorKind::TypeReconstruction,
                &format!("payload rejected by validator for {kind}"),
            ))
        }
    }
}
