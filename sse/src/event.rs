use axum::response::sse::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Sent right after a connection is registered.
pub const CONNECT_FINISH: &str = "connect-finish";
/// Best-effort frame sent while a connection is being torn down.
pub const CONNECT_CLOSE: &str = "connect-close";

/// One frame on the push stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl PushEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            id: None,
            name: Some(name.into()),
            retry: None,
            comment: None,
            data,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = Some(retry.as_millis() as u64);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Payload as it appears after `data:`; strings are sent raw, everything
    /// else as JSON.
    pub fn data_text(&self) -> String {
        match &self.data {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Renders the text event-stream frame, blank line included.
impl fmt::Display for PushEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(comment) = &self.comment {
            writeln!(f, ":{comment}")?;
        }
        if let Some(id) = &self.id {
            writeln!(f, "id:{id}")?;
        }
        if let Some(name) = &self.name {
            writeln!(f, "event:{name}")?;
        }
        if let Some(retry) = self.retry {
            writeln!(f, "retry:{retry}")?;
        }
        for line in self.data_text().split('\n') {
            writeln!(f, "data:{line}")?;
        }
        writeln!(f)
    }
}

impl From<&PushEvent> for Event {
    fn from(push: &PushEvent) -> Self {
        let mut event = Event::default().data(push.data_text());
        if let Some(comment) = &push.comment {
            event = event.comment(comment);
        }
        if let Some(id) = &push.id {
            event = event.id(id);
        }
        if let Some(name) = &push.name {
            event = event.event(name);
        }
        if let Some(retry) = push.retry {
            event = event.retry(Duration::from_millis(retry));
        }
        event
    }
}

impl From<PushEvent> for Event {
    fn from(push: PushEvent) -> Self {
        Event::from(&push)
    }
}
