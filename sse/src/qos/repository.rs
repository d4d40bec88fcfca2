use crate::connection::ConnectionDto;
use crate::error::{closed_error, Result};
use crate::message::{Addressable, Message};
use log::*;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const DEFAULT_CAPACITY: usize = 4096;

/// Called whenever a message leaves the repository. `delivered_to` is the
/// connection that received it, or `None` if it was dropped undelivered.
pub type DeleteListener = Arc<dyn Fn(&Message, Option<&ConnectionDto>) + Send + Sync>;

/// Store of messages waiting for at-least-once delivery.
pub trait MessageRepository: Send + Sync {
    fn id(&self) -> &str;

    fn insert(&self, message: Message) -> Result<String>;

    /// Messages whose audience matches `target`, oldest first.
    fn select(&self, target: &dyn Addressable) -> Vec<Message>;

    fn delete(&self, id: &str, delivered_to: Option<ConnectionDto>) -> Option<Message>;

    fn contains(&self, id: &str) -> bool;

    fn list(&self) -> Vec<Message>;

    fn add_delete_listener(&self, listener: DeleteListener);

    fn close(&self);
}

/// Bounded in-memory repository. When full, the oldest message is evicted.
pub struct MemoryMessageRepository {
    id: String,
    capacity: usize,
    messages: Mutex<VecDeque<Message>>,
    delete_listeners: RwLock<Vec<DeleteListener>>,
    closed: AtomicBool,
}

impl MemoryMessageRepository {
    pub fn new(capacity: usize) -> Self {
        Self::with_id(format!("repository-{}", uuid::Uuid::new_v4()), capacity)
    }

    pub fn with_id(id: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            capacity: capacity.max(1),
            messages: Mutex::new(VecDeque::new()),
            delete_listeners: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    fn notify_deleted(&self, message: &Message, delivered_to: Option<&ConnectionDto>) {
        let listeners = self.delete_listeners.read().clone();
        for listener in listeners {
            listener(message, delivered_to);
        }
    }
}

impl Default for MemoryMessageRepository {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MessageRepository for MemoryMessageRepository {
    fn id(&self) -> &str {
        &self.id
    }

    fn insert(&self, message: Message) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error(&format!("message repository {} is closed", self.id)));
        }
        let id = message.id.clone();
        let evicted = {
            let mut messages = self.messages.lock();
            let evicted = if messages.len() >= self.capacity {
                messages.pop_front()
            } else {
                None
            };
            messages.push_back(message);
            evicted
        };
        if let Some(evicted) = evicted {
            warn!(
                "Message repository {} full ({}), evicted oldest message {}",
                self.id, self.capacity, evicted.id
            );
            self.notify_deleted(&evicted, None);
        }
        Ok(id)
    }

    fn select(&self, target: &dyn Addressable) -> Vec<Message> {
        self.messages
            .lock()
            .iter()
            .filter(|message| message.audience.matches(target))
            .cloned()
            .collect()
    }

    fn delete(&self, id: &str, delivered_to: Option<ConnectionDto>) -> Option<Message> {
        let removed = {
            let mut messages = self.messages.lock();
            let index = messages.iter().position(|m| m.id == id)?;
            messages.remove(index)
        };
        if let Some(message) = &removed {
            self.notify_deleted(message, delivered_to.as_ref());
        }
        removed
    }

    fn contains(&self, id: &str) -> bool {
        self.messages.lock().iter().any(|m| m.id == id)
    }

    fn list(&self) -> Vec<Message> {
        self.messages.lock().iter().cloned().collect()
    }

    fn add_delete_listener(&self, listener: DeleteListener) {
        self.delete_listeners.write().push(listener);
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let dropped = std::mem::take(&mut *self.messages.lock());
            info!(
                "Message repository {} closed with {} pending messages",
                self.id,
                dropped.len()
            );
            for message in &dropped {
                self.notify_deleted(message, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Audience, ConnectionQuery};
    use serde_json::json;

    fn message(token: &str) -> Message {
        Message::new("e", json!(token), Audience::access_tokens(vec![token.to_string()]))
    }

    fn query(token: &str) -> ConnectionQuery {
        ConnectionQuery {
            access_token: token.to_string(),
            user_id: "u".to_string(),
            tenant_id: None,
            channel: None,
            listeners: Vec::new(),
        }
    }

    #[test]
    fn select_returns_matching_messages_oldest_first() {
        let repository = MemoryMessageRepository::default();
        let first = repository.insert(message("t1")).unwrap();
        repository.insert(message("t2")).unwrap();
        let second = repository.insert(message("t1")).unwrap();

        let selected: Vec<String> = repository
            .select(&query("t1"))
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(selected, vec![first, second]);
    }

    #[test]
    fn full_repository_evicts_oldest_and_reports_it() {
        let repository = MemoryMessageRepository::with_id("r", 2);
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let log = evicted.clone();
        repository.add_delete_listener(Arc::new(move |m: &Message, delivered: Option<&ConnectionDto>| {
            assert!(delivered.is_none());
            log.lock().push(m.id.clone());
        }));

        let oldest = repository.insert(message("t1")).unwrap();
        repository.insert(message("t2")).unwrap();
        repository.insert(message("t3")).unwrap();

        assert_eq!(repository.len(), 2);
        assert!(!repository.contains(&oldest));
        assert_eq!(*evicted.lock(), vec![oldest]);
    }

    #[test]
    fn delete_removes_once_and_notifies_with_receiver() {
        let repository = MemoryMessageRepository::default();
        let id = repository.insert(message("t1")).unwrap();
        let notified = Arc::new(Mutex::new(0));
        let counter = notified.clone();
        repository.add_delete_listener(Arc::new(move |_: &Message, delivered: Option<&ConnectionDto>| {
            assert!(delivered.is_some());
            *counter.lock() += 1;
        }));

        let dto = sample_dto();
        assert!(repository.delete(&id, Some(dto.clone())).is_some());
        assert!(repository.delete(&id, Some(dto)).is_none());
        assert_eq!(*notified.lock(), 1);
        assert!(repository.is_empty());
    }

    #[test]
    fn closed_repository_rejects_inserts() {
        let repository = MemoryMessageRepository::default();
        repository.insert(message("t1")).unwrap();
        repository.close();
        assert!(repository.list().is_empty());
        assert!(repository.insert(message("t1")).is_err());
    }

    fn sample_dto() -> ConnectionDto {
        use crate::access_user::AccessUser;
        use crate::connection::{ConnectRequest, Connection, ConnectionId};
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        Connection::new(
            ConnectionId::new(1),
            ConnectRequest::new(AccessUser::new("u", "t1")),
            tx,
        )
        .to_dto()
    }
}
