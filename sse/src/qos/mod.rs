//! Quality of service: messages that reach no connection are stored and
//! resent when a matching connection shows up.

pub mod cluster_repository;
pub mod delivery;
pub mod repository;

pub use cluster_repository::{ClusterMessageRepository, HttpRemoteMessageRepository, RemoteMessageRepository};
pub use delivery::{AtLeastOnceDelivery, PendingDelivery};
pub use repository::{MemoryMessageRepository, MessageRepository};

#[cfg(test)]
pub(crate) mod testing {
    //! A peer repository backed by an in-memory store.

    use super::cluster_repository::RemoteMessageRepository;
    use super::repository::{MemoryMessageRepository, MessageRepository};
    use crate::connection::ConnectionDto;
    use crate::error::{Error, ErrorKind, Result};
    use crate::message::{ConnectionQuery, Message};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    pub(crate) struct FakeRemoteRepository {
        id: String,
        pub(crate) store: MemoryMessageRepository,
        reachable: bool,
        pub(crate) deletes: Mutex<Vec<String>>,
    }

    impl FakeRemoteRepository {
        pub(crate) fn new(id: &str, reachable: bool) -> Self {
            Self {
                id: id.to_string(),
                store: MemoryMessageRepository::with_id(id, 16),
                reachable,
                deletes: Mutex::new(Vec::new()),
            }
        }

        fn check(&self) -> Result<()> {
            if self.reachable {
                Ok(())
            } else {
                Err(Error::new(ErrorKind::PeerUnreachable, "down"))
            }
        }
    }

    #[async_trait]
    impl RemoteMessageRepository for FakeRemoteRepository {
        fn id(&self) -> &str {
            &self.id
        }

        async fn insert(&self, message: &Message) -> Result<String> {
            self.check()?;
            self.store.insert(message.clone())
        }

        async fn select(&self, query: &ConnectionQuery) -> Result<Vec<Message>> {
            self.check()?;
            let mut messages = self.store.select(query);
            for m in &mut messages {
                m.repository_id = Some(self.id.clone());
            }
            Ok(messages)
        }

        async fn list(&self) -> Result<Vec<Message>> {
            self.check()?;
            Ok(self.store.list())
        }

        async fn delete(&self, id: &str, delivered_to: Option<ConnectionDto>) -> Result<Option<Message>> {
            self.check()?;
            self.deletes.lock().push(id.to_string());
            Ok(self.store.delete(id, delivered_to))
        }

        fn close(&self) {}
    }
}
