//! The discovery contract the cluster layer consumes, and a static
//! implementation driven by configuration.

use crate::access_user::{AutoType, TypeRegistry};
use crate::cluster::remote::{
    basic_authorization, HttpRemoteConnectionService, RemoteConnectionService, RemotePeer,
    RemoteTimeouts,
};
use crate::error::Result;
use crate::qos::cluster_repository::{HttpRemoteMessageRepository, RemoteMessageRepository};
use crate::reference_counted::ReferenceCounted;
use log::*;
use parking_lot::RwLock;
use std::sync::Arc;

pub type RemoteServiceList = Vec<Arc<dyn RemoteConnectionService>>;
pub type RemoteRepositoryList = Vec<Arc<dyn RemoteMessageRepository>>;

/// The authenticated caller of a cluster RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub account: String,
}

pub trait ServiceDiscovery: Send + Sync {
    /// Current peer connection services. Check out before use.
    fn connection_service_list_ref(&self) -> Arc<ReferenceCounted<RemoteServiceList>>;

    /// Current peer message repositories. Check out before use.
    fn message_repository_list_ref(&self) -> Arc<ReferenceCounted<RemoteRepositoryList>>;

    /// Announces this node under `ip:port`.
    fn register_instance(&self, ip: &str, port: u16);

    /// Validates an `Authorization` header value from a peer.
    fn login(&self, authorization: &str) -> Option<Principal>;
}

#[derive(Clone)]
pub struct DiscoveryOptions {
    pub account: String,
    pub password: String,
    pub timeouts: RemoteTimeouts,
    pub types: Arc<TypeRegistry>,
    pub connection_auto_type: AutoType,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            account: String::new(),
            password: String::new(),
            timeouts: RemoteTimeouts::default(),
            types: Arc::new(TypeRegistry::with_defaults()),
            connection_auto_type: AutoType::ReconstructOrThrow,
        }
    }
}

/// Discovery over a fixed list of peer base URLs.
///
/// [`StaticServiceDiscovery::replace_peers`] swaps in new lists; the old ones
/// are retired and their clients closed once every in-flight aggregation has
/// checked them back in.
pub struct StaticServiceDiscovery {
    options: DiscoveryOptions,
    self_url: RwLock<Option<String>>,
    connection_services: RwLock<Arc<ReferenceCounted<RemoteServiceList>>>,
    message_repositories: RwLock<Arc<ReferenceCounted<RemoteRepositoryList>>>,
}

impl StaticServiceDiscovery {
    pub fn new(options: DiscoveryOptions) -> Self {
        Self {
            options,
            self_url: RwLock::new(None),
            connection_services: RwLock::new(Arc::new(ReferenceCounted::new(Vec::new()))),
            message_repositories: RwLock::new(Arc::new(ReferenceCounted::new(Vec::new()))),
        }
    }

    /// Rebuilds the peer clients for `base_urls`, skipping this node's own url.
    pub fn replace_peers(&self, base_urls: &[String]) -> Result<()> {
        let self_url = self.self_url.read().clone();
        let mut services: RemoteServiceList = Vec::new();
        let mut repositories: RemoteRepositoryList = Vec::new();
        for base_url in base_urls {
            if self_url.as_deref() == Some(base_url.trim_end_matches('/')) {
                continue;
            }
            let peer = RemotePeer::new(
                base_url.clone(),
                self.options.account.clone(),
                self.options.password.clone(),
            );
            services.push(Arc::new(HttpRemoteConnectionService::new(
                &peer,
                self.options.timeouts,
                Arc::clone(&self.options.types),
                self.options.connection_auto_type,
            )?));
            repositories.push(Arc::new(HttpRemoteMessageRepository::new(
                &peer,
                self.options.timeouts,
            )?));
        }
        info!("Cluster peers updated: {} remote nodes", services.len());
        self.replace_lists(services, repositories);
        Ok(())
    }

    /// Installs new lists and retires the previous ones.
    pub fn replace_lists(&self, services: RemoteServiceList, repositories: RemoteRepositoryList) {
        let previous_services = std::mem::replace(
            &mut *self.connection_services.write(),
            Arc::new(ReferenceCounted::new(services)),
        );
        let previous_repositories = std::mem::replace(
            &mut *self.message_repositories.write(),
            Arc::new(ReferenceCounted::new(repositories)),
        );
        previous_services.destroy(|list| {
            for service in list {
                service.close();
            }
        });
        previous_repositories.destroy(|list| {
            for repository in list {
                repository.close();
            }
        });
    }

    /// Retires the current lists without replacement.
    pub fn destroy(&self) {
        self.replace_lists(Vec::new(), Vec::new());
    }
}

impl ServiceDiscovery for StaticServiceDiscovery {
    fn connection_service_list_ref(&self) -> Arc<ReferenceCounted<RemoteServiceList>> {
        Arc::clone(&self.connection_services.read())
    }

    fn message_repository_list_ref(&self) -> Arc<ReferenceCounted<RemoteRepositoryList>> {
        Arc::clone(&self.message_repositories.read())
    }

    fn register_instance(&self, ip: &str, port: u16) {
        let url = format!("http://{ip}:{port}");
        info!("Registered cluster instance {url}");
        *self.self_url.write() = Some(url);
    }

    fn login(&self, authorization: &str) -> Option<Principal> {
        if self.options.account.is_empty() {
            return None;
        }
        let expected = basic_authorization(&self.options.account, &self.options.password);
        if authorization.trim() == expected {
            Some(Principal {
                account: self.options.account.clone(),
            })
        } else {
            None
        }
    }
}
