//! Cluster mode: peer discovery, the HTTP peer clients and the map-reduce
//! service that fans every call out to them.

pub mod aggregate;
pub mod discovery;
pub mod remote;
pub mod service;
pub mod wire;

pub use aggregate::{AggregateOptions, Combiner};
pub use discovery::{ServiceDiscovery, StaticServiceDiscovery};
pub use remote::{HttpRemoteConnectionService, RemoteConnectionService, RemotePeer};
pub use service::ClusterConnectionService;
