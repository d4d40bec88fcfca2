use axum::http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use log::*;
use service::config::Config;
use sse::access_user::TypeRegistry;
use sse::cluster::discovery::{DiscoveryOptions, ServiceDiscovery, StaticServiceDiscovery};
use sse::cluster::remote::RemoteTimeouts;
use sse::cluster::ClusterConnectionService;
use sse::qos::{
    AtLeastOnceDelivery, ClusterMessageRepository, MemoryMessageRepository, MessageRepository,
};
use sse::Manager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

mod controller;
mod error;
mod middleware;
mod params;
mod router;
mod stream;

pub use error::{Error, Result};

// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub manager: Arc<Manager>,
    pub cluster: Option<Arc<ClusterConnectionService>>,
    pub delivery: Arc<AtLeastOnceDelivery>,
    pub repository: Arc<dyn MessageRepository>,
    pub discovery: Arc<StaticServiceDiscovery>,
}

impl AppState {
    /// Wires the push core for `config`: a local node, or a cluster member when
    /// `cluster_enabled` is set.
    pub fn build(config: Config) -> sse::error::Result<Self> {
        let manager = Arc::new(
            Manager::new()
                .reconnect_time(config.reconnect_time())
                .server_name(config.server_name.clone()),
        );
        let repository: Arc<dyn MessageRepository> =
            Arc::new(MemoryMessageRepository::new(config.qos_repository_capacity));

        let discovery = Arc::new(StaticServiceDiscovery::new(DiscoveryOptions {
            account: config.cluster_account().to_string(),
            password: config.cluster_password().to_string(),
            timeouts: RemoteTimeouts {
                connect: config.remote_connect_timeout(),
                read: config.remote_read_timeout(),
            },
            types: Arc::new(TypeRegistry::with_defaults()),
            connection_auto_type: config.connection_auto_type,
        }));

        let (cluster, delivery) = if config.cluster_enabled {
            let interface = config.interface.as_deref().unwrap_or("127.0.0.1");
            discovery.register_instance(interface, config.port);
            discovery.replace_peers(&config.cluster_peers)?;
            let shared: Arc<dyn ServiceDiscovery> = discovery.clone();
            let cluster = Arc::new(ClusterConnectionService::new(
                Arc::clone(&manager),
                Arc::clone(&shared),
            ));
            let cluster_repository = Arc::new(ClusterMessageRepository::new(
                Arc::clone(&repository),
                shared,
            ));
            info!("Cluster mode enabled with {} configured peers", config.cluster_peers.len());
            let delivery = AtLeastOnceDelivery::clustered(Arc::clone(&cluster), cluster_repository);
            (Some(cluster), delivery)
        } else {
            let delivery = AtLeastOnceDelivery::new(Arc::clone(&manager), Arc::clone(&repository));
            (None, delivery)
        };

        Ok(Self {
            config,
            manager,
            cluster,
            delivery,
            repository,
            discovery,
        })
    }

    /// Closes every connection, drops stored messages and releases peer clients.
    pub fn shutdown(&self) {
        let closed = self.manager.shutdown();
        self.repository.close();
        self.discovery.destroy();
        info!("Push server stopped, {closed} connections closed");
    }
}

pub async fn init_server(app_state: AppState) -> std::io::Result<()> {
    let interface = app_state
        .config
        .interface
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let listen_addr = format!("{}:{}", interface, app_state.config.port);

    info!("Server starting... listening for connections on http://{listen_addr}");

    let origins: Vec<HeaderValue> = app_state
        .config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors_layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_credentials(true)
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_origin(origins);

    let listener = TcpListener::bind(listen_addr).await?;
    let app = router::define_routes(app_state.clone()).layer(cors_layer);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    app_state.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use clap::Parser;

    pub(crate) const ACCOUNT: &str = "node";
    pub(crate) const PASSWORD: &str = "secret";

    pub(crate) fn app_state() -> AppState {
        let config = Config::try_parse_from([
            "web",
            "--cluster-account",
            ACCOUNT,
            "--cluster-password",
            PASSWORD,
        ])
        .unwrap();
        AppState::build(config).unwrap()
    }
}
