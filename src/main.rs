use log::*;
use service::{config::Config, logging::Logger};
use web::AppState;

#[tokio::main]
async fn main() {
    let config = Config::new();
    if let Err(e) = Logger::init_logger(&config) {
        eprintln!("Failed to start logger: {e}");
    }

    info!(
        "Starting push server [{}] in {} mode",
        config.server_name,
        if config.cluster_enabled { "cluster" } else { "standalone" }
    );

    let app_state = match AppState::build(config) {
        Ok(app_state) => app_state,
        Err(e) => {
            error!("Failed to wire the push core: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = web::init_server(app_state).await {
        error!("Server stopped with error: {e}");
        std::process::exit(1);
    }
}
