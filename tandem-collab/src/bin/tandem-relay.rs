//! Standalone relay server. Configured from `TANDEM_*` environment
//! variables; logging via `RUST_LOG`.

use log::info;
use tandem_collab::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting tandem-relay on {} (rooms under {}, idle timeout {}ms)",
        config.bind_addr,
        config.path_prefix,
        config.cleanup_timeout.as_millis()
    );

    RelayServer::new(config).run().await
}
