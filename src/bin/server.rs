//! Standalone server binary.
//!
//! Configuration comes from `NEXADB_*` environment variables (see
//! [`nexadb::config::Config::from_env`]); log filtering from `RUST_LOG`.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nexadb::config::Config;
use nexadb::server::Server;
use nexadb::store::Store;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    info!(
        data_dir = %config.data_dir.display(),
        host = %config.listen_host,
        port = config.listen_port,
        "starting nexadb"
    );

    let store = match Store::open(config) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "store failed to open");
            return ExitCode::FAILURE;
        }
    };

    let server = Server::new(Arc::clone(&store));
    if let Err(e) = server.run() {
        error!(error = %e, "server stopped");
        if let Err(e) = store.close() {
            error!(error = %e, "store close failed");
        }
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
