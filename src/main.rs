mod config;
mod error;
mod history;
mod hub;
mod messages;
mod room;
mod server;
mod store;
mod transport;
mod user;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use config::Cli;
use server::Server;
use store::{HistoryStore, MemoryStore, SqliteStore};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn HistoryStore> = match &config.history_db {
        Some(path) => match SqliteStore::open(path) {
            Ok(store) => {
                info!("History log at {}", path.display());
                Arc::new(store)
            }
            Err(e) => {
                error!("Failed to open history log {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => {
            info!(
                "No history-db configured, keeping the last {} events per room in memory",
                config.memory_history
            );
            Arc::new(MemoryStore::with_capacity(config.memory_history))
        }
    };

    let config = Arc::new(config);
    let server = Server::new(store, Arc::clone(&config));

    info!("Server starting on {}...", config.listen);
    warp::serve(server.routes()).run(config.listen).await;
}
