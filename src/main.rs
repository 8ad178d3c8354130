// src/main.rs
mod api;
mod auth;
mod config;
mod db;
mod error;
mod models;
mod normalizer;
mod portfolio;
mod providers;

use crate::api::AppState;
use crate::config::Config;
use crate::db::{MemoryStore, ScyllaStore, Store};
use crate::error::AppError;
use crate::providers::{
    http_client, CoinGeckoClient, GeminiClient, GoogleTokenVerifier, MoralisClient,
};
use dotenv::dotenv;
use env_logger::{Builder, Env};
use log::{error, info, warn};
use std::sync::Arc;

async fn init_store(config: &Config) -> Result<Arc<dyn Store>, AppError> {
    match &config.scylla_uri {
        Some(uri) => Ok(Arc::new(ScyllaStore::init(uri).await?)),
        None => {
            warn!("SCYLLA_URI not set, using in-memory store. Data is lost on restart.");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn run() -> Result<(), AppError> {
    let config = Arc::new(Config::from_env()?);
    let store = init_store(&config).await?;
    info!("Storage initialized...");

    let client = http_client(&config)?;
    let state = Arc::new(AppState::new(
        config.clone(),
        store,
        Arc::new(CoinGeckoClient::new(client.clone(), &config)),
        Arc::new(MoralisClient::new(client.clone(), &config)),
        Arc::new(GeminiClient::new(client.clone(), &config)),
        Arc::new(GoogleTokenVerifier::new(client, &config)),
    ));

    // Define routes
    let api = api::routes(state);

    // Start the server
    info!(
        "Server running on http://{}:{}",
        config.bind_addr, config.port
    );
    warp::serve(api).run((config.bind_addr, config.port)).await;
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    info!("Starting the crypto tracker application...");
    if let Err(e) = run().await {
        error!("Failed to start: {}", e);
        std::process::exit(1);
    }
}
