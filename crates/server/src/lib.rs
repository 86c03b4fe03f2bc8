use std::{
    net::SocketAddr,
    sync::Arc,
};

use blob_store::BlobStore;
use ephemeral_cache::EphemeralCache;
use file_engine::{
    ExpirySweeper,
    FileEngine,
};
use keybroker::KeyBroker;
use metadata::MetadataStore;

mod admin;
pub mod admission;
pub mod config;
mod files;
mod preview;
mod router;
mod upload;
mod zip;

#[cfg(test)]
mod tests;

pub use crate::{
    admission::AdmissionControl,
    config::ServerConfig,
    router::router,
};

#[derive(Clone)]
pub struct LocalAppState {
    pub engine: FileEngine,
    pub broker: KeyBroker,
    pub admission: AdmissionControl,
    pub config: Arc<ServerConfig>,
}

impl LocalAppState {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.temp_dir)?;
        let metadata = Arc::new(MetadataStore::new(&config.database_path)?);
        let blobs = BlobStore::new(&config.temp_dir, config.external_threshold)?;
        let engine = FileEngine::new(
            metadata,
            EphemeralCache::new(),
            blobs,
            config.temp_dir.clone(),
            config.engine_limits(),
        );
        let broker = KeyBroker::new(config.admin_password.clone());
        let admission = AdmissionControl::new(
            config.max_concurrent_uploads,
            config.max_concurrent_downloads,
        );
        Ok(Self {
            engine,
            broker,
            admission,
            config: Arc::new(config),
        })
    }
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    tracing::info!("starting {config:?}");
    let st = LocalAppState::new(config)?;

    let sweeper = ExpirySweeper::new(st.engine.clone());
    tokio::spawn(sweeper.clone().run_cache_loop());
    tokio::spawn(sweeper.run_metadata_loop());

    let addr = SocketAddr::from(st.config.bind_address());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {addr}");

    let grace = st.config.shutdown_grace();
    let engine = st.engine.clone();
    let app = router(st);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Listener is closed and in-flight requests are drained; give background
    // pipelines the same courtesy before tearing down the stores.
    engine.shutdown(grace).await;
    tracing::info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
