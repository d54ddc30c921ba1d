// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    config::{AppConf, ConfNewError},
    logger::Logger,
};
use adaptive::PlayReadyOptions;
use common::{ArcLogger, ILogger, LogEntry, LogLevel};
use handler::VodState;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    sync::Arc,
};
use thiserror::Error;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use vod::{AssemblyPool, ContentStore};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("create config: {0}")]
    NewConfig(#[from] ConfNewError),

    #[error("bind: {0}")]
    Bind(std::io::Error),

    #[error("serve: {0}")]
    Serve(std::io::Error),
}

pub async fn run(config_path: &Path) -> Result<(), RunError> {
    let config = AppConf::new(config_path)?;
    let logger: ArcLogger = Arc::new(Logger::new());

    let store = ContentStore::new(
        config.archive_dir().to_path_buf(),
        config.dir_levels(),
        config.cache_size(),
        PlayReadyOptions {
            license_url: config.license_url().to_owned(),
            key_seed: config.key_seed(),
        },
        config.allow_clear(),
        logger.clone(),
    );
    let state = VodState {
        store: Arc::new(store),
        pool: Arc::new(AssemblyPool::new(config.workers())),
        logger: logger.clone(),
    };

    let router = handler::router(config.endpoint(), state);

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port());
    let listener = TcpListener::bind(addr).await.map_err(RunError::Bind)?;

    logger.log(LogEntry::new(
        LogLevel::Info,
        "app",
        format!("serving /{} on port {}", config.endpoint(), config.port()),
    ));

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(RunError::Serve)?;

    logger.log(LogEntry::new(LogLevel::Info, "app", "shutdown".to_owned()));
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    token.cancel();
}
