// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Dev server assembly: index the content tree, load recipe chains, bind
//! the listener, and serve until SIGINT/SIGTERM. In-flight requests get a
//! two-second grace window after the signal.

pub mod handler;
pub mod recipes;
pub mod routes;

pub use handler::{router, DevState};
pub use recipes::RecipeSet;
pub use routes::RouteIndex;

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct DevServerConfig {
    pub content_root: PathBuf,
    pub recipes_root: Option<PathBuf>,
    pub port: u16,
}

pub fn serve(config: DevServerConfig) -> anyhow::Result<()> {
    if !config.content_root.is_dir() {
        bail!(
            "Invalid content directory: {:?} is not a directory",
            config.content_root
        );
    }
    if let Some(recipes_root) = &config.recipes_root {
        if !recipes_root.is_dir() {
            bail!("Invalid recipes directory: {recipes_root:?} is not a directory");
        }
    }

    let routes = RouteIndex::build(&config.content_root)?;
    tracing::info!(
        "dev: indexed {} request paths from {}",
        routes.len(),
        config.content_root.display()
    );

    let recipes = match &config.recipes_root {
        Some(recipes_root) => {
            let recipes = RecipeSet::load(recipes_root)?;
            tracing::info!(
                "dev: loaded {} recipe mime chains from {}",
                recipes.len(),
                recipes_root.display()
            );
            recipes
        }
        None => RecipeSet::empty(),
    };

    let state = Arc::new(DevState::new(routes, recipes));

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.port))
            .await
            .with_context(|| format!("failed to bind 127.0.0.1:{}", config.port))?;
        tracing::info!("dev: listening on http://{}", listener.local_addr()?);

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });

        let mut graceful_rx = shutdown_rx.clone();
        let serve_future = axum::serve(listener, router(state))
            .with_graceful_shutdown({
                let mut rx = shutdown_rx;
                async move {
                    let _ = rx.wait_for(|stopped| *stopped).await;
                }
            })
            .into_future();

        tokio::select! {
            result = serve_future => result.map_err(anyhow::Error::from),
            _ = async {
                let _ = graceful_rx.wait_for(|stopped| *stopped).await;
                tokio::time::sleep(SHUTDOWN_GRACE).await;
            } => {
                tracing::info!("dev: shutdown grace period elapsed");
                Ok(())
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    tracing::warn!("dev: could not install SIGTERM handler: {err}");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
