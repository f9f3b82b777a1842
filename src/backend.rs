//! Backend module for the telemetry relay
//!
//! This module handles taking in a configuration and setting up the relay services:
//! the hub that owns all relay state and the web server that feeds it.

use crate::config::AppConfig;
use crate::relay::RelayService;
use crate::relay::hub::{RelayHandle, RelayHub};
use crate::relay::web::WebServer;
use eyre::{Context, Result};
use futures::future::{join_all, select_all};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long services get to wind down after the shutdown signal before being aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Manages the lifecycle of background services (tasks)
struct ServiceManager {
    handles: Vec<JoinHandle<()>>,
}

impl ServiceManager {
    /// Creates a new, empty ServiceManager.
    fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Spawns a new task and adds its handle to the manager.
    fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(future));
    }

    /// Aborts all managed tasks.
    fn shutdown(&self) {
        tracing::info!("Aborting all service tasks...");
        for handle in &self.handles {
            handle.abort();
        }
    }

    /// Waits up to `grace` for every task to finish on its own.
    async fn drain(&mut self, grace: Duration) -> bool {
        tokio::time::timeout(grace, join_all(self.handles.iter_mut()))
            .await
            .is_ok()
    }

    /// Waits for any of the managed services to complete.
    /// This is useful for detecting unexpected shutdowns.
    async fn wait_for_any_completion(&mut self) {
        if self.handles.is_empty() {
            // If there are no tasks, wait indefinitely.
            std::future::pending::<()>().await;
            return;
        }
        // `select_all` waits for the first future to complete.
        let (result, index, _) = select_all(self.handles.iter_mut()).await;
        // a finished JoinHandle must not be polled again by `drain`
        self.handles.remove(index);
        tracing::warn!("Service task at index {} completed unexpectedly.", index);
        if let Err(e) = result {
            if e.is_panic() {
                tracing::error!("The task panicked!");
            }
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix. Returns the signal name for logging.
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("Failed to listen for Ctrl+C")?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        Ok("Ctrl+C")
    }
}

/// Represents the actual backend service
pub struct Backend {
    config: AppConfig,
    service_manager: ServiceManager,
    relay: Option<RelayHandle>,
    shutdown_tx: watch::Sender<bool>,
}

impl Backend {
    /// Create a new backend from configuration
    pub fn new(config: AppConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            service_manager: ServiceManager::new(),
            relay: None,
            shutdown_tx,
        }
    }

    /// Spawn a service task with automatic management
    fn spawn_service<F>(&mut self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!("Spawning service: {}", name);
        self.service_manager.spawn(future);
    }

    /// Start all configured backend services
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("Starting backend services...");

        let relay = self.start_relay_hub();
        if self.config.server.enabled {
            let host = self.config.server.host.clone();
            let port = self.config.server.port;
            self.start_web_service_with_params(host, port, relay.clone());
        } else {
            tracing::warn!("Web server is disabled; no peers can connect");
        }
        self.relay = Some(relay);

        tracing::info!("All backend services started successfully");
        Ok(())
    }

    fn start_relay_hub(&mut self) -> RelayHandle {
        let (mut hub, handle) = RelayHub::from_config(&self.config);
        self.spawn_service("relay_hub", async move {
            if let Err(e) = hub.run().await {
                tracing::error!("Relay hub error: {}", e);
            }
        });
        handle
    }

    /// Start web service with parameters
    fn start_web_service_with_params(&mut self, host: String, port: u16, relay: RelayHandle) {
        let bind_addr_str = format!("{host}:{port}");
        tracing::info!("Starting web backend on {bind_addr_str}");

        let shutdown = self.shutdown_tx.subscribe();
        self.spawn_service("web", async move {
            match bind_addr_str.parse::<SocketAddr>() {
                Ok(bind_addr) => {
                    let mut server = WebServer::new(bind_addr, relay, shutdown);
                    if let Err(e) = server.run().await {
                        tracing::error!("Web backend error: {:?}", e);
                    }
                }
                Err(e) => {
                    tracing::error!("Invalid web backend address {}: {}", bind_addr_str, e);
                }
            }
        });
    }

    /// Wait for all services to complete or handle shutdown
    pub async fn wait_for_shutdown(&mut self) -> Result<()> {
        tracing::info!("Waiting for shutdown signal...");

        tokio::select! {
            signal_result = shutdown_signal() => {
                match signal_result {
                    Ok(name) => tracing::info!("Received {}, shutting down gracefully...", name),
                    Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
                }
            }
            // Wait for any service to complete (which might indicate an error)
            _ = self.service_manager.wait_for_any_completion() => {
                tracing::warn!("One or more services completed unexpectedly, shutting down...");
            }
        }

        self.shutdown().await?;
        Ok(())
    }

    /// Gracefully shutdown all services
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("Shutting down backend services...");
        if let Some(relay) = self.relay.take() {
            // closes every peer and stops the heartbeat timer
            relay.shutdown();
        }
        // stop accepting; an error only means the web server never started
        let _ = self.shutdown_tx.send(true);

        if !self.service_manager.drain(SHUTDOWN_GRACE).await {
            tracing::warn!(
                "Services did not stop within {:?}, aborting",
                SHUTDOWN_GRACE
            );
        }
        self.service_manager.shutdown();
        tracing::info!("Backend shutdown complete");
        Ok(())
    }
}

/// Convenience function to create and start a backend from configuration
pub async fn setup_and_run_backend(config: AppConfig) -> Result<()> {
    let mut backend = Backend::new(config);
    backend.start().await?;
    backend.wait_for_shutdown().await?;
    Ok(())
}
