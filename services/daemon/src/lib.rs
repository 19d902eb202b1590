// daemon: the IPTV stream supervision service.
//
// One process, one cooperative event loop, two endpoints: the upstream
// control endpoint (activation, stream lifecycle, telemetry out) and the
// subscriber endpoint (end-user activation, channel queries, liveness).
// Stream pipelines run in child worker processes, one each, supervised by
// the `supervisor` module.

pub mod client;
pub mod config;
pub mod license;
pub mod pending;
pub mod pidfile;
pub mod subscribers;
pub mod supervisor;
pub mod users;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use config::DaemonConfig;
use subscribers::SubscriberHub;
use supervisor::Supervisor;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("binding {what} on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: String,
        source: std::io::Error,
    },
    #[error("users file: {0}")]
    Users(#[from] users::LoadError),
}

/// Everything `run` sets up, exposed for tests.
pub struct Daemon {
    pub supervisor: Supervisor,
    pub hub: SubscriberHub,
    pub control_addr: std::net::SocketAddr,
    pub subscribers_addr: std::net::SocketAddr,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

impl Daemon {
    /// Bind both endpoints and start every background task.
    pub async fn start(cfg: DaemonConfig, license: String) -> Result<Daemon, DaemonError> {
        let directory: Box<dyn users::UserDirectory + Send + Sync> = match &cfg.users_file {
            Some(path) => {
                let directory = users::load_directory(std::path::Path::new(path))?;
                info!(users = directory.len(), path = %path, "user directory loaded");
                Box::new(directory)
            }
            None => {
                warn!("no users_file configured, subscriber directory is empty");
                Box::new(users::InMemoryDirectory::new())
            }
        };

        let control = TcpListener::bind(&cfg.control_bind)
            .await
            .map_err(|source| DaemonError::Bind {
                what: "control endpoint",
                addr: cfg.control_bind.clone(),
                source,
            })?;
        let subscribers = TcpListener::bind(&cfg.subscribers_bind)
            .await
            .map_err(|source| DaemonError::Bind {
                what: "subscriber endpoint",
                addr: cfg.subscribers_bind.clone(),
                source,
            })?;
        let control_addr = control.local_addr().expect("bound listener has an address");
        let subscribers_addr = subscribers
            .local_addr()
            .expect("bound listener has an address");

        let online = Arc::new(AtomicU64::new(0));
        let (supervisor, shutdown_rx) = Supervisor::new(cfg.clone(), license, online.clone());
        let hub = SubscriberHub::new(
            directory,
            cfg.bandwidth_host.clone(),
            Duration::from_secs(cfg.ping_timeout_clients_secs),
            online,
        );

        tokio::spawn(supervisor.clone().run_control_listener(control));
        tokio::spawn(supervisor.clone().run_statistic_reporter());
        tokio::spawn(supervisor.clone().run_pending_sweeper());
        tokio::spawn(hub.clone().run_listener(subscribers));
        tokio::spawn(hub.clone().run_ping_timer());

        info!(
            control = %control_addr,
            subscribers = %subscribers_addr,
            "daemon endpoints up"
        );

        Ok(Daemon {
            supervisor,
            hub,
            control_addr,
            subscribers_addr,
            shutdown_rx,
        })
    }

    /// Block until `stop_service` (or a signal handled by the caller) asks
    /// the daemon to exit.
    pub async fn wait_for_shutdown(&mut self) {
        while !*self.shutdown_rx.borrow() {
            if self.shutdown_rx.changed().await.is_err() {
                return;
            }
        }
    }
}
