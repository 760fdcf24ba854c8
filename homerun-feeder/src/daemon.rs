//! Daemon lifecycle for feederd.
//!
//! Reads configuration and the authorization code from the environment,
//! runs the feeder client, logs telemetry as it changes, and maps unix
//! signals onto the client: SIGUSR1 cycles the door, SIGINT and SIGTERM
//! shut down.

use tokio::signal::unix::{self, SignalKind};
use tokio::sync::watch;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::auth::{CredentialProvider, EnvCredentials};
use crate::client::FeederClient;
use crate::config::FeederConfig;
use crate::session::{Phase, Telemetry};
use crate::tracing::prelude::*;

/// The feeder daemon.
pub struct Daemon {
    config: FeederConfig,
    credentials: Box<dyn CredentialProvider>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a daemon configured from the environment.
    pub fn new() -> Self {
        Self::with_credentials(FeederConfig::from_env(), Box::new(EnvCredentials))
    }

    pub fn with_credentials(config: FeederConfig, credentials: Box<dyn CredentialProvider>) -> Self {
        Self {
            config,
            credentials,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let authorization_code = self.credentials.authorize_code().await?;

        let (client, feeder) =
            FeederClient::new(self.config.clone(), authorization_code, self.shutdown.clone());
        self.tracker.spawn(client.run());

        self.tracker.spawn(log_telemetry(feeder.subscribe(), self.shutdown.clone()));
        self.tracker.spawn(log_phase(feeder.subscribe_phase(), self.shutdown.clone()));
        self.tracker.close();

        info!("Started.");
        info!(
            "For protocol debugging, set RUST_LOG=homerun_feeder=trace to see \
             every frame exchanged with the feeder"
        );

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let mut sigusr1 = unix::signal(SignalKind::user_defined1())?;

        loop {
            tokio::select! {
                _ = sigusr1.recv() => {
                    info!("Received SIGUSR1, switching feeder");
                    feeder.switch_status().await;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
            }
        }

        trace!("Shutting down.");
        self.shutdown.cancel();

        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

async fn log_telemetry(mut rx: watch::Receiver<Telemetry>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let telemetry = *rx.borrow_and_update();
                info!(
                    status = telemetry.status,
                    door = ?telemetry.door_status(),
                    battery = telemetry.battery_level,
                    weight = telemetry.weight,
                    "Telemetry"
                );
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

async fn log_phase(mut rx: watch::Receiver<Phase>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let phase = *rx.borrow_and_update();
                info!(phase = ?phase, "Feeder connection");
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
