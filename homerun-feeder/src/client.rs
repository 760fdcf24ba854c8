//! Feeder client implementation.
//!
//! This module contains the connection task that owns the socket, drives
//! the session phase, and hands telemetry to the shared [`Session`].
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> ConnectedUnauthenticated -> Online
//!      ^              |                  |      ^              |
//!      |   connect failed         login ack      \-- logged out
//!      +---------------------- close / error / stalled login --+
//! ```
//!
//! The task selects over socket events, frames queued by the poller,
//! requests from [`FeederHandle`]s, the deferred-reconnect timer, and
//! shutdown. Everything that changes the phase happens on this one task, so
//! an actuation requested while offline cannot race a login completing.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::FeederConfig;
use crate::connection::{Connector, SocketEvent, TcpConnector, Transport};
use crate::error::FeederResult;
use crate::poller::Poller;
use crate::protocol::{
    ACTUATION_CODE, DeviceMessage, actuation_frame, decode_hex, encode_hex, login_frame,
    match_response,
};
use crate::session::{Phase, Session, Telemetry};
use crate::tracing::prelude::*;

/// Requests handled by the connection task.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ClientRequest {
    /// Run the actuation cycle, now or after the next login
    Switch,

    /// Poll tick found the session not online
    ScheduleReconnect,
}

/// Why a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Socket closed, errored, or a write failed
    Closed,
    /// Not online when the deferred reconnect fired
    Stalled,
    Shutdown,
}

/// How a reconnect backoff ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backoff {
    Elapsed,
    /// A switch was requested; connect now instead of waiting it out
    SwitchRequested,
    Shutdown,
}

/// Feeder client.
///
/// Keeps one session with the device alive: connects, logs in with the
/// authorization code, polls telemetry while online, and reconnects
/// according to [`FeederConfig::auto_reconnect`].
///
/// The client keeps a request sender of its own for the pollers it spawns,
/// so dropping every [`FeederHandle`] does not end it. Only the shutdown
/// token does.
pub struct FeederClient {
    config: FeederConfig,
    session: Arc<Session>,
    connector: Arc<dyn Connector>,

    /// Kept so pollers can be handed a sender
    requests_tx: mpsc::Sender<ClientRequest>,
    requests_rx: mpsc::Receiver<ClientRequest>,

    /// Hex frames queued by the poller
    frames_tx: mpsc::Sender<String>,
    frames_rx: mpsc::Receiver<String>,

    /// Cancels the running poller, if any
    poller: Option<CancellationToken>,

    /// Shutdown signal
    shutdown: CancellationToken,
}

/// Host-facing handle to a running client.
///
/// Reads return last-known values and never fail; they are zero until the
/// device has answered.
#[derive(Clone)]
pub struct FeederHandle {
    session: Arc<Session>,
    requests: mpsc::Sender<ClientRequest>,
}

/// Start a client over TCP and return its handle.
///
/// The client runs until `shutdown` is cancelled.
pub fn start(
    config: FeederConfig,
    authorization_code: impl Into<String>,
    shutdown: CancellationToken,
) -> (FeederHandle, JoinHandle<()>) {
    let (client, handle) = FeederClient::new(config, authorization_code, shutdown);
    (handle, tokio::spawn(client.run()))
}

impl FeederClient {
    /// Create a client connecting to `config.address` over TCP.
    pub fn new(
        config: FeederConfig,
        authorization_code: impl Into<String>,
        shutdown: CancellationToken,
    ) -> (Self, FeederHandle) {
        let connector = Arc::new(TcpConnector::new(config.address.clone()));
        Self::with_connector(config, authorization_code, connector, shutdown)
    }

    /// Create a client using a custom connector.
    pub fn with_connector(
        config: FeederConfig,
        authorization_code: impl Into<String>,
        connector: Arc<dyn Connector>,
        shutdown: CancellationToken,
    ) -> (Self, FeederHandle) {
        let session = Arc::new(Session::new(authorization_code.into()));
        let (requests_tx, requests_rx) = mpsc::channel(32);
        let (frames_tx, frames_rx) = mpsc::channel(8);

        let handle = FeederHandle {
            session: session.clone(),
            requests: requests_tx.clone(),
        };

        let client = Self {
            config,
            session,
            connector,
            requests_tx,
            requests_rx,
            frames_tx,
            frames_rx,
            poller: None,
            shutdown,
        };

        (client, handle)
    }

    /// Run the client until shutdown.
    pub async fn run(mut self) {
        info!(
            address = %self.config.address,
            auto_reconnect = self.config.auto_reconnect,
            "Starting feeder client"
        );

        let mut connect_now = true;
        loop {
            if !connect_now && !self.wait_for_start().await {
                break;
            }
            connect_now = self.config.auto_reconnect;

            let Some(result) = self.connect().await else {
                break;
            };

            match result {
                Ok(mut transport) => {
                    let end = self.run_session(transport.as_mut()).await;
                    self.stop_poller();
                    self.session.set_phase(Phase::Disconnected);

                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed => info!("Disconnected from feeder"),
                        SessionEnd::Stalled => {
                            warn!("Login did not complete, reconnecting");
                            connect_now = true;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to connect to feeder");
                    self.session.set_phase(Phase::Disconnected);

                    if self.config.auto_reconnect {
                        match self.backoff(self.config.reconnect_delay).await {
                            Backoff::Elapsed => {}
                            Backoff::SwitchRequested => {
                                debug!("Switch requested, reconnecting early");
                            }
                            Backoff::Shutdown => break,
                        }
                    }
                }
            }
        }

        self.stop_poller();
        self.session.set_phase(Phase::Disconnected);
        info!("Feeder client stopped");
    }

    /// Open a socket. `None` means shutdown was requested.
    async fn connect(&mut self) -> Option<FeederResult<Box<dyn Transport>>> {
        // Nothing armed for the previous connection survives this point
        self.stop_poller();
        self.session.set_phase(Phase::Connecting);

        let connector = self.connector.clone();
        let connect = connector.connect();
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => return Some(result),

                Some(request) = self.requests_rx.recv() => {
                    if let ClientRequest::Switch = request {
                        debug!("Connection in progress, deferring switch");
                        self.session.defer_switch();
                    }
                }

                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Exchange messages over one connection until it ends.
    async fn run_session(&mut self, conn: &mut dyn Transport) -> SessionEnd {
        // Frames queued for a previous connection must not precede the login
        while self.frames_rx.try_recv().is_ok() {}

        let login = login_frame(self.session.authorization_code());
        if let Err(e) = write_hex(conn, &login).await {
            warn!(error = %e, "Failed to send login");
            return SessionEnd::Closed;
        }
        self.session.set_phase(Phase::ConnectedUnauthenticated);
        debug!("Login sent");

        // Bounds the wait for a login ack; the ack disarms it
        let mut reconnect_at: Option<Instant> = self
            .config
            .auto_reconnect
            .then(|| Instant::now() + self.config.reconnect_delay);

        loop {
            tokio::select! {
                event = conn.next_event() => {
                    match event {
                        SocketEvent::Data(bytes) => {
                            if let Err(e) = self.handle_data(conn, &bytes, &mut reconnect_at).await {
                                warn!(error = %e, "Write failed");
                                return SessionEnd::Closed;
                            }
                        }
                        SocketEvent::Closed => {
                            info!("Connection closed by feeder");
                            return SessionEnd::Closed;
                        }
                        SocketEvent::Errored(e) => {
                            // Treated as the close that follows it
                            warn!(error = %e, "Socket error");
                            return SessionEnd::Closed;
                        }
                    }
                }

                Some(frame) = self.frames_rx.recv() => {
                    if let Err(e) = write_hex(conn, &frame).await {
                        warn!(error = %e, "Write failed");
                        return SessionEnd::Closed;
                    }
                }

                Some(request) = self.requests_rx.recv() => {
                    match request {
                        ClientRequest::Switch => {
                            if self.session.is_online() {
                                info!("Switching feeder");
                                if let Err(e) = write_hex(conn, &actuation_frame(ACTUATION_CODE)).await {
                                    warn!(error = %e, "Write failed");
                                    return SessionEnd::Closed;
                                }
                            } else {
                                debug!("Not logged in, deferring switch");
                                self.session.defer_switch();
                            }
                        }
                        ClientRequest::ScheduleReconnect => {
                            if self.config.auto_reconnect
                                && reconnect_at.is_none()
                                && !self.session.is_online()
                            {
                                debug!(
                                    delay_secs = self.config.reconnect_delay.as_secs(),
                                    "Scheduling reconnect"
                                );
                                reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
                            }
                        }
                    }
                }

                _ = async {
                    match reconnect_at {
                        Some(deadline) => time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    reconnect_at = None;
                    if !self.session.is_online() {
                        return SessionEnd::Stalled;
                    }
                }

                _ = self.shutdown.cancelled() => {
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    /// Match one received chunk and act on it.
    async fn handle_data(
        &mut self,
        conn: &mut dyn Transport,
        bytes: &[u8],
        reconnect_at: &mut Option<Instant>,
    ) -> FeederResult<()> {
        let hex = decode_hex(bytes);
        trace!(rx = %hex, "Received chunk");

        match match_response(&hex) {
            Some(DeviceMessage::LoginAcknowledged) => {
                info!("Logged in to feeder");
                self.session.set_phase(Phase::Online);
                *reconnect_at = None;

                if self.session.take_pending_switch() {
                    info!("Switching feeder (deferred)");
                    write_hex(conn, &actuation_frame(ACTUATION_CODE)).await?;
                }

                self.start_poller();
            }
            Some(DeviceMessage::LoggedOut) => {
                warn!("Logged out by feeder");
                self.session.set_phase(Phase::ConnectedUnauthenticated);
            }
            Some(DeviceMessage::Telemetry(payload)) => {
                self.session.handle_telemetry(&payload);
            }
            None => {
                debug!(rx = %hex, "Ignoring unrecognized message");
            }
        }

        Ok(())
    }

    /// Replace the running poller with a fresh one.
    fn start_poller(&mut self) {
        self.stop_poller();

        let cancel = self.shutdown.child_token();
        let poller = Poller::new(
            self.session.clone(),
            self.config.clone(),
            self.frames_tx.clone(),
            self.requests_tx.clone(),
            cancel.clone(),
        );
        tokio::spawn(poller.run());
        self.poller = Some(cancel);
    }

    fn stop_poller(&mut self) {
        if let Some(cancel) = self.poller.take() {
            cancel.cancel();
        }
    }

    /// Stay disconnected until a switch request asks for a connection.
    ///
    /// Returns false on shutdown.
    async fn wait_for_start(&mut self) -> bool {
        debug!("Idle until a switch is requested");

        loop {
            tokio::select! {
                Some(request) = self.requests_rx.recv() => {
                    if let ClientRequest::Switch = request {
                        self.session.defer_switch();
                        return true;
                    }
                }
                _ = self.shutdown.cancelled() => return false,
            }
        }
    }

    /// Wait out the delay after a failed connect.
    ///
    /// A switch request cuts the wait short: the client is fully
    /// disconnected, so the switch is deferred and a connection started.
    async fn backoff(&mut self, delay: Duration) -> Backoff {
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Backoff::Elapsed,
                Some(request) = self.requests_rx.recv() => {
                    if let ClientRequest::Switch = request {
                        self.session.defer_switch();
                        return Backoff::SwitchRequested;
                    }
                }
                _ = self.shutdown.cancelled() => return Backoff::Shutdown,
            }
        }
    }
}

async fn write_hex(conn: &mut dyn Transport, hex: &str) -> FeederResult<()> {
    let frame = encode_hex(hex)?;
    conn.write_frame(&frame).await
}

impl FeederHandle {
    /// Door status code, 0 closed, 1 full open, 2 extend, 3 retract.
    pub fn status(&self) -> u8 {
        self.session.telemetry().status
    }

    /// Battery percentage.
    pub fn battery_level(&self) -> u8 {
        self.session.telemetry().battery_level
    }

    pub fn weight(&self) -> u32 {
        self.session.telemetry().weight
    }

    pub fn telemetry(&self) -> Telemetry {
        self.session.telemetry()
    }

    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    /// Watch telemetry changes.
    pub fn subscribe(&self) -> watch::Receiver<Telemetry> {
        self.session.subscribe_telemetry()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.session.subscribe_phase()
    }

    /// Cycle the feeder door.
    ///
    /// Fire-and-forget. Sent right away when online; otherwise sent once
    /// the next login completes, connecting first if the client is idle.
    pub async fn switch_status(&self) {
        if self.requests.send(ClientRequest::Switch).await.is_err() {
            warn!("Feeder client not running, switch dropped");
        }
    }

    #[cfg(test)]
    pub(crate) fn session(&self) -> &Session {
        &self.session
    }
}
