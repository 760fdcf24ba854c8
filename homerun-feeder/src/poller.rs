//! Periodic telemetry polling.
//!
//! A poller is spawned by the connection task on every login and cancelled
//! on the next transition into `Connecting` (or on the next login, which
//! replaces it). Each cycle requests the codes in
//! [`TelemetryCode::POLL_ORDER`], one at a time, keeping at most one
//! request outstanding through the session's [`Throttle`].
//!
//! [`Throttle`]: crate::session::Throttle

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::ClientRequest;
use crate::config::FeederConfig;
use crate::protocol::{TelemetryCode, poll_request_frame};
use crate::session::Session;
use crate::tracing::prelude::*;

/// Result of a single telemetry request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A response arrived within the timeout
    Answered,
    /// Another request stayed outstanding; nothing was sent
    Busy,
    /// Sent, but no response in time; the throttle was rolled back
    TimedOut,
    /// Session not online (or client gone); nothing was sent
    Offline,
}

pub(crate) struct Poller {
    session: Arc<Session>,
    config: FeederConfig,

    /// Hex frames for the connection task to write
    frames: mpsc::Sender<String>,

    /// Back channel for reconnect scheduling
    requests: mpsc::Sender<ClientRequest>,

    cancel: CancellationToken,
}

impl Poller {
    pub fn new(
        session: Arc<Session>,
        config: FeederConfig,
        frames: mpsc::Sender<String>,
        requests: mpsc::Sender<ClientRequest>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            config,
            frames,
            requests,
            cancel,
        }
    }

    /// Poll until cancelled.
    ///
    /// The first cycle starts right away. A tick that finds the session not
    /// online sends no requests and asks the connection task to arm its
    /// delayed reconnect instead.
    pub async fn run(self) {
        debug!("Poller started");

        loop {
            if self.session.is_online() {
                self.run_cycle().await;
            } else if self.config.auto_reconnect {
                debug!(phase = ?self.session.phase(), "Not online at poll tick");
                if self.requests.send(ClientRequest::ScheduleReconnect).await.is_err() {
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        debug!("Poller stopped");
    }

    /// Request every code once, in order.
    ///
    /// In-flight waits are not interrupted; cancellation and logout are
    /// checked between codes.
    async fn run_cycle(&self) {
        for code in TelemetryCode::POLL_ORDER {
            if self.cancel.is_cancelled() || !self.session.is_online() {
                break;
            }

            let outcome = self.request(code).await;
            trace!(code = %code, outcome = ?outcome, "Poll request finished");
        }
    }

    /// Request one telemetry code.
    ///
    /// Waits up to `request_timeout` for the throttle to clear before
    /// sending, and again for the response afterwards. A response that
    /// never comes is rolled back so a lost frame cannot wedge the
    /// throttle.
    pub async fn request(&self, code: TelemetryCode) -> PollOutcome {
        let throttle = self.session.throttle();
        let timeout = self.config.request_timeout;
        let step = self.config.wait_step;

        if !self.session.is_online() {
            return PollOutcome::Offline;
        }

        if !throttle.wait_idle(timeout, step).await {
            debug!(code = %code, pending = throttle.pending(), "Request still outstanding, skipping");
            return PollOutcome::Busy;
        }

        if !self.session.is_online() {
            return PollOutcome::Offline;
        }

        throttle.acquire();
        trace!(code = %code, "Requesting telemetry");
        if self.frames.send(poll_request_frame(code)).await.is_err() {
            throttle.release();
            return PollOutcome::Offline;
        }

        if !throttle.wait_idle(timeout, step).await {
            throttle.release();
            debug!(code = %code, "No response, throttle rolled back");
            return PollOutcome::TimedOut;
        }

        PollOutcome::Answered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TelemetryPayload;
    use crate::session::Phase;
    use std::time::Duration;
    use tokio::time::Instant;

    struct Harness {
        session: Arc<Session>,
        frames_rx: mpsc::Receiver<String>,
        requests_rx: mpsc::Receiver<ClientRequest>,
        cancel: CancellationToken,
        poller: Poller,
    }

    fn harness(phase: Phase) -> Harness {
        let session = Arc::new(Session::new("abc".to_string()));
        session.set_phase(phase);

        let (frames_tx, frames_rx) = mpsc::channel(16);
        let (requests_tx, requests_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let poller = Poller::new(
            session.clone(),
            FeederConfig::default(),
            frames_tx,
            requests_tx,
            cancel.clone(),
        );

        Harness {
            session,
            frames_rx,
            requests_rx,
            cancel,
            poller,
        }
    }

    fn respond(session: &Session, type_code: &str, payload: &str) {
        session.handle_telemetry(&TelemetryPayload {
            type_code: type_code.to_string(),
            payload: payload.to_string(),
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_busy_when_outstanding() {
        let mut h = harness(Phase::Online);
        h.session.throttle().acquire();

        let start = Instant::now();
        let outcome = h.poller.request(TelemetryCode::Status).await;

        assert_eq!(outcome, PollOutcome::Busy);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2900), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(3100), "{:?}", elapsed);

        // Nothing sent, and the outstanding request is left alone
        assert!(h.frames_rx.try_recv().is_err());
        assert_eq!(h.session.throttle().pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_rolls_back() {
        let mut h = harness(Phase::Online);

        let start = Instant::now();
        let outcome = h.poller.request(TelemetryCode::Weight).await;

        assert_eq!(outcome, PollOutcome::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_millis(3000));
        assert_eq!(h.session.throttle().pending(), 0);
        assert_eq!(
            h.frames_rx.try_recv().unwrap(),
            "730000000e5b791a63001b0057abffff100010"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_answered() {
        let mut h = harness(Phase::Online);

        let session = h.session.clone();
        let mut frames_rx = std::mem::replace(&mut h.frames_rx, mpsc::channel(1).1);
        tokio::spawn(async move {
            let frame = frames_rx.recv().await.unwrap();
            assert!(frame.ends_with("1f001f"));
            tokio::time::sleep(Duration::from_millis(250)).await;
            respond(&session, "0f", "50");
        });

        let outcome = h.poller.request(TelemetryCode::Battery).await;

        assert_eq!(outcome, PollOutcome::Answered);
        assert_eq!(h.session.telemetry().battery_level, 80);
        assert_eq!(h.session.throttle().pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_offline_sends_nothing() {
        let mut h = harness(Phase::ConnectedUnauthenticated);

        let outcome = h.poller.request(TelemetryCode::Status).await;

        assert_eq!(outcome, PollOutcome::Offline);
        assert!(h.frames_rx.try_recv().is_err());
        assert_eq!(h.session.throttle().pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_offline_schedules_reconnect() {
        let mut h = harness(Phase::ConnectedUnauthenticated);
        tokio::spawn(h.poller.run());

        let request = h.requests_rx.recv().await.unwrap();
        assert!(matches!(request, ClientRequest::ScheduleReconnect));
        assert!(h.frames_rx.try_recv().is_err());

        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_order_and_logout_stops_requests() {
        let mut h = harness(Phase::Online);
        let session = h.session.clone();
        tokio::spawn(h.poller.run());

        let first = h.frames_rx.recv().await.unwrap();
        assert!(first.ends_with("1f001f"));
        respond(&session, "0f", "64");

        let second = h.frames_rx.recv().await.unwrap();
        assert!(second.ends_with("110011"));

        // Device logs out before answering
        session.set_phase(Phase::ConnectedUnauthenticated);
        tokio::time::sleep(Duration::from_secs(20)).await;

        // Only reconnect requests, no more telemetry frames
        assert!(h.frames_rx.try_recv().is_err());
        assert!(matches!(
            h.requests_rx.try_recv(),
            Ok(ClientRequest::ScheduleReconnect)
        ));
        assert_eq!(session.throttle().pending(), 0);

        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_cycle_after_interval() {
        let mut h = harness(Phase::Online);
        let session = h.session.clone();
        tokio::spawn(h.poller.run());

        for (type_code, payload) in [("0f", "64"), ("11", "0000000000"), ("10", "0190")] {
            h.frames_rx.recv().await.unwrap();
            respond(&session, type_code, payload);
        }

        let start = Instant::now();
        let next = h.frames_rx.recv().await.unwrap();
        assert!(next.ends_with("1f001f"));
        // The last request observes its response on the next 100 ms step
        assert!(start.elapsed() >= Duration::from_millis(3000));
        assert!(start.elapsed() <= Duration::from_millis(3100));

        h.cancel.cancel();
    }
}
