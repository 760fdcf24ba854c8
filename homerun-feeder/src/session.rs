//! Shared session state.
//!
//! One [`Session`] lives for the lifetime of a client. The connection task
//! owns every phase transition; the poll task and the public handle only
//! read the phase. Telemetry and phase are published over `watch` channels
//! so the host can observe changes without polling.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant};

use crate::protocol::{Reading, TelemetryPayload};
use crate::tracing::prelude::*;

/// Connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    /// Socket connect in progress
    Connecting,
    /// Socket open, login sent or session logged out
    ConnectedUnauthenticated,
    /// Login acknowledged
    Online,
}

/// Door position reported by the status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorStatus {
    Closed,
    FullOpen,
    Extend,
    Retract,
}

impl DoorStatus {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DoorStatus::Closed),
            1 => Some(DoorStatus::FullOpen),
            2 => Some(DoorStatus::Extend),
            3 => Some(DoorStatus::Retract),
            _ => None,
        }
    }
}

/// Last-known telemetry. Zero until the first response arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Telemetry {
    /// Door status code, see [`DoorStatus`]
    pub status: u8,
    /// Battery percentage, 0 to 100
    pub battery_level: u8,
    pub weight: u32,
}

impl Telemetry {
    pub fn door_status(&self) -> Option<DoorStatus> {
        DoorStatus::from_code(self.status)
    }
}

/// Outstanding-request throttle.
///
/// Counts telemetry requests sent but not yet answered. Responses are
/// correlated by arrival order only, so this is a throttle rather than a
/// sequence tracker. Decrements saturate at zero.
#[derive(Debug, Default)]
pub struct Throttle {
    pending: AtomicU32,
}

impl Throttle {
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Record a request about to be written.
    pub fn acquire(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Record an answered (or abandoned) request.
    ///
    /// Returns false if nothing was outstanding.
    pub fn release(&self) -> bool {
        self.pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Wait until nothing is outstanding, checking every `step`.
    ///
    /// Each step is a yield point, so the connection task keeps handling
    /// inbound data meanwhile. Returns false if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration, step: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pending() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            time::sleep(step).await;
        }
    }
}

/// State shared between the connection task, the poll task and handles.
#[derive(Debug)]
pub struct Session {
    authorization_code: String,
    phase: watch::Sender<Phase>,
    telemetry: watch::Sender<Telemetry>,
    pending_switch: AtomicBool,
    throttle: Throttle,
}

impl Session {
    pub fn new(authorization_code: String) -> Self {
        let (phase, _) = watch::channel(Phase::Disconnected);
        let (telemetry, _) = watch::channel(Telemetry::default());

        Self {
            authorization_code,
            phase,
            telemetry,
            pending_switch: AtomicBool::new(false),
            throttle: Throttle::default(),
        }
    }

    pub fn authorization_code(&self) -> &str {
        &self.authorization_code
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.phase() == Phase::Online
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(from = ?previous, to = ?phase, "Phase changed");
        }
    }

    pub fn telemetry(&self) -> Telemetry {
        *self.telemetry.borrow()
    }

    pub fn subscribe_telemetry(&self) -> watch::Receiver<Telemetry> {
        self.telemetry.subscribe()
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// Remember that an actuation is owed once login completes.
    pub(crate) fn defer_switch(&self) {
        self.pending_switch.store(true, Ordering::SeqCst);
    }

    /// Clear the deferred actuation, returning whether one was owed.
    pub(crate) fn take_pending_switch(&self) -> bool {
        self.pending_switch.swap(false, Ordering::SeqCst)
    }

    pub fn has_pending_switch(&self) -> bool {
        self.pending_switch.load(Ordering::SeqCst)
    }

    /// Account for a telemetry response and apply its value.
    pub(crate) fn handle_telemetry(&self, payload: &TelemetryPayload) {
        if !self.throttle.release() {
            warn!(
                type_code = %payload.type_code,
                "Telemetry response with no request outstanding"
            );
        }

        let Some(reading) = payload.reading() else {
            debug!(
                type_code = %payload.type_code,
                payload = %payload.payload,
                "Telemetry response not applied"
            );
            return;
        };

        self.telemetry.send_modify(|t| match reading {
            Reading::Status(status) => t.status = status,
            Reading::Battery(level) => t.battery_level = level,
            Reading::Weight(weight) => t.weight = weight,
        });
        trace!(reading = ?reading, "Telemetry updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(type_code: &str, payload: &str) -> TelemetryPayload {
        TelemetryPayload {
            type_code: type_code.to_string(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_throttle_saturates() {
        let throttle = Throttle::default();
        assert!(!throttle.release());
        assert_eq!(throttle.pending(), 0);

        throttle.acquire();
        throttle.acquire();
        assert_eq!(throttle.pending(), 2);
        assert!(throttle.release());
        assert!(throttle.release());
        assert!(!throttle.release());
        assert_eq!(throttle.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_times_out() {
        let throttle = Throttle::default();
        throttle.acquire();

        let start = Instant::now();
        let idle = throttle
            .wait_idle(Duration::from_millis(3000), Duration::from_millis(100))
            .await;

        assert!(!idle);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2900), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(3100), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_returns_immediately_when_idle() {
        let throttle = Throttle::default();
        let start = Instant::now();
        assert!(
            throttle
                .wait_idle(Duration::from_millis(3000), Duration::from_millis(100))
                .await
        );
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_sees_concurrent_release() {
        let session = std::sync::Arc::new(Session::new("abc".to_string()));
        session.throttle().acquire();

        let releaser = session.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(450)).await;
            releaser.handle_telemetry(&payload("10", "0190"));
        });

        let start = Instant::now();
        let idle = session
            .throttle()
            .wait_idle(Duration::from_millis(3000), Duration::from_millis(100))
            .await;

        assert!(idle);
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        assert_eq!(session.telemetry().weight, 400);
    }

    #[test]
    fn test_handle_telemetry_updates_fields() {
        let session = Session::new("abc".to_string());
        let mut rx = session.subscribe_telemetry();

        session.handle_telemetry(&payload("0f", "ff"));
        session.handle_telemetry(&payload("11", "0000010000"));
        session.handle_telemetry(&payload("10", "0190"));

        assert!(rx.has_changed().unwrap());
        let t = *rx.borrow_and_update();
        assert_eq!(t.battery_level, 100);
        assert_eq!(t.status, 1);
        assert_eq!(t.door_status(), Some(DoorStatus::FullOpen));
        assert_eq!(t.weight, 400);
    }

    #[test]
    fn test_unknown_telemetry_still_releases() {
        let session = Session::new("abc".to_string());
        session.throttle().acquire();

        session.handle_telemetry(&payload("42", "0000"));

        assert_eq!(session.throttle().pending(), 0);
        assert_eq!(session.telemetry(), Telemetry::default());
    }

    #[test]
    fn test_pending_switch_is_one_shot() {
        let session = Session::new("abc".to_string());
        assert!(!session.take_pending_switch());

        session.defer_switch();
        assert!(session.has_pending_switch());
        assert!(session.take_pending_switch());
        assert!(!session.take_pending_switch());
    }

    #[test]
    fn test_phase_starts_disconnected() {
        let session = Session::new("abc".to_string());
        assert_eq!(session.phase(), Phase::Disconnected);

        session.set_phase(Phase::Online);
        assert!(session.is_online());
    }
}
