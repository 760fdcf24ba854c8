//! Client for the Homerun pet feeder.
//!
//! The feeder keeps a persistent TCP session with a vendor endpoint. This
//! crate logs in with an authorization code, polls door status, battery
//! level and weight while online, actuates the door on request, and
//! reconnects when the session drops.
//!
//! ```no_run
//! use homerun_feeder::{FeederConfig, start};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() {
//! let shutdown = CancellationToken::new();
//! let (feeder, task) = start(FeederConfig::default(), "my-authorize-code", shutdown.clone());
//!
//! feeder.switch_status().await;
//! println!("battery at {}%", feeder.battery_level());
//!
//! shutdown.cancel();
//! let _ = task.await;
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod error;
pub mod poller;
pub mod protocol;
pub mod session;
pub mod tracing;

pub use client::{FeederClient, FeederHandle, start};
pub use config::FeederConfig;
pub use error::{FeederError, FeederResult};
pub use poller::PollOutcome;
pub use session::{DoorStatus, Phase, Telemetry};
