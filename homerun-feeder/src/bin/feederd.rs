//! Entry point for the feeder daemon.

use homerun_feeder::{daemon::Daemon, tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    Daemon::new().run().await
}
