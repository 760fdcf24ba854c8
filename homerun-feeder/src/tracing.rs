//! Logging setup for the feeder daemon.
//!
//! `feederd` calls [`init_journald_or_stdout`] once at startup to install a
//! subscriber. Library code just uses `use crate::tracing::prelude::*` and
//! the usual `trace!()` through `error!()` macros.
//!
//! Raw frames are logged at trace level as `tx`/`rx` hex fields, so
//! `RUST_LOG=homerun_feeder=trace` shows the whole conversation with the
//! device.

use std::fmt::{self, Write as _};

use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{FmtContext, FormatEvent, FormatFields, format::Writer, time::FormatTime},
    prelude::*,
    registry::LookupSpan,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

const CRATE_PREFIX: &str = "homerun_feeder::";

/// True when stderr is the stream systemd advertised in `JOURNAL_STREAM`.
///
/// The variable holds `device:inode` of the journal socket; it is inherited
/// by children whose stderr may have been redirected, so the numbers are
/// compared against the actual stderr descriptor.
#[cfg(target_os = "linux")]
fn stderr_is_journal_stream() -> bool {
    use nix::libc;
    use std::os::unix::io::AsRawFd;

    let Ok(value) = std::env::var("JOURNAL_STREAM") else {
        return false;
    };
    let Some((dev, ino)) = value.split_once(':') else {
        return false;
    };
    let (Ok(dev), Ok(ino)) = (dev.parse::<u64>(), ino.parse::<u64>()) else {
        return false;
    };

    let fd = std::io::stderr().as_raw_fd();
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }

    stat.st_dev == dev && stat.st_ino == ino
}

/// Install the global subscriber.
///
/// Under systemd with stderr attached to the journal, events go to journald
/// with their structured fields intact. Everywhere else they are printed to
/// stdout, filtered by `RUST_LOG` (default INFO).
pub fn init_journald_or_stdout() {
    #[cfg(target_os = "linux")]
    if stderr_is_journal_stream() {
        match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry().with(layer).init();
                return;
            }
            Err(e) => eprintln!("journald unavailable ({}), logging to stdout", e),
        }
    }

    init_stdout();
}

fn init_stdout() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().event_format(LineFormat))
        .init();
}

/// `HH:MM:SS LEVEL module: message  key=value, ...` on one line.
///
/// Our own module paths lose the crate prefix; events bridged from the
/// `log` crate are attributed to their original target.
struct LineFormat;

#[derive(Default)]
struct Fields {
    message: String,
    log_target: Option<String>,
    rest: String,
}

impl Visit for Fields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message.push_str(value),
            "log.target" => self.log_target = Some(value.to_string()),
            name if name.starts_with("log.") => {}
            name => self.push(name, format_args!("{}", value)),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => {
                let _ = write!(self.message, "{:?}", value);
            }
            name if name.starts_with("log.") => {}
            name => self.push(name, format_args!("{:?}", value)),
        }
    }
}

impl Fields {
    fn push(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.rest.is_empty() {
            self.rest.push_str(", ");
        }
        let _ = write!(self.rest, "{}={}", name, value);
    }
}

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = Fields::default();
        event.record(&mut fields);

        LocalTimer.format_time(&mut writer)?;

        let ansi = writer.has_ansi_escapes();
        let (color, label) = match *event.metadata().level() {
            Level::ERROR => ("\x1b[31m", "ERROR"),
            Level::WARN => ("\x1b[33m", "WARN "),
            Level::INFO => ("\x1b[32m", "INFO "),
            Level::DEBUG => ("\x1b[34m", "DEBUG"),
            Level::TRACE => ("\x1b[35m", "TRACE"),
        };
        if ansi {
            write!(writer, " {}{}\x1b[0m ", color, label)?;
        } else {
            write!(writer, " {} ", label)?;
        }

        let target = event.metadata().target();
        let target = match &fields.log_target {
            Some(original) if target == "log" => original.as_str(),
            _ => target.strip_prefix(CRATE_PREFIX).unwrap_or(target),
        };
        write!(writer, "{}: {}", target, fields.message)?;

        if !fields.rest.is_empty() {
            if ansi {
                write!(writer, "  \x1b[90m{}\x1b[0m", fields.rest)?;
            } else {
                write!(writer, "  {}", fields.rest)?;
            }
        }

        writeln!(writer)
    }
}

/// Local wall-clock time to the second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
