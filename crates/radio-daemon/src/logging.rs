//! File log plus a layer that mirrors WARN/ERROR lines to connected clients.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::BroadcastMessage;

const DEFAULT_FILTER: &str = "info,radio_daemon=debug,radio_engine=debug";

struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl<S: Subscriber> Layer<S> for BroadcastLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }
        let mut line = format!(
            "{} [{}] {}: ",
            chrono::Local::now().format("%H:%M:%S"),
            level,
            event.metadata().target()
        );
        event.record(&mut LineVisitor(&mut line));
        // no receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(line));
    }
}

struct LineVisitor<'a>(&'a mut String);

impl Visit for LineVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.0, "{:?}", value);
        } else {
            let _ = write!(self.0, " {}={:?}", field.name(), value);
        }
    }
}

/// Install the global subscriber.  Returns the log file path.
pub fn init(
    data_dir: &Path,
    sender: broadcast::Sender<BroadcastMessage>,
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(data_dir)?;
    let log_path = data_dir.join("daemon.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false),
        )
        .with(BroadcastLayer { sender })
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .init();

    Ok(log_path)
}
