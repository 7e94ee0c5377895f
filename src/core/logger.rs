//! Logging setup
//!
//! Everything goes to stderr through `tracing-subscriber`; stdout belongs to
//! the extcap protocol. While a capture runs with a toolbar attached, events
//! are also copied to the toolbar's log window.

use super::control::{ControlMessage, ControlSender};
use parking_lot::RwLock;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Environment variable overriding the log filter
pub const LOG_ENV: &str = "CATBRIDGE_LOG";

/// Parse a log level name as accepted on the command line
pub fn parse_level(name: &str) -> Option<Level> {
    match name.to_ascii_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Switchable destination for forwarded log lines
#[derive(Debug, Clone, Default)]
pub struct LogForwarder {
    target: Arc<RwLock<Option<ControlSender>>>,
}

impl LogForwarder {
    /// Start copying log lines to the toolbar
    pub fn attach(&self, sender: ControlSender) {
        *self.target.write() = Some(sender);
    }

    /// Stop copying log lines
    pub fn detach(&self) {
        self.target.write().take();
    }

    /// Whether a toolbar is attached
    pub fn is_attached(&self) -> bool {
        self.target.read().as_ref().is_some_and(|s| !s.is_closed())
    }

    fn forward(&self, line: &str) {
        if let Some(sender) = self.target.read().as_ref() {
            sender.send(ControlMessage::log(line));
        }
    }
}

/// Layer copying events to the toolbar logger control
pub struct ControlLogLayer {
    forwarder: LogForwarder,
    level: Level,
}

impl ControlLogLayer {
    /// Forward events at `level` or more severe
    pub fn new(forwarder: LogForwarder, level: Level) -> Self {
        Self { forwarder, level }
    }
}

impl<S: Subscriber> Layer<S> for ControlLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > self.level {
            return;
        }
        // The control writer itself logs; never feed that back in.
        if meta.target().ends_with("::control") {
            return;
        }
        let mut line = LineVisitor::default();
        event.record(&mut line);
        self.forwarder.forward(&format!("[{}] {}", meta.level(), line.finish()));
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Install the global subscriber.
///
/// `CATBRIDGE_LOG` takes precedence over `default_level`. With `json` set,
/// stderr gets one JSON object per event. Returns the forwarder a capture
/// session attaches its control channel to.
pub fn init_logging(default_level: Level, json: bool) -> LogForwarder {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level.as_str()));
    let forwarder = LogForwarder::default();

    let text_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });
    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(ControlLogLayer::new(forwarder.clone(), Level::INFO))
        .try_init();
    if installed.is_err() {
        tracing::debug!("global subscriber already installed");
    }
    forwarder
}
