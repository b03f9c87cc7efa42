//! In-memory log capture for tests.
//!
//! Storage tests assert on warnings and alerts by message and by the
//! structured `session_id` / `backend` / `operation` fields, so records keep
//! their fields keyed by name.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// One recorded log line.
#[derive(Clone, Debug)]
pub struct CapturedEvent {
    /// Level the event was emitted at.
    pub level: Level,
    /// The `message` field.
    pub message: String,
    /// All other fields, rendered to strings.
    pub fields: BTreeMap<String, String>,
}

impl CapturedEvent {
    /// Rendered value of field `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Handle onto the records of one [`capture_logs`] call.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    records: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CapturedLogs {
    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.records.lock().clone()
    }

    /// Whether an event at `level` has a message containing `needle`.
    pub fn has_event(&self, level: Level, needle: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|r| r.level == level && r.message.contains(needle))
    }

    /// Events at `level`, oldest first.
    pub fn at_level(&self, level: Level) -> Vec<CapturedEvent> {
        self.matching(|r| r.level == level)
    }

    /// Events whose field `name` rendered to `value`.
    pub fn with_field(&self, name: &str, value: &str) -> Vec<CapturedEvent> {
        self.matching(|r| r.field(name) == Some(value))
    }

    fn matching(&self, pred: impl Fn(&CapturedEvent) -> bool) -> Vec<CapturedEvent> {
        self.records.lock().iter().filter(|r| pred(r)).cloned().collect()
    }
}

#[derive(Default)]
struct Recorder {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Recorder {
    fn put(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            let _ = self.fields.insert(field.name().to_owned(), value);
        }
    }
}

impl Visit for Recorder {
    // numbers and bools arrive here through the default `record_*` methods
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_owned());
    }
}

struct CaptureLayer(CapturedLogs);

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut recorder = Recorder::default();
        event.record(&mut recorder);
        self.0.records.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            message: recorder.message,
            fields: recorder.fields,
        });
    }
}

/// Record every event on the current thread until the guard drops.
///
/// Async tests should stay on the default current-thread runtime so that
/// spawned replication and audit tasks log through the same subscriber.
pub fn capture_logs() -> (CapturedLogs, DefaultGuard) {
    let logs = CapturedLogs::default();
    let guard = tracing_subscriber::registry()
        .with(CaptureLayer(logs.clone()))
        .set_default();
    (logs, guard)
}
