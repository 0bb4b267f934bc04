//! JSON-lines event log shared by every relay task.
//!
//! Each record carries a dotted event name (`feed.connected`,
//! `api.request`, ...) so the stream can be filtered with `jq` or shipped
//! as-is to a log collector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

static SILENT: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
}

#[derive(Serialize)]
struct LogEvent<'a> {
    level: Level,
    event: &'a str,
    message: &'a str,
    timestamp_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
}

/// Mutes all output, used by benchmarks that drive the hot path.
pub fn set_silent(silent: bool) {
    SILENT.store(silent, Ordering::Relaxed);
}

pub fn is_silent() -> bool {
    SILENT.load(Ordering::Relaxed)
}

fn emit(level: Level, event: &str, message: &str, metadata: Option<Value>) {
    if is_silent() {
        return;
    }

    let entry = LogEvent {
        level,
        event,
        message,
        timestamp_ms: current_timestamp_ms(),
        metadata,
    };

    match serde_json::to_string(&entry) {
        Ok(payload) => {
            if level == Level::Error {
                eprintln!("{payload}");
            } else {
                println!("{payload}");
            }
        }
        Err(err) => eprintln!(
            "{{\"level\":\"error\",\"event\":\"logging_failure\",\"message\":\"failed to serialise log\",\"error\":\"{err}\"}}"
        ),
    }
}

pub fn info(event: &str, message: &str, metadata: Value) {
    emit(Level::Info, event, message, Some(metadata));
}

pub fn warn(event: &str, message: &str, metadata: Value) {
    emit(Level::Warn, event, message, Some(metadata));
}

pub fn error(event: &str, message: &str, metadata: Value) {
    emit(Level::Error, event, message, Some(metadata));
}

pub fn info_simple(event: &str, message: &str) {
    emit(Level::Info, event, message, None);
}

pub fn current_timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}
