//! Opt-in JSONL trace of bridge events, one file per process.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use serde::Serialize;
use serde_json::{Value as JsonValue, json};

pub const DEBUG_EVENTS_DIR_ENV: &str = "MAGMA_REPL_DEBUG_EVENTS_DIR";

static SINK: OnceLock<Option<EventSink>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct StartupContext {
    pub mode: String,
    pub program: String,
    pub prompt: String,
}

/// One line of the trace.
#[derive(Debug, Serialize)]
struct EventRecord<'a> {
    seq: u64,
    uptime_ms: u128,
    pid: u32,
    event: &'a str,
    payload: JsonValue,
}

#[derive(Debug)]
struct EventSink {
    file: Mutex<File>,
    path: PathBuf,
    opened: Instant,
    pid: u32,
    next_seq: AtomicU64,
}

impl EventSink {
    fn open(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let pid = std::process::id();
        let (file, path) = tempfile::Builder::new()
            .prefix(&format!("magma-repl-{pid}-"))
            .suffix(".jsonl")
            .tempfile_in(dir)?
            .keep()
            .map_err(|err| err.error)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
            opened: Instant::now(),
            pid,
            next_seq: AtomicU64::new(1),
        })
    }

    fn record(&self, event: &str, payload: JsonValue) -> std::io::Result<()> {
        let record = EventRecord {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            uptime_ms: self.opened.elapsed().as_millis(),
            pid: self.pid,
            event,
            payload,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(|err| err.into_inner());
        file.write_all(&line)?;
        file.flush()
    }
}

/// Opens the trace when a directory is given or set in the environment. Later calls are no-ops.
pub fn initialize(
    debug_events_dir: Option<PathBuf>,
    context: StartupContext,
) -> Result<(), Box<dyn std::error::Error>> {
    if SINK.get().is_some() {
        return Ok(());
    }
    let sink = match events_dir(debug_events_dir) {
        Some(dir) => {
            let sink = EventSink::open(&dir)?;
            sink.record(
                "startup",
                json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "mode": context.mode,
                    "program": context.program,
                    "prompt": context.prompt,
                    "log_file": sink.path.to_string_lossy(),
                }),
            )?;
            Some(sink)
        }
        None => None,
    };
    let _ = SINK.set(sink);
    Ok(())
}

pub fn log(event: &str, payload: JsonValue) {
    if let Some(sink) = active_sink() {
        let _ = sink.record(event, payload);
    }
}

/// Like [`log`], but only builds the payload when a trace file is open.
pub fn log_lazy(event: &str, payload: impl FnOnce() -> JsonValue) {
    if let Some(sink) = active_sink() {
        let _ = sink.record(event, payload());
    }
}

fn active_sink() -> Option<&'static EventSink> {
    SINK.get().and_then(Option::as_ref)
}

fn events_dir(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit
        .filter(|dir| !dir.as_os_str().is_empty())
        .or_else(|| std::env::var_os(DEBUG_EVENTS_DIR_ENV).map(PathBuf::from))
        .filter(|dir| !dir.as_os_str().is_empty())
}
