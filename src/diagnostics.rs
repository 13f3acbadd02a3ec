use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

static STARTUP_LOG_ENABLED: OnceLock<bool> = OnceLock::new();
static STARTUP_EPOCH: OnceLock<Instant> = OnceLock::new();
static STARTUP_LOG_FILE: OnceLock<Option<Mutex<std::fs::File>>> = OnceLock::new();
const STARTUP_LOG_ENV: &str = "MAGMA_REPL_DEBUG_STARTUP";
const STARTUP_LOG_PATH_ENV: &str = "MAGMA_REPL_DEBUG_STARTUP_FILE";
const STARTUP_LOG_DEFAULT: &str = "magma-repl-startup.log";

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false)
}

fn startup_enabled() -> bool {
    *STARTUP_LOG_ENABLED
        .get_or_init(|| env_flag(STARTUP_LOG_ENV) || env_flag(STARTUP_LOG_PATH_ENV))
}

/// Appends a timestamped line to the startup trace when it is enabled.
pub fn startup_log(message: impl AsRef<str>) {
    if !startup_enabled() {
        return;
    }
    let elapsed = STARTUP_EPOCH.get_or_init(Instant::now).elapsed();
    let file = STARTUP_LOG_FILE.get_or_init(|| {
        let path = std::env::var(STARTUP_LOG_PATH_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| STARTUP_LOG_DEFAULT.to_string());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
            .map(Mutex::new)
    });
    let Some(file) = file else {
        return;
    };
    if let Ok(mut guard) = file.lock() {
        let _ = writeln!(
            *guard,
            "[magma-repl][startup +{:>6}ms] {}",
            elapsed.as_millis(),
            message.as_ref()
        );
        let _ = guard.flush();
    }
}
