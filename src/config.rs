use std::path::PathBuf;
use std::time::Duration;

pub const PROGRAM_ENV: &str = "MAGMA_REPL_PROGRAM";
pub const PROMPT_ENV: &str = "MAGMA_REPL_PROMPT";
pub const MAX_INPUT_LINE_ENV: &str = "MAGMA_REPL_MAX_INPUT_LINE";

const DEFAULT_PROGRAM: &str = "magma";
pub const DEFAULT_PROMPT: &str = "$MAGMA_REPL_PROMPT$";
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

const DRAIN_INITIAL_TIMEOUT: Duration = Duration::from_millis(500);
const DRAIN_MAX_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_QUIET_POLLS: u32 = 10;

/// Poll timing for the output drainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainTiming {
    pub initial_timeout: Duration,
    pub max_timeout: Duration,
    /// Consecutive empty polls before the timeout doubles.
    pub quiet_polls: u32,
}

impl Default for DrainTiming {
    fn default() -> Self {
        Self {
            initial_timeout: DRAIN_INITIAL_TIMEOUT,
            max_timeout: DRAIN_MAX_TIMEOUT,
            quiet_polls: DRAIN_QUIET_POLLS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub program: PathBuf,
    pub program_args: Vec<String>,
    pub prompt: String,
    /// Overrides the line-length threshold derived from the pty.
    pub max_input_line: Option<usize>,
    pub startup_timeout: Duration,
    pub drain: DrainTiming,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            program_args: Vec::new(),
            prompt: DEFAULT_PROMPT.to_string(),
            max_input_line: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            drain: DrainTiming::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();
        if let Some(program) = env_value(PROGRAM_ENV) {
            config.program = PathBuf::from(program);
        }
        if let Some(prompt) = env_value(PROMPT_ENV) {
            config.prompt = parse_prompt(&prompt)?;
        }
        if let Some(raw) = env_value(MAX_INPUT_LINE_ENV) {
            config.max_input_line = Some(parse_max_input_line(&raw)?);
        }
        Ok(config)
    }
}

fn env_value(key: &str) -> Option<String> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

/// The prompt is embedded in a `SetPrompt("...")` directive and matched verbatim in output.
pub fn parse_prompt(value: &str) -> Result<String, String> {
    if value.trim().is_empty() {
        return Err("prompt must not be empty".to_string());
    }
    if value.contains(['"', '\\', '\n', '\r']) {
        return Err(format!(
            "invalid prompt: {value:?} (quotes, backslashes and newlines are not allowed)"
        ));
    }
    if value == "> " {
        return Err("prompt must differ from the default Magma prompt \"> \"".to_string());
    }
    Ok(value.to_string())
}

pub fn parse_max_input_line(value: &str) -> Result<usize, String> {
    match value.trim().parse::<usize>() {
        Ok(0) | Err(_) => Err(format!(
            "invalid max input line: {value} (expected a positive integer)"
        )),
        Ok(parsed) => Ok(parsed),
    }
}

pub fn parse_startup_timeout_ms(value: &str) -> Result<Duration, String> {
    match value.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(format!(
            "invalid startup timeout: {value} (expected a positive number of milliseconds)"
        )),
        Ok(ms) => Ok(Duration::from_millis(ms)),
    }
}
