use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::json;

use crate::channel::{Expect, ReplChannel, SessionLauncher};
use crate::config::BridgeConfig;
use crate::event_log;

/// Prompt printed by a freshly started Magma before the sentinel is installed.
pub(crate) const DEFAULT_PROMPT: &str = "> ";
const SETUP_COMMANDS: [&str; 3] = [
    "SetColumns(0);",
    "SetAutoColumns(false);",
    "SetLineEditor(false);",
];
const MAX_CANON_MARGIN: usize = 10;
pub(crate) const FALLBACK_MAX_INPUT_LINE: usize = 128;

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"V(\d+)\.(\d+)-(\d+)").expect("valid version pattern"));

#[derive(Debug)]
pub enum SessionError {
    Io(std::io::Error),
    Startup(String),
    Protocol(String),
    ChildTerminated,
    Interrupted,
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err)
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Io(err) => write!(f, "magma session io error: {err}"),
            SessionError::Startup(message) => write!(f, "magma failed to start: {message}"),
            SessionError::Protocol(message) => write!(f, "magma protocol error: {message}"),
            SessionError::ChildTerminated => write!(f, "magma exited unexpectedly"),
            SessionError::Interrupted => write!(f, "magma submission interrupted"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Starting,
    Ready,
    Busy,
    Restarting,
    Terminated,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Uninitialized, Starting)
                | (Starting, Ready)
                | (Starting, Terminated)
                | (Ready, Busy)
                | (Busy, Ready)
                | (Busy, Terminated)
                | (Ready, Terminated)
                | (Ready, Restarting)
                | (Terminated, Restarting)
                | (Restarting, Terminated)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl LanguageVersion {
    pub fn parse_banner(banner: &str) -> Option<Self> {
        let captures = VERSION_PATTERN.captures(banner)?;
        Some(Self {
            major: captures[1].parse().ok()?,
            minor: captures[2].parse().ok()?,
            patch: captures[3].parse().ok()?,
        })
    }
}

impl std::fmt::Display for LanguageVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}-{}", self.major, self.minor, self.patch)
    }
}

/// Restores the previous SIGINT disposition on drop.
struct SigintDefault {
    previous: libc::sighandler_t,
}

impl SigintDefault {
    fn install() -> Self {
        let previous = unsafe { libc::signal(libc::SIGINT, libc::SIG_DFL) };
        Self { previous }
    }
}

impl Drop for SigintDefault {
    fn drop(&mut self) {
        if self.previous != libc::SIG_ERR {
            unsafe {
                libc::signal(libc::SIGINT, self.previous);
            }
        }
    }
}

/// One live Magma child, from a completed handshake until it is discarded.
pub(crate) struct Session {
    channel: Box<dyn ReplChannel>,
    prompt: String,
    banner: String,
    version: LanguageVersion,
    max_input_line: usize,
    state: SessionState,
}

impl Session {
    pub(crate) fn start(
        launcher: &dyn SessionLauncher,
        config: &BridgeConfig,
    ) -> Result<Self, SessionError> {
        let started = Instant::now();
        let channel = {
            let _sigint = SigintDefault::install();
            launcher.launch(config)?
        };
        let mut session = Self {
            channel,
            prompt: config.prompt.clone(),
            banner: String::new(),
            version: LanguageVersion {
                major: 0,
                minor: 0,
                patch: 0,
            },
            max_input_line: FALLBACK_MAX_INPUT_LINE,
            state: SessionState::Uninitialized,
        };
        session.set_state(SessionState::Starting);
        if let Err(err) = session.handshake(config) {
            session.terminate();
            event_log::log(
                "session_start_failed",
                json!({ "error": err.to_string(), "elapsed_ms": started.elapsed().as_millis() }),
            );
            return Err(err);
        }
        session.max_input_line = resolve_max_input_line(config, session.channel.as_ref());
        session.set_state(SessionState::Ready);
        event_log::log(
            "session_started",
            json!({
                "version": session.version.to_string(),
                "max_input_line": session.max_input_line,
                "elapsed_ms": started.elapsed().as_millis(),
            }),
        );
        Ok(session)
    }

    fn handshake(&mut self, config: &BridgeConfig) -> Result<(), SessionError> {
        let deadline = Instant::now() + config.startup_timeout;
        self.banner = self.await_prompt(DEFAULT_PROMPT, deadline, "startup banner")?;
        self.version = LanguageVersion::parse_banner(&self.banner).ok_or_else(|| {
            SessionError::Startup(format!(
                "no Magma version found in banner: {:?}",
                self.banner.trim()
            ))
        })?;
        for command in SETUP_COMMANDS {
            self.channel.send_line(command)?;
            self.await_prompt(DEFAULT_PROMPT, deadline, command)?;
        }
        let set_prompt = format!("SetPrompt(\"{}\");", self.prompt);
        self.channel.send_line(&set_prompt)?;
        let prompt = self.prompt.clone();
        self.await_prompt(&prompt, deadline, "SetPrompt")?;
        Ok(())
    }

    fn await_prompt(
        &mut self,
        prompt: &str,
        deadline: Instant,
        stage: &str,
    ) -> Result<String, SessionError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.channel.expect(prompt, remaining.max(Duration::from_millis(1)))? {
            Expect::Prompt(before) => Ok(before),
            Expect::Timeout(seen) => Err(SessionError::Startup(format!(
                "timed out waiting for {prompt:?} after {stage}; received {:?}",
                seen.trim()
            ))),
            Expect::Eof(rest) => Err(SessionError::Startup(format!(
                "magma exited during {stage}: {:?}",
                rest.trim()
            ))),
        }
    }

    pub(crate) fn channel_mut(&mut self) -> &mut dyn ReplChannel {
        self.channel.as_mut()
    }

    pub(crate) fn prompt(&self) -> &str {
        &self.prompt
    }

    pub(crate) fn banner(&self) -> &str {
        &self.banner
    }

    #[cfg(test)]
    pub(crate) fn version(&self) -> LanguageVersion {
        self.version
    }

    pub(crate) fn max_input_line(&self) -> usize {
        self.max_input_line
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn summary(&self) -> String {
        format!("Magma REPL bridge connected to Magma {}", self.version)
    }

    /// Applies `next` if the lifecycle allows it. Rejected transitions leave the state as is.
    pub(crate) fn set_state(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            event_log::log(
                "session_state_invalid",
                json!({ "from": format!("{:?}", self.state), "to": format!("{next:?}") }),
            );
            return false;
        }
        self.state = next;
        true
    }

    /// Kills the child process group and marks the session dead.
    pub(crate) fn terminate(&mut self) {
        self.channel.shutdown();
        if self.state != SessionState::Terminated {
            self.set_state(SessionState::Terminated);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.channel.shutdown();
    }
}

fn resolve_max_input_line(config: &BridgeConfig, channel: &dyn ReplChannel) -> usize {
    if let Some(limit) = config.max_input_line {
        return limit;
    }
    match channel.max_input_line() {
        Some(limit) if limit > MAX_CANON_MARGIN => limit - MAX_CANON_MARGIN,
        reported => {
            event_log::log(
                "platform_limit_unavailable",
                json!({ "reported": reported, "fallback": FALLBACK_MAX_INPUT_LINE }),
            );
            FALLBACK_MAX_INPUT_LINE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_repl::{FakeLauncher, FakeScript};

    fn config() -> BridgeConfig {
        BridgeConfig {
            prompt: "$P$".to_string(),
            startup_timeout: Duration::from_secs(2),
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn parses_version_from_banner() {
        let banner = "Magma V2.28-3     Thu Oct 16 2026 12:00:00 on host [Seed = 1]\nType ? for help.\n";
        let version = LanguageVersion::parse_banner(banner).expect("version");
        assert_eq!(
            version,
            LanguageVersion {
                major: 2,
                minor: 28,
                patch: 3
            }
        );
        assert_eq!(version.to_string(), "2.28-3");
        assert_eq!(LanguageVersion::parse_banner("Welcome to something"), None);
    }

    #[test]
    fn state_machine_rejects_skipping_startup() {
        assert!(SessionState::Uninitialized.can_transition_to(SessionState::Starting));
        assert!(SessionState::Busy.can_transition_to(SessionState::Terminated));
        assert!(SessionState::Terminated.can_transition_to(SessionState::Restarting));
        assert!(!SessionState::Uninitialized.can_transition_to(SessionState::Busy));
        assert!(!SessionState::Busy.can_transition_to(SessionState::Restarting));
        assert!(!SessionState::Terminated.can_transition_to(SessionState::Busy));
    }

    #[test]
    fn start_performs_setup_handshake() {
        let launcher = FakeLauncher::new(FakeScript::default());
        let log = launcher.log();
        let session = Session::start(&launcher, &config()).expect("session starts");

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.version().to_string(), "2.28-3");
        assert_eq!(
            session.summary(),
            "Magma REPL bridge connected to Magma 2.28-3"
        );
        assert!(session.banner().starts_with("Magma V2.28-3"));
        assert_eq!(
            log.lock().unwrap().sent,
            vec![
                "SetColumns(0);".to_string(),
                "SetAutoColumns(false);".to_string(),
                "SetLineEditor(false);".to_string(),
                "SetPrompt(\"$P$\");".to_string(),
            ]
        );
    }

    #[test]
    fn missing_version_is_a_startup_failure() {
        let launcher = FakeLauncher::new(FakeScript {
            banner: "Some other program\n".to_string(),
            ..FakeScript::default()
        });
        let log = launcher.log();
        let err = Session::start(&launcher, &config())
            .err()
            .expect("startup should fail");
        assert!(matches!(err, SessionError::Startup(_)), "{err}");
        assert!(log.lock().unwrap().shutdowns >= 1);
    }

    #[test]
    fn silent_handshake_times_out_as_startup_failure() {
        let launcher = FakeLauncher::new(FakeScript {
            answers_set_prompt: false,
            ..FakeScript::default()
        });
        let log = launcher.log();
        let err = Session::start(&launcher, &config())
            .err()
            .expect("startup should fail");
        match err {
            SessionError::Startup(message) => {
                assert!(message.contains("timed out"), "{message}");
                assert!(message.contains("SetPrompt"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(log.lock().unwrap().shutdowns >= 1);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let launcher = FakeLauncher::new(FakeScript::default());
        let mut session = Session::start(&launcher, &config()).expect("session starts");
        assert!(!session.set_state(SessionState::Starting));
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.set_state(SessionState::Busy));
        assert!(!session.set_state(SessionState::Restarting));
        assert_eq!(session.state(), SessionState::Busy);
        session.terminate();
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[test]
    fn limit_falls_back_when_platform_reports_none() {
        let launcher = FakeLauncher::new(FakeScript {
            max_canon: None,
            ..FakeScript::default()
        });
        let session = Session::start(&launcher, &config()).expect("session starts");
        assert_eq!(session.max_input_line(), FALLBACK_MAX_INPUT_LINE);
    }

    #[test]
    fn limit_subtracts_margin_from_max_canon_and_honors_override() {
        let launcher = FakeLauncher::new(FakeScript {
            max_canon: Some(255),
            ..FakeScript::default()
        });
        let session = Session::start(&launcher, &config()).expect("session starts");
        assert_eq!(session.max_input_line(), 245);

        let overridden = BridgeConfig {
            max_input_line: Some(40),
            ..config()
        };
        let session = Session::start(&launcher, &overridden).expect("session starts");
        assert_eq!(session.max_input_line(), 40);
    }
}
