use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;

use crate::channel::{PtyLauncher, SessionLauncher};
use crate::completion::{self, CompletionRequest};
use crate::config::{BridgeConfig, DrainTiming};
use crate::drain::{DrainEnd, OutputBuffer, drain_until_prompt};
use crate::event_log;
use crate::help;
use crate::protocol::{CompletionReply, ExecuteReply, ReplContent, TextStream};
use crate::relay::{OutputFilter, RelayFile, RelayMode, Submission, is_load_notice};
use crate::session::{Session, SessionError, SessionState};

pub const RESTART_NOTICE: &str = "Restarting Magma";

/// Requests cancellation of the running submission. Usable without holding the bridge.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    requested: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub(crate) fn take_request(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }
}

/// Collects the chunks of one submission and forwards them to the caller's sink.
struct ChunkForwarder<'a> {
    silent: bool,
    contents: Vec<ReplContent>,
    sink: &'a mut dyn FnMut(&str),
}

impl<'a> ChunkForwarder<'a> {
    fn new(silent: bool, sink: &'a mut dyn FnMut(&str)) -> Self {
        Self {
            silent,
            contents: Vec::new(),
            sink,
        }
    }

    fn emit(&mut self, chunk: &str) {
        if chunk.is_empty() || self.silent {
            return;
        }
        (self.sink)(chunk);
        if let Some(ReplContent::ContentText {
            text,
            stream: TextStream::Stdout,
        }) = self.contents.last_mut()
        {
            text.push_str(chunk);
            return;
        }
        self.contents.push(ReplContent::stdout(chunk));
    }

    fn ends_mid_line(&self) -> bool {
        matches!(
            self.contents.last(),
            Some(ReplContent::ContentText { text, .. }) if !text.is_empty() && !text.ends_with('\n')
        )
    }

    fn into_contents(self) -> Vec<ReplContent> {
        self.contents
    }
}

/// Owns the live Magma session and runs submissions against it one at a time.
pub struct Bridge {
    config: BridgeConfig,
    launcher: Box<dyn SessionLauncher>,
    session: Option<Session>,
    execution_count: u64,
    interrupt: InterruptHandle,
}

impl Bridge {
    /// Starts Magma under a pseudo-terminal. Failure here is fatal to the caller.
    pub fn start(config: BridgeConfig) -> Result<Self, SessionError> {
        Self::with_launcher(config, Box::new(PtyLauncher))
    }

    pub(crate) fn with_launcher(
        config: BridgeConfig,
        launcher: Box<dyn SessionLauncher>,
    ) -> Result<Self, SessionError> {
        let session = Session::start(launcher.as_ref(), &config)?;
        Ok(Self {
            config,
            launcher,
            session: Some(session),
            execution_count: 0,
            interrupt: InterruptHandle::default(),
        })
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    #[cfg(test)]
    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    pub fn summary(&self) -> String {
        match &self.session {
            Some(session) => session.summary(),
            None => "Magma REPL bridge (no live Magma session)".to_string(),
        }
    }

    pub fn banner(&self) -> Option<&str> {
        self.session.as_ref().map(Session::banner)
    }

    #[cfg(test)]
    pub(crate) fn session_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(Session::state)
    }

    /// Runs `code`, streaming output chunks to `on_chunk` as they arrive.
    pub fn execute(
        &mut self,
        code: &str,
        silent: bool,
        on_chunk: &mut dyn FnMut(&str),
    ) -> ExecuteReply {
        let code = code.trim_end();
        if code.trim_start().is_empty() {
            return ExecuteReply::ok(self.execution_count, Vec::new());
        }
        if !silent {
            self.execution_count += 1;
        }
        let count = self.execution_count;

        if let Some(keyword) = code.trim_start().strip_prefix('?') {
            return ExecuteReply::ok(count, vec![help::help_content(keyword.trim())]);
        }

        let timing = self.config.drain;
        let interrupt = self.interrupt.clone();
        let session = match self.ensure_session() {
            Ok(session) => session,
            Err(err) => {
                return ExecuteReply::failed(count, Vec::new(), format!("magma is unavailable: {err}"));
            }
        };
        let Some(submission) = Submission::prepare(code, session.max_input_line()) else {
            return ExecuteReply::ok(count, Vec::new());
        };
        let relay = match submission.mode() {
            RelayMode::Inline => None,
            RelayMode::File => match RelayFile::create(submission.normalized()) {
                Ok(relay) => Some(relay),
                Err(err) => {
                    return ExecuteReply::failed(
                        count,
                        Vec::new(),
                        format!("failed to write relay file: {err}"),
                    );
                }
            },
        };
        if let Some(relay) = &relay {
            event_log::log_lazy("relay_file", || {
                json!({
                    "bytes": submission.normalized().len(),
                    "threshold": session.max_input_line(),
                    "path": relay.path().to_string_lossy(),
                })
            });
        }

        interrupt.clear();
        session.set_state(SessionState::Busy);
        let mut forward = ChunkForwarder::new(silent, on_chunk);
        let outcome = run_submission(
            session,
            &submission,
            relay.as_ref(),
            timing,
            &interrupt,
            &mut forward,
        );
        drop(relay);

        match outcome {
            Ok(DrainEnd::Prompt) => {
                session.set_state(SessionState::Ready);
                ExecuteReply::ok(count, forward.into_contents())
            }
            Ok(DrainEnd::Interrupted) => {
                session.set_state(SessionState::Ready);
                ExecuteReply::aborted(
                    count,
                    forward.into_contents(),
                    Some(SessionError::Interrupted.to_string()),
                )
            }
            Ok(DrainEnd::Eof) => self.recover_from_exit(count, forward, None),
            Err(err) => self.recover_from_exit(count, forward, Some(err)),
        }
    }

    /// Completes the token around `cursor` (a character offset).
    pub fn complete(&mut self, code: &str, cursor: usize) -> CompletionReply {
        let cursor = cursor.min(code.chars().count());
        let Some(request) = CompletionRequest::extract(code, cursor) else {
            return CompletionReply::empty(cursor);
        };
        let timing = self.config.drain;
        let session = match self.ensure_session() {
            Ok(session) => session,
            Err(_) => return CompletionReply::empty(cursor),
        };
        session.set_state(SessionState::Busy);
        match completion::query(session, &request, timing) {
            Ok(reply) => {
                session.set_state(SessionState::Ready);
                reply
            }
            Err(err) => {
                event_log::log("completion_failed", json!({ "error": err.to_string() }));
                session.terminate();
                if let Err(err) = self.restart() {
                    eprintln!("magma-repl: restart after completion failure failed: {err}");
                }
                CompletionReply::empty(cursor)
            }
        }
    }

    /// Replaces the session with a freshly started one.
    pub fn restart(&mut self) -> Result<(), SessionError> {
        if let Some(mut previous) = self.session.take() {
            previous.set_state(SessionState::Restarting);
            previous.terminate();
        }
        event_log::log("session_restarting", json!({}));
        self.session = Some(Session::start(self.launcher.as_ref(), &self.config)?);
        Ok(())
    }

    /// Restarts Magma and starts counting executions from zero.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        self.execution_count = 0;
        self.restart()
    }

    pub fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.terminate();
        }
    }

    fn ensure_session(&mut self) -> Result<&mut Session, SessionError> {
        let needs_start = self
            .session
            .as_ref()
            .is_none_or(|session| session.state() == SessionState::Terminated);
        if needs_start {
            self.restart()?;
        }
        self.session.as_mut().ok_or(SessionError::ChildTerminated)
    }

    fn recover_from_exit(
        &mut self,
        count: u64,
        mut forward: ChunkForwarder<'_>,
        cause: Option<SessionError>,
    ) -> ExecuteReply {
        if let Some(session) = self.session.as_mut() {
            session.terminate();
        }
        event_log::log(
            "session_exited",
            json!({ "cause": cause.as_ref().map(ToString::to_string) }),
        );
        if forward.ends_mid_line() {
            forward.emit("\n");
        }
        forward.emit(RESTART_NOTICE);
        match self.restart() {
            Ok(()) => ExecuteReply::ok(count, forward.into_contents()),
            Err(err) => ExecuteReply::failed(
                count,
                forward.into_contents(),
                format!("failed to restart magma: {err}"),
            ),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_submission(
    session: &mut Session,
    submission: &Submission,
    relay: Option<&RelayFile>,
    timing: DrainTiming,
    interrupt: &InterruptHandle,
    forward: &mut ChunkForwarder<'_>,
) -> Result<DrainEnd, SessionError> {
    let mut buffer = OutputBuffer::default();
    let Some(relay) = relay else {
        for (idx, line) in submission.lines().enumerate() {
            // Lines not yet sent are dropped on interrupt; the child is already idle.
            if idx > 0 && interrupt.take_request() {
                return Ok(DrainEnd::Interrupted);
            }
            session.channel_mut().send_line(line)?;
            let end = drain_cycle(
                session,
                timing,
                &mut buffer,
                &OutputFilter::Passthrough,
                interrupt,
                forward,
            )?;
            if end != DrainEnd::Prompt {
                return Ok(end);
            }
        }
        return Ok(DrainEnd::Prompt);
    };

    session.channel_mut().send_line(&relay.directive())?;
    let end = drain_cycle(session, timing, &mut buffer, &relay.filter(), interrupt, forward)?;
    let path = relay.path().to_string_lossy();
    let first_line = buffer.raw().lines().next().unwrap_or("");
    if end == DrainEnd::Prompt && !is_load_notice(first_line, &path) {
        event_log::log(
            "relay_notice_mismatch",
            json!({ "expected_path": path, "first_line": first_line }),
        );
    }
    Ok(end)
}

/// Drains one prompt cycle. An interrupt request is delivered as SIGINT and the prompt that
/// acknowledges it is awaited without further cancellation.
fn drain_cycle(
    session: &mut Session,
    timing: DrainTiming,
    buffer: &mut OutputBuffer,
    filter: &OutputFilter,
    interrupt: &InterruptHandle,
    forward: &mut ChunkForwarder<'_>,
) -> Result<DrainEnd, SessionError> {
    let prompt = session.prompt().to_string();
    let channel = session.channel_mut();
    let drained = drain_until_prompt(
        channel,
        &prompt,
        timing,
        buffer,
        filter,
        &mut |chunk| forward.emit(chunk),
        Some(interrupt),
    )?;
    forward.emit(&drained.tail);
    if drained.end != DrainEnd::Interrupted {
        return Ok(drained.end);
    }

    event_log::log("interrupt_delivered", json!({}));
    channel.interrupt()?;
    let acknowledged = drain_until_prompt(
        channel,
        &prompt,
        timing,
        buffer,
        filter,
        &mut |chunk| forward.emit(chunk),
        None,
    )?;
    forward.emit(&acknowledged.tail);
    Ok(match acknowledged.end {
        DrainEnd::Eof => DrainEnd::Eof,
        _ => DrainEnd::Interrupted,
    })
}
