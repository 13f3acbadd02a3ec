//! Scripted stand-ins for a Magma child, used by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bridge::InterruptHandle;
use crate::channel::{Expect, ReplChannel, SessionLauncher};
use crate::config::BridgeConfig;
use crate::session::{DEFAULT_PROMPT, SessionError};

const FAKE_BANNER: &str = "Magma V2.28-3     Thu Oct 16 2026 12:00:00 on fakehost [Seed = 42]\nType ? for help.  Type <Ctrl>-D to quit.\n";

#[derive(Debug, Clone)]
pub(crate) struct FakeScript {
    pub(crate) banner: String,
    pub(crate) max_canon: Option<usize>,
    pub(crate) completion_reply: String,
    /// When false the child never acknowledges `SetPrompt`.
    pub(crate) answers_set_prompt: bool,
    /// Print a line and queue the prompt in one chunk, then request an interrupt.
    pub(crate) interrupt_after_output: bool,
    /// Printed by `crash;` right before the child exits.
    pub(crate) crash_output: String,
    /// `spin;` requests an interrupt on the attached handle after this many polls.
    pub(crate) interrupt_after_polls: Option<u32>,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self {
            banner: FAKE_BANNER.to_string(),
            max_canon: Some(255),
            completion_reply: "DIE\n".to_string(),
            answers_set_prompt: true,
            interrupt_after_output: false,
            crash_output: String::new(),
            interrupt_after_polls: None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeLog {
    pub(crate) sent: Vec<String>,
    pub(crate) launches: u32,
    pub(crate) interrupts: u32,
    pub(crate) shutdowns: u32,
    /// Path and contents of every file passed to `load`.
    pub(crate) loaded_files: Vec<(String, String)>,
}

#[derive(Clone)]
pub(crate) struct FakeLauncher {
    script: FakeScript,
    log: Arc<Mutex<FakeLog>>,
    failures: Arc<AtomicU32>,
    interrupt: Arc<Mutex<Option<InterruptHandle>>>,
}

impl FakeLauncher {
    pub(crate) fn new(script: FakeScript) -> Self {
        Self {
            script,
            log: Arc::new(Mutex::new(FakeLog::default())),
            failures: Arc::new(AtomicU32::new(0)),
            interrupt: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn log(&self) -> Arc<Mutex<FakeLog>> {
        self.log.clone()
    }

    pub(crate) fn fail_next_launches(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn attach_interrupt(&self, handle: InterruptHandle) {
        *self.interrupt.lock().unwrap() = Some(handle);
    }
}

impl SessionLauncher for FakeLauncher {
    fn launch(&self, _config: &BridgeConfig) -> Result<Box<dyn ReplChannel>, SessionError> {
        let pending_failure = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if pending_failure {
            return Err(SessionError::Startup("fake launch failure".to_string()));
        }
        self.log.lock().unwrap().launches += 1;
        let mut channel = FakeMagma {
            script: self.script.clone(),
            log: self.log.clone(),
            interrupt: self.interrupt.lock().unwrap().clone(),
            prompt: DEFAULT_PROMPT.to_string(),
            queued: VecDeque::new(),
            stream: String::new(),
            exit_pending: false,
            exited: false,
            spin_polls: None,
        };
        channel.queue(&self.script.banner);
        channel.queue(DEFAULT_PROMPT);
        Ok(Box::new(channel))
    }
}

/// Releases one queued output chunk per `expect` call.
struct FakeMagma {
    script: FakeScript,
    log: Arc<Mutex<FakeLog>>,
    interrupt: Option<InterruptHandle>,
    prompt: String,
    queued: VecDeque<String>,
    stream: String,
    exit_pending: bool,
    exited: bool,
    spin_polls: Option<u32>,
}

impl FakeMagma {
    fn queue(&mut self, text: &str) {
        self.queued.push_back(text.to_string());
    }

    fn queue_prompt(&mut self) {
        let prompt = self.prompt.clone();
        self.queue(&prompt);
    }

    fn run_load(&mut self, path: &str) {
        let contents = std::fs::read_to_string(path).unwrap_or_default();
        self.log
            .lock()
            .unwrap()
            .loaded_files
            .push((path.to_string(), contents.clone()));
        self.queue(&format!("Loading \"{path}\"\n"));
        for (idx, line) in contents.lines().enumerate() {
            match line.trim() {
                "spin;" => {
                    self.spin_polls = Some(0);
                    return;
                }
                "crash;" => {
                    let output = self.script.crash_output.clone();
                    self.queue(&output);
                    self.exit_pending = true;
                    return;
                }
                _ => {}
            }
            let output = evaluate(line);
            if line.trim() == "fail;" {
                self.queue(&format!("In file \"{path}\", line {}, column 1:\n", idx + 1));
            }
            self.queue(&output);
        }
        self.queue_prompt();
    }
}

fn evaluate(statement: &str) -> String {
    let statement = statement.trim();
    if let Some(value) = statement
        .strip_prefix("print ")
        .and_then(|rest| rest.strip_suffix(';'))
    {
        return format!("{value}\n");
    }
    if statement == "fail;" {
        return ">> fail;\n".to_string();
    }
    String::new()
}

fn quoted_argument(line: &str, intrinsic: &str) -> Option<String> {
    let rest = line.strip_prefix(intrinsic)?.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

impl ReplChannel for FakeMagma {
    fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        if self.exited {
            return Err(SessionError::Io(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )));
        }
        self.log.lock().unwrap().sent.push(line.to_string());
        if let Some(prompt) = quoted_argument(line, "SetPrompt(") {
            if self.script.answers_set_prompt {
                self.prompt = prompt;
                self.queue_prompt();
            }
        } else if let Some(path) = quoted_argument(line, "load ") {
            self.run_load(&path);
        } else if line.starts_with("Completion(") {
            let reply = self.script.completion_reply.clone();
            self.queue(&reply);
            self.queue_prompt();
        } else if line == "crash;" {
            let output = self.script.crash_output.clone();
            self.queue(&output);
            self.exit_pending = true;
        } else if line == "spin;" {
            self.spin_polls = Some(0);
        } else if self.script.interrupt_after_output {
            let output = format!("{}{}", evaluate(line), self.prompt);
            self.queue(&output);
            if let Some(handle) = &self.interrupt {
                handle.request();
            }
        } else {
            let output = evaluate(line);
            self.queue(&output);
            self.queue_prompt();
        }
        Ok(())
    }

    fn expect(&mut self, prompt: &str, timeout: Duration) -> Result<Expect, SessionError> {
        if let Some(chunk) = self.queued.pop_front() {
            self.stream.push_str(&chunk);
        }
        if let Some(pos) = self.stream.find(prompt) {
            let before = self.stream[..pos].to_string();
            self.stream.drain(..pos + prompt.len());
            return Ok(Expect::Prompt(before));
        }
        if self.queued.is_empty() && (self.exit_pending || self.exited) {
            self.exited = true;
            return Ok(Expect::Eof(std::mem::take(&mut self.stream)));
        }
        if let Some(polls) = self.spin_polls.as_mut() {
            *polls += 1;
            if Some(*polls) == self.script.interrupt_after_polls
                && let Some(handle) = &self.interrupt
            {
                handle.request();
            }
        }
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(Expect::Timeout(self.stream.clone()))
    }

    fn interrupt(&mut self) -> Result<(), SessionError> {
        self.log.lock().unwrap().interrupts += 1;
        if self.spin_polls.take().is_some() {
            self.queue("[Interrupted]\n");
            self.queue_prompt();
        }
        Ok(())
    }

    fn max_input_line(&self) -> Option<usize> {
        self.script.max_canon
    }

    fn shutdown(&mut self) {
        self.log.lock().unwrap().shutdowns += 1;
        self.exited = true;
    }
}

/// Replays a fixed sequence of `expect` outcomes.
pub(crate) struct ScriptedChannel {
    outcomes: VecDeque<Expect>,
}

impl ScriptedChannel {
    pub(crate) fn new(outcomes: Vec<Expect>) -> Self {
        Self {
            outcomes: outcomes.into(),
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.outcomes.len()
    }
}

impl ReplChannel for ScriptedChannel {
    fn send_line(&mut self, _line: &str) -> Result<(), SessionError> {
        Ok(())
    }

    fn expect(&mut self, _prompt: &str, _timeout: Duration) -> Result<Expect, SessionError> {
        self.outcomes
            .pop_front()
            .ok_or_else(|| SessionError::Protocol("scripted channel exhausted".to_string()))
    }

    fn interrupt(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn max_input_line(&self) -> Option<usize> {
        None
    }

    fn shutdown(&mut self) {}
}
