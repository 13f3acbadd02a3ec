use std::time::{Duration, Instant};

use serde_json::json;

use crate::bridge::InterruptHandle;
use crate::channel::{Expect, ReplChannel};
use crate::config::DrainTiming;
use crate::event_log;
use crate::relay::{OutputFilter, partial_suffix_len};
use crate::session::SessionError;

const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Poll timeout that doubles after a run of quiet polls and resets on output.
#[derive(Debug, Clone)]
pub(crate) struct BackoffTimer {
    timing: DrainTiming,
    timeout: Duration,
    quiet_polls: u32,
}

impl BackoffTimer {
    pub(crate) fn new(timing: DrainTiming) -> Self {
        Self {
            timing,
            timeout: timing.initial_timeout,
            quiet_polls: 0,
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn record_poll(&mut self, saw_output: bool) {
        if saw_output {
            self.timeout = self.timing.initial_timeout;
            self.quiet_polls = 0;
            return;
        }
        self.quiet_polls += 1;
        if self.quiet_polls >= self.timing.quiet_polls {
            self.quiet_polls = 0;
            self.timeout = (self.timeout * 2).min(self.timing.max_timeout);
        }
    }
}

/// Output of one submission, and how much of it the caller has already seen.
#[derive(Debug, Default)]
pub(crate) struct OutputBuffer {
    committed: String,
    watermark: usize,
}

impl OutputBuffer {
    /// Returns the visible text past the watermark, advancing it.
    fn update(&mut self, cycle: &str, filter: &OutputFilter, complete: bool) -> Option<String> {
        let raw = format!("{}{cycle}", self.committed);
        let visible = filter.visible(&raw, complete);
        if visible.len() < self.watermark {
            event_log::log(
                "drain_watermark_regressed",
                json!({ "watermark": self.watermark, "visible_len": visible.len() }),
            );
            return None;
        }
        let chunk = visible.get(self.watermark..)?;
        if chunk.is_empty() {
            return None;
        }
        let chunk = chunk.to_string();
        self.watermark = visible.len();
        Some(chunk)
    }

    fn commit(&mut self, cycle: &str) {
        self.committed.push_str(cycle);
    }

    /// Raw text of every completed prompt cycle so far.
    pub(crate) fn raw(&self) -> &str {
        &self.committed
    }

    #[cfg(test)]
    pub(crate) fn watermark(&self) -> usize {
        self.watermark
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DrainEnd {
    Prompt,
    Eof,
    Interrupted,
}

#[derive(Debug)]
pub(crate) struct Drained {
    pub(crate) end: DrainEnd,
    /// Visible text that arrived with the final poll and was not emitted.
    pub(crate) tail: String,
}

/// Waits for `prompt`, forwarding output through `emit` as it arrives.
///
/// A pending cancellation is honoured only after a zero-length poll finds no prompt, so a
/// statement that already finished is never reported as interrupted.
pub(crate) fn drain_until_prompt(
    channel: &mut dyn ReplChannel,
    prompt: &str,
    timing: DrainTiming,
    buffer: &mut OutputBuffer,
    filter: &OutputFilter,
    emit: &mut dyn FnMut(&str),
    cancel: Option<&InterruptHandle>,
) -> Result<Drained, SessionError> {
    let mut timer = BackoffTimer::new(timing);
    let mut seen_len = 0usize;
    loop {
        let cancelling = cancel.is_some_and(InterruptHandle::is_requested);
        let outcome = if cancelling {
            channel.expect(prompt, Duration::ZERO)?
        } else {
            poll(channel, prompt, timer.timeout(), cancel)?
        };
        let end = match outcome {
            Expect::Timeout(snapshot) => {
                timer.record_poll(snapshot.len() > seen_len);
                seen_len = seen_len.max(snapshot.len());
                // A prompt may be arriving in pieces.
                let held = partial_suffix_len(&snapshot, prompt);
                let settled = &snapshot[..snapshot.len() - held];
                if let Some(chunk) = buffer.update(settled, filter, false) {
                    emit(&chunk);
                }
                if !cancelling {
                    continue;
                }
                if let Some(handle) = cancel {
                    handle.clear();
                }
                return Ok(Drained {
                    end: DrainEnd::Interrupted,
                    tail: String::new(),
                });
            }
            Expect::Prompt(before) => {
                buffer.commit(&before);
                DrainEnd::Prompt
            }
            Expect::Eof(rest) => {
                buffer.commit(&rest);
                DrainEnd::Eof
            }
        };
        let tail = buffer.update("", filter, true).unwrap_or_default();
        return Ok(Drained { end, tail });
    }
}

/// One drainer poll. With a cancellation handle the wait is sliced so a request is noticed
/// within [`CANCEL_CHECK_INTERVAL`].
fn poll(
    channel: &mut dyn ReplChannel,
    prompt: &str,
    timeout: Duration,
    cancel: Option<&InterruptHandle>,
) -> Result<Expect, SessionError> {
    let Some(handle) = cancel else {
        return channel.expect(prompt, timeout);
    };
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let slice = remaining.min(CANCEL_CHECK_INTERVAL);
        match channel.expect(prompt, slice)? {
            Expect::Timeout(_) if remaining > slice && !handle.is_requested() => continue,
            other => return Ok(other),
        }
    }
}
