use serde_json::json;

use crate::config::DrainTiming;
use crate::drain::{DrainEnd, OutputBuffer, drain_until_prompt};
use crate::event_log;
use crate::protocol::CompletionReply;
use crate::relay::OutputFilter;
use crate::session::{Session, SessionError};

/// Reply Magma prints when it refuses to complete a token.
pub const COMPLETION_REJECTED: &str = "DIE";
const TOKEN_DELIMITERS: [char; 4] = ['\n', ';', ' ', '('];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CompletionRequest {
    token: String,
    /// Characters of the token that sit before the cursor.
    prefix_len: usize,
    cursor: usize,
}

impl CompletionRequest {
    /// Token surrounding `cursor` (a character offset into `code`). `None` when it is empty.
    pub(crate) fn extract(code: &str, cursor: usize) -> Option<Self> {
        let split = code
            .char_indices()
            .nth(cursor)
            .map(|(idx, _)| idx)
            .unwrap_or(code.len());
        let cursor = code[..split].chars().count();
        let before = code[..split].rsplit(TOKEN_DELIMITERS).next().unwrap_or("");
        let after = code[split..].split(TOKEN_DELIMITERS).next().unwrap_or("");
        let token = format!("{before}{after}");
        if token.is_empty() {
            return None;
        }
        Some(Self {
            token,
            prefix_len: before.chars().count(),
            cursor,
        })
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    pub(crate) fn directive(&self) -> String {
        format!(
            "Completion(\"{}\", {});",
            self.token.replace('"', "\\\""),
            self.token.chars().count()
        )
    }

    /// Maps Magma's `count`, `start`, `span`, matches reply onto cursor offsets.
    pub(crate) fn parse_reply(&self, reply: &str) -> Result<CompletionReply, SessionError> {
        let mut lines = reply.lines();
        let count = parse_header(lines.next(), "match count")?;
        if count == 0 {
            return Ok(CompletionReply::empty(self.cursor));
        }
        let start = parse_header(lines.next(), "start offset")?;
        let span = parse_header(lines.next(), "span length")?;
        let matches: Vec<String> = lines.map(str::to_string).collect();
        if matches.len() != count {
            return Err(SessionError::Protocol(format!(
                "completion reply announced {count} matches but carried {}",
                matches.len()
            )));
        }
        let token_start = self.cursor - self.prefix_len;
        let range = token_start
            .checked_add(start)
            .and_then(|cursor_start| Some((cursor_start, cursor_start.checked_add(span)?)));
        let Some((cursor_start, cursor_end)) = range else {
            return Err(SessionError::Protocol(format!(
                "completion span out of range: start {start}, length {span}"
            )));
        };
        Ok(CompletionReply {
            matches,
            cursor_start,
            cursor_end,
        })
    }
}

fn parse_header(line: Option<&str>, field: &str) -> Result<usize, SessionError> {
    let line = line.ok_or_else(|| {
        SessionError::Protocol(format!("completion reply is missing the {field}"))
    })?;
    line.trim().parse::<usize>().map_err(|_| {
        SessionError::Protocol(format!("completion reply has a non-numeric {field}: {line:?}"))
    })
}

/// Runs one completion round trip. Malformed replies degrade to no matches; only a dead
/// child is reported as an error.
pub(crate) fn query(
    session: &mut Session,
    request: &CompletionRequest,
    timing: DrainTiming,
) -> Result<CompletionReply, SessionError> {
    let prompt = session.prompt().to_string();
    let channel = session.channel_mut();
    channel.send_line(&request.directive())?;
    let mut buffer = OutputBuffer::default();
    let drained = drain_until_prompt(
        channel,
        &prompt,
        timing,
        &mut buffer,
        &OutputFilter::Passthrough,
        &mut |_| {},
        None,
    )?;
    if drained.end == DrainEnd::Eof {
        return Err(SessionError::ChildTerminated);
    }
    let reply = buffer.raw();
    if reply.trim_end() == COMPLETION_REJECTED {
        event_log::log("completion_rejected", json!({ "token": request.token() }));
        return Ok(CompletionReply::empty(request.cursor));
    }
    match request.parse_reply(reply) {
        Ok(parsed) => Ok(parsed),
        Err(err) => {
            event_log::log(
                "completion_reply_invalid",
                json!({ "token": request.token(), "error": err.to_string(), "reply": reply }),
            );
            Ok(CompletionReply::empty(request.cursor))
        }
    }
}
