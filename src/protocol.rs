use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteStatus {
    Ok,
    Abort,
    Error,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TextStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplContent {
    ContentText {
        text: String,
        stream: TextStream,
    },
    /// Rich payload for front-ends that can render HTML; `plain` is the fallback.
    ContentDisplay {
        #[serde(rename = "text/html")]
        html: String,
        #[serde(rename = "text/plain")]
        plain: String,
    },
}

impl ReplContent {
    pub fn stdout(text: impl Into<String>) -> Self {
        ReplContent::ContentText {
            text: text.into(),
            stream: TextStream::Stdout,
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        ReplContent::ContentText {
            text: text.into(),
            stream: TextStream::Stderr,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ExecuteReply {
    pub status: ExecuteStatus,
    pub execution_count: u64,
    pub contents: Vec<ReplContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecuteReply {
    pub fn ok(execution_count: u64, contents: Vec<ReplContent>) -> Self {
        Self {
            status: ExecuteStatus::Ok,
            execution_count,
            contents,
            error: None,
        }
    }

    /// `reason` is recorded in `error` only; the partial output stays as it was streamed.
    pub fn aborted(
        execution_count: u64,
        contents: Vec<ReplContent>,
        reason: Option<String>,
    ) -> Self {
        Self {
            status: ExecuteStatus::Abort,
            execution_count,
            contents,
            error: reason,
        }
    }

    pub fn failed(
        execution_count: u64,
        mut contents: Vec<ReplContent>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        contents.push(ReplContent::stderr(message.clone()));
        Self {
            status: ExecuteStatus::Error,
            execution_count,
            contents,
            error: Some(message),
        }
    }

    /// Concatenated stdout text, in the order it was streamed.
    #[cfg(test)]
    pub fn stdout_text(&self) -> String {
        self.contents
            .iter()
            .filter_map(|content| match content {
                ReplContent::ContentText {
                    text,
                    stream: TextStream::Stdout,
                } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CompletionReply {
    pub matches: Vec<String>,
    pub cursor_start: usize,
    pub cursor_end: usize,
}

impl CompletionReply {
    /// No matches, zero-width span at the cursor.
    pub fn empty(cursor: usize) -> Self {
        Self {
            matches: Vec::new(),
            cursor_start: cursor,
            cursor_end: cursor,
        }
    }
}
