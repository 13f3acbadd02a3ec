use rmcp::model::{CallToolResult, Content};

use crate::protocol::{CompletionReply, ExecuteReply, ExecuteStatus, ReplContent};

pub(crate) const ABORT_NOTICE: &str = "[magma-repl] submission interrupted";

pub(crate) fn execute_reply_to_result(reply: ExecuteReply) -> CallToolResult {
    let status = reply.status;
    let mut contents: Vec<Content> = reply
        .contents
        .into_iter()
        .map(|content| match content {
            ReplContent::ContentText { text, .. } => Content::text(text),
            ReplContent::ContentDisplay { plain, .. } => Content::text(plain),
        })
        .collect();
    match status {
        ExecuteStatus::Ok => finalize(contents, false),
        ExecuteStatus::Abort => {
            contents.push(Content::text(ABORT_NOTICE));
            finalize(contents, false)
        }
        // `failed` replies already carry the message as stderr content.
        ExecuteStatus::Error => finalize(contents, true),
    }
}

pub(crate) fn completion_reply_to_result(reply: &CompletionReply) -> CallToolResult {
    match serde_json::to_string(reply) {
        Ok(text) => CallToolResult::success(vec![Content::text(text)]),
        Err(err) => CallToolResult::error(vec![Content::text(format!(
            "failed to serialize completion reply: {err}"
        ))]),
    }
}

fn finalize(mut contents: Vec<Content>, is_error: bool) -> CallToolResult {
    if contents.is_empty() {
        contents.push(Content::text(String::new()));
    }
    if is_error {
        CallToolResult::error(contents)
    } else {
        CallToolResult::success(contents)
    }
}
