use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// Stands in for the relay file's path in everything shown to the caller.
pub const RELAY_PATH_MARKER: &str = "<input>";
const RELAY_FILE_PREFIX: &str = "magma-relay-";
const RELAY_FILE_SUFFIX: &str = ".m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayMode {
    /// Sent line by line, each line drained to the prompt.
    Inline,
    /// Written to a temporary file and sourced with a single `load`.
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Submission {
    normalized: String,
    mode: RelayMode,
}

impl Submission {
    /// Strips trailing whitespace and terminates the statement. `None` for blank input.
    pub(crate) fn prepare(raw: &str, max_input_line: usize) -> Option<Self> {
        let trimmed = raw.trim_end();
        if trimmed.trim_start().is_empty() {
            return None;
        }
        let mut normalized = trimmed.to_string();
        if !normalized.ends_with(';') {
            normalized.push(';');
        }
        let mode = if normalized.len() > max_input_line {
            RelayMode::File
        } else {
            RelayMode::Inline
        };
        Some(Self { normalized, mode })
    }

    pub(crate) fn normalized(&self) -> &str {
        &self.normalized
    }

    pub(crate) fn mode(&self) -> RelayMode {
        self.mode
    }

    pub(crate) fn lines(&self) -> impl Iterator<Item = &str> {
        self.normalized.lines()
    }
}

/// Temporary source file holding one oversized submission. Removed on drop.
pub(crate) struct RelayFile {
    file: NamedTempFile,
}

impl RelayFile {
    pub(crate) fn create(code: &str) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(RELAY_FILE_PREFIX)
            .suffix(RELAY_FILE_SUFFIX)
            .tempfile()?;
        file.write_all(code.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.as_file().sync_all()?;
        Ok(Self { file })
    }

    pub(crate) fn path(&self) -> &Path {
        self.file.path()
    }

    pub(crate) fn directive(&self) -> String {
        load_directive(self.path())
    }

    pub(crate) fn filter(&self) -> OutputFilter {
        OutputFilter::Relay {
            path: self.path().to_path_buf(),
        }
    }
}

pub(crate) fn load_directive(path: &Path) -> String {
    format!("load \"{}\";", path.display())
}

fn load_notice(path: &str) -> String {
    format!("Loading \"{path}\"")
}

/// Rewrites raw child output before it is shown to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OutputFilter {
    Passthrough,
    Relay { path: PathBuf },
}

impl OutputFilter {
    /// Visible form of the cumulative `raw` output.
    ///
    /// While `complete` is false the result is always a prefix of what a longer `raw` would
    /// produce: an unfinished notice line and a trailing partial path are held back.
    pub(crate) fn visible(&self, raw: &str, complete: bool) -> String {
        let OutputFilter::Relay { path } = self else {
            return raw.to_string();
        };
        let path = path.to_string_lossy();
        let body = match raw.split_once('\n') {
            Some((first, rest)) if is_load_notice(first, &path) => rest,
            Some(_) => raw,
            None if complete => {
                if is_load_notice(raw, &path) {
                    ""
                } else {
                    raw
                }
            }
            None => return String::new(),
        };
        let held = if complete {
            0
        } else {
            partial_suffix_len(body, &path)
        };
        body[..body.len() - held].replace(path.as_ref(), RELAY_PATH_MARKER)
    }
}

/// Whether the first output line of a relay matches the expected notice.
pub(crate) fn is_load_notice(line: &str, path: &str) -> bool {
    line.trim_end_matches('\r').starts_with(&load_notice(path))
}

/// Length of the longest suffix of `text` that is a proper prefix of `needle`.
pub(crate) fn partial_suffix_len(text: &str, needle: &str) -> usize {
    text.char_indices()
        .map(|(idx, _)| idx)
        .find(|&idx| {
            let suffix = &text[idx..];
            suffix.len() < needle.len() && needle.starts_with(suffix)
        })
        .map(|idx| text.len() - idx)
        .unwrap_or(0)
}
