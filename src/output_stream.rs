use std::io::{self, Write};
use std::sync::Mutex;

static OUTPUT_LOCK: Mutex<()> = Mutex::new(());

/// Writes streamed REPL output to stdout without interleaving with other writers.
pub(crate) fn write_stdout_text(text: &str) {
    write_locked(&mut io::stdout(), text.as_bytes());
}

pub(crate) fn write_stderr_text(text: &str) {
    write_locked(&mut io::stderr(), text.as_bytes());
}

fn write_locked<W: Write>(writer: &mut W, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    let _guard = OUTPUT_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    let _ = write_all_bytes(writer, bytes);
}

fn write_all_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    let mut offset = 0usize;
    while offset < bytes.len() {
        match writer.write(&bytes[offset..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write output bytes",
                ));
            }
            Ok(written) => offset = offset.saturating_add(written),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    writer.flush()
}
