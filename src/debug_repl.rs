use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::bridge::{Bridge, InterruptHandle};
use crate::config::BridgeConfig;
use crate::output_stream::{write_stderr_text, write_stdout_text};
use crate::protocol::{ExecuteReply, ExecuteStatus, ReplContent, TextStream};

const SIGINT_POLL_INTERVAL: Duration = Duration::from_millis(50);

static SIGINT_PENDING: AtomicBool = AtomicBool::new(false);

pub(crate) fn run(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut bridge = Bridge::start(config)?;
    eprintln!(
        "debug repl: end input with END | commands: RESTART, COMPLETE <code> | Ctrl-C interrupts | Ctrl-D to exit"
    );
    if let Some(banner) = bridge.banner() {
        write_stderr_text(banner);
    }
    eprintln!("{}", bridge.summary());
    forward_sigint(bridge.interrupt_handle());

    let stdin = io::stdin();
    let mut stdin = stdin.lock();
    loop {
        let Some(line) = read_line(&mut stdin)? else {
            break;
        };

        if is_exact_command(&line, "RESTART") {
            match bridge.restart() {
                Ok(()) => eprintln!("{}", bridge.summary()),
                Err(err) => eprintln!("[magma-repl] restart failed: {err}"),
            }
            continue;
        }
        if let Some(code) = line
            .trim_end_matches(['\n', '\r'])
            .strip_prefix("COMPLETE ")
        {
            let reply = bridge.complete(code, code.chars().count());
            println!("{}", serde_json::to_string(&reply)?);
            continue;
        }

        let (chunk, done) = split_end_marker(&line);
        let mut input = chunk;
        if !done {
            loop {
                let Some(next) = read_line(&mut stdin)? else {
                    return Err("EOF reached while reading input; expected END".into());
                };
                let (chunk, done) = split_end_marker(&next);
                input.push_str(&chunk);
                if done {
                    break;
                }
            }
        }

        let mut last_chunk_ends_line = true;
        let reply = bridge.execute(&input, false, &mut |chunk| {
            last_chunk_ends_line = chunk.ends_with('\n');
            write_stdout_text(chunk);
        });
        if !last_chunk_ends_line {
            write_stdout_text("\n");
        }
        render_reply(&reply);
    }

    bridge.shutdown();
    Ok(())
}

/// Prints what was not already streamed: display payloads, stderr text and the final status.
fn render_reply(reply: &ExecuteReply) {
    for content in &reply.contents {
        match content {
            ReplContent::ContentText {
                text,
                stream: TextStream::Stderr,
            } => write_stderr_text(&format!("{text}\n")),
            ReplContent::ContentText { .. } => {}
            ReplContent::ContentDisplay { plain, .. } => write_stdout_text(&format!("{plain}\n")),
        }
    }
    match reply.status {
        ExecuteStatus::Ok => {}
        ExecuteStatus::Abort => eprintln!("[magma-repl] interrupted"),
        ExecuteStatus::Error => eprintln!("[magma-repl] error"),
    }
}

extern "C" fn on_sigint(_signal: libc::c_int) {
    SIGINT_PENDING.store(true, Ordering::SeqCst);
}

/// Routes terminal Ctrl-C to the bridge instead of terminating the process.
fn forward_sigint(handle: InterruptHandle) {
    let handler = on_sigint as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
    thread::spawn(move || {
        loop {
            thread::sleep(SIGINT_POLL_INTERVAL);
            if SIGINT_PENDING.swap(false, Ordering::SeqCst) {
                handle.request();
            }
        }
    });
}

fn read_line(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

fn is_exact_command(line: &str, command: &str) -> bool {
    line.trim_end_matches(['\n', '\r']) == command
}

fn split_end_marker(line: &str) -> (String, bool) {
    let body = line
        .strip_suffix("\r\n")
        .or_else(|| line.strip_suffix('\n'))
        .unwrap_or(line);
    if let Some(prefix) = body.strip_suffix("END") {
        return (prefix.to_string(), true);
    }
    (line.to_string(), false)
}
