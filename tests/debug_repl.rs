mod common;

use std::io::Write;
use std::process::{Command, Stdio};

use common::{TestResult, fake_magma_script};

fn run_debug_repl(input: &str) -> TestResult<(String, String)> {
    let exe = env!("CARGO_BIN_EXE_magma-repl");
    let mut child = Command::new(exe)
        .arg("--debug-repl")
        .arg("--program")
        .arg("sh")
        .arg("--program-arg")
        .arg(fake_magma_script())
        .env_remove("MAGMA_REPL_PROGRAM")
        .env_remove("MAGMA_REPL_PROMPT")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    child
        .stdin
        .take()
        .ok_or("missing stdin")?
        .write_all(input.as_bytes())?;
    let output = child.wait_with_output()?;
    assert!(output.status.success(), "status: {:?}", output.status);
    Ok((
        String::from_utf8(output.stdout)?,
        String::from_utf8(output.stderr)?,
    ))
}

#[test]
fn executes_end_terminated_input() -> TestResult<()> {
    let (stdout, stderr) = run_debug_repl("print 1;\nprint 2;END\n")?;
    assert_eq!(stdout, "1\n2\n");
    assert!(
        stderr.contains("Magma REPL bridge connected to Magma 2.28-3"),
        "{stderr}"
    );
    Ok(())
}

#[test]
fn complete_command_prints_json_reply() -> TestResult<()> {
    let (stdout, _) = run_debug_repl("COMPLETE Fact\n")?;
    let reply: serde_json::Value = serde_json::from_str(stdout.trim())?;
    assert_eq!(reply["matches"][0], "Factorial");
    assert_eq!(reply["cursor_start"], 0);
    assert_eq!(reply["cursor_end"], 4);
    Ok(())
}

#[test]
fn restart_command_reconnects() -> TestResult<()> {
    let (stdout, stderr) = run_debug_repl("RESTART\nprint 9;END\n")?;
    assert_eq!(stdout, "9\n");
    assert_eq!(
        stderr
            .matches("Magma REPL bridge connected to Magma 2.28-3")
            .count(),
        2,
        "{stderr}"
    );
    Ok(())
}
