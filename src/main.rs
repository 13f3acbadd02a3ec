#[cfg(not(unix))]
compile_error!("magma-repl drives Magma through a pseudo-terminal and only supports Unix");

mod bridge;
mod channel;
mod completion;
mod config;
mod debug_repl;
mod diagnostics;
mod drain;
mod event_log;
#[cfg(test)]
mod fake_repl;
mod help;
mod output_stream;
mod protocol;
mod relay;
mod server;
mod session;

use std::path::PathBuf;

use crate::config::{
    BridgeConfig, parse_max_input_line, parse_prompt, parse_startup_timeout_ms,
};

#[derive(Debug)]
struct CliOptions {
    config: BridgeConfig,
    debug_repl: bool,
    debug_events_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Writes to a closed stdout must surface as errors rather than kill the process.
    ignore_sigpipe();
    crate::diagnostics::startup_log("main: entry");

    let options = parse_cli_args(ArgParser::new())?;
    event_log::initialize(
        options.debug_events_dir,
        event_log::StartupContext {
            mode: if options.debug_repl {
                "debug_repl".to_string()
            } else {
                "server".to_string()
            },
            program: options.config.program.to_string_lossy().to_string(),
            prompt: options.config.prompt.clone(),
        },
    )?;
    if options.debug_repl {
        crate::diagnostics::startup_log("main: debug repl mode");
        return debug_repl::run(options.config);
    }
    crate::diagnostics::startup_log("main: server mode");
    server::run(options.config).await
}

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn parse_cli_args(mut parser: ArgParser) -> Result<CliOptions, Box<dyn std::error::Error>> {
    let mut config = BridgeConfig::from_env()?;
    let mut debug_repl = false;
    let mut debug_events_dir = None;
    while let Some(arg) = parser.next() {
        let (flag, inline_value) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag, Some(value.to_string())),
            _ => (arg.as_str(), None),
        };
        match flag {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--debug-repl" => {
                debug_repl = true;
            }
            "--program" => {
                let value = parser.value_for(flag, inline_value)?;
                config.program = PathBuf::from(value);
            }
            "--program-arg" => {
                let value = parser.value_for(flag, inline_value)?;
                config.program_args.push(value);
            }
            "--prompt" => {
                let value = parser.value_for(flag, inline_value)?;
                config.prompt = parse_prompt(&value)?;
            }
            "--max-input-line" => {
                let value = parser.value_for(flag, inline_value)?;
                config.max_input_line = Some(parse_max_input_line(&value)?);
            }
            "--startup-timeout-ms" => {
                let value = parser.value_for(flag, inline_value)?;
                config.startup_timeout = parse_startup_timeout_ms(&value)?;
            }
            "--debug-events-dir" => {
                let value = parser.value_for(flag, inline_value)?;
                if value.trim().is_empty() {
                    return Err("missing value for --debug-events-dir".into());
                }
                debug_events_dir = Some(PathBuf::from(value));
            }
            _ => return Err(format!("unknown argument: {arg}").into()),
        }
    }

    Ok(CliOptions {
        config,
        debug_repl,
        debug_events_dir,
    })
}

struct ArgParser {
    args: Vec<String>,
    index: usize,
}

impl ArgParser {
    fn new() -> Self {
        Self::from_args(std::env::args().skip(1).collect())
    }

    fn from_args(args: Vec<String>) -> Self {
        Self { args, index: 0 }
    }

    fn next(&mut self) -> Option<String> {
        let value = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(value)
    }

    /// Value given as `--flag=value`, or else the following argument.
    fn value_for(
        &mut self,
        flag: &str,
        inline_value: Option<String>,
    ) -> Result<String, Box<dyn std::error::Error>> {
        match inline_value {
            Some(value) if value.is_empty() => Err(format!("missing value for {flag}").into()),
            Some(value) => Ok(value),
            None => self
                .next()
                .ok_or_else(|| format!("missing value for {flag}").into()),
        }
    }
}

fn print_usage() {
    println!(
        "Usage:\n\
magma-repl [--debug-repl] [--program <path>] [--program-arg <arg>]... [--prompt <sentinel>] [--max-input-line <bytes>] [--startup-timeout-ms <ms>] [--debug-events-dir <dir>]\n\n\
--debug-repl: run an interactive debug REPL over stdio instead of the MCP server\n\
--program: Magma executable to launch (default: magma; env MAGMA_REPL_PROGRAM)\n\
--program-arg: extra argument passed to the program (repeatable)\n\
--prompt: sentinel prompt installed with SetPrompt (default: $MAGMA_REPL_PROMPT$; env MAGMA_REPL_PROMPT)\n\
--max-input-line: submissions longer than this many bytes are sourced from a temporary file (default: terminal limit; env MAGMA_REPL_MAX_INPUT_LINE)\n\
--startup-timeout-ms: how long to wait for the Magma banner and setup prompts (default: 30000)\n\
--debug-events-dir: optional directory for per-startup JSONL debug event logs (env: MAGMA_REPL_DEBUG_EVENTS_DIR)"
    );
}
