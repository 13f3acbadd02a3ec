use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use memchr::memmem;

use crate::config::BridgeConfig;
use crate::session::SessionError;

const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK_BYTES: usize = 8192;

/// Outcome of waiting for a prompt on the child stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Expect {
    /// Text preceding the prompt; text and prompt are consumed.
    Prompt(String),
    /// Everything received since the last consumed prompt. Nothing is consumed.
    Timeout(String),
    /// The child closed its terminal; the remaining text is consumed.
    Eof(String),
}

/// Line-oriented access to a running REPL child.
pub(crate) trait ReplChannel: Send {
    fn send_line(&mut self, line: &str) -> Result<(), SessionError>;
    fn expect(&mut self, prompt: &str, timeout: Duration) -> Result<Expect, SessionError>;
    /// Delivers SIGINT to the child's process group.
    fn interrupt(&mut self) -> Result<(), SessionError>;
    /// Longest line the terminal accepts in canonical mode, if the platform reports one.
    fn max_input_line(&self) -> Option<usize>;
    fn shutdown(&mut self);
}

pub(crate) trait SessionLauncher: Send {
    fn launch(&self, config: &BridgeConfig) -> Result<Box<dyn ReplChannel>, SessionError>;
}

pub(crate) struct PtyLauncher;

impl SessionLauncher for PtyLauncher {
    fn launch(&self, config: &BridgeConfig) -> Result<Box<dyn ReplChannel>, SessionError> {
        Ok(Box::new(PtyChannel::spawn(config)?))
    }
}

#[derive(Default)]
struct StreamState {
    bytes: Vec<u8>,
    eof: bool,
}

/// Bytes read from the pty master that no prompt match has consumed yet.
#[derive(Default)]
struct StreamBuffer {
    state: Mutex<StreamState>,
    cvar: Condvar,
}

impl StreamBuffer {
    fn append(&self, bytes: &[u8]) {
        let mut guard = self.state.lock().unwrap();
        guard.bytes.extend_from_slice(bytes);
        self.cvar.notify_all();
    }

    fn mark_eof(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.eof = true;
        self.cvar.notify_all();
    }

    fn wait_for(&self, prompt: &[u8], timeout: Duration) -> Expect {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock().unwrap();
        loop {
            if let Some(pos) = memmem::find(&guard.bytes, prompt) {
                let before = String::from_utf8_lossy(&guard.bytes[..pos]).into_owned();
                guard.bytes.drain(..pos + prompt.len());
                return Expect::Prompt(before);
            }
            if guard.eof {
                let rest = String::from_utf8_lossy(&guard.bytes).into_owned();
                guard.bytes.clear();
                return Expect::Eof(rest);
            }
            let now = Instant::now();
            if now >= deadline {
                return Expect::Timeout(decode_complete_prefix(&guard.bytes));
            }
            guard = self.cvar.wait_timeout(guard, deadline - now).unwrap().0;
        }
    }
}

/// Decodes `bytes`, leaving out a multi-byte character that has not fully arrived yet.
fn decode_complete_prefix(bytes: &[u8]) -> String {
    let end = bytes.len() - incomplete_utf8_suffix(bytes);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn incomplete_utf8_suffix(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

enum StdinCommand {
    Write {
        payload: Vec<u8>,
        reply: mpsc::Sender<Result<(), SessionError>>,
    },
    Close,
}

/// A REPL child running under a pseudo-terminal with echo and newline translation disabled.
pub(crate) struct PtyChannel {
    child: Child,
    stdin_tx: mpsc::Sender<StdinCommand>,
    stream: Arc<StreamBuffer>,
    max_input_line: Option<usize>,
    reaped: bool,
}

impl PtyChannel {
    pub(crate) fn spawn(config: &BridgeConfig) -> Result<Self, SessionError> {
        let (master, slave) = open_pty_pair()?;
        configure_raw_output(slave.as_raw_fd())?;
        let max_input_line = query_max_canon(master.as_raw_fd());

        let slave_fd = slave.as_raw_fd();
        let mut command = Command::new(&config.program);
        command.args(&config.program_args);
        command.env("TERM", "dumb");
        command
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave));
        unsafe {
            command.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|err| {
            SessionError::Startup(format!(
                "failed to launch {}: {err}",
                config.program.display()
            ))
        })?;
        // The reader only sees EOF once every slave descriptor is closed.
        drop(command);

        let stream = Arc::new(StreamBuffer::default());
        let master_reader = master.try_clone()?;
        spawn_output_reader(master_reader, stream.clone());
        let stdin_tx = spawn_stdin_writer(master);

        Ok(Self {
            child,
            stdin_tx,
            stream,
            max_input_line,
            reaped: false,
        })
    }

    fn send_signal(&self, signal: i32) -> Result<(), SessionError> {
        let pid = self.child.id() as i32;
        let result = unsafe { libc::kill(-pid, signal) };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(SessionError::Io(err))
    }
}

impl ReplChannel for PtyChannel {
    fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        let mut payload = Vec::with_capacity(line.len() + 1);
        payload.extend_from_slice(line.as_bytes());
        payload.push(b'\n');
        let (reply_tx, reply_rx) = mpsc::channel();
        self.stdin_tx
            .send(StdinCommand::Write {
                payload,
                reply: reply_tx,
            })
            .map_err(|_| SessionError::Protocol("child stdin unavailable".to_string()))?;
        match reply_rx.recv_timeout(STDIN_WRITE_TIMEOUT) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(SessionError::Protocol(format!(
                "write to child stalled for {} ms",
                STDIN_WRITE_TIMEOUT.as_millis()
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SessionError::Protocol(
                "child stdin thread exited unexpectedly".to_string(),
            )),
        }
    }

    fn expect(&mut self, prompt: &str, timeout: Duration) -> Result<Expect, SessionError> {
        Ok(self.stream.wait_for(prompt.as_bytes(), timeout))
    }

    fn interrupt(&mut self) -> Result<(), SessionError> {
        self.send_signal(libc::SIGINT)
    }

    fn max_input_line(&self) -> Option<usize> {
        self.max_input_line
    }

    fn shutdown(&mut self) {
        if self.reaped {
            return;
        }
        let _ = self.send_signal(libc::SIGKILL);
        let _ = self.child.wait();
        let _ = self.stdin_tx.send(StdinCommand::Close);
        self.reaped = true;
    }
}

impl Drop for PtyChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn set_cloexec(fd: RawFd, enabled: bool) -> Result<(), SessionError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(SessionError::Io(std::io::Error::last_os_error()));
    }
    let new_flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFD, new_flags) } < 0 {
        return Err(SessionError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn open_pty_pair() -> Result<(File, File), SessionError> {
    let mut master: RawFd = -1;
    let mut slave: RawFd = -1;
    let result = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if result != 0 {
        return Err(SessionError::Io(std::io::Error::last_os_error()));
    }
    let master = unsafe { File::from_raw_fd(master) };
    let slave = unsafe { File::from_raw_fd(slave) };
    set_cloexec(master.as_raw_fd(), true)?;
    set_cloexec(slave.as_raw_fd(), false)?;
    Ok((master, slave))
}

/// Turns off echo and `\n` -> `\r\n` translation so the stream carries only program output.
fn configure_raw_output(fd: RawFd) -> Result<(), SessionError> {
    let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
    if unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) } != 0 {
        return Err(SessionError::Io(std::io::Error::last_os_error()));
    }
    let mut termios = unsafe { termios.assume_init() };
    termios.c_lflag &= !(libc::ECHO | libc::ECHONL);
    termios.c_oflag &= !libc::ONLCR;
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) } != 0 {
        return Err(SessionError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn query_max_canon(fd: RawFd) -> Option<usize> {
    let value = unsafe { libc::fpathconf(fd, libc::_PC_MAX_CANON) };
    usize::try_from(value).ok().filter(|value| *value > 0)
}

fn spawn_output_reader<R>(mut stream: R, buffer: Arc<StreamBuffer>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buffer.append(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                // Linux reports EIO on the master once the slave side is gone.
                Err(_) => break,
            }
        }
        buffer.mark_eof();
    });
}

fn spawn_stdin_writer<W>(stdin: W) -> mpsc::Sender<StdinCommand>
where
    W: Write + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<StdinCommand>();
    thread::spawn(move || {
        let mut writer = stdin;
        for command in rx {
            match command {
                StdinCommand::Write { payload, reply } => {
                    let result = writer
                        .write_all(&payload)
                        .and_then(|_| writer.flush())
                        .map_err(SessionError::Io);
                    let _ = reply.send(result);
                }
                StdinCommand::Close => break,
            }
        }
    });
    tx
}
