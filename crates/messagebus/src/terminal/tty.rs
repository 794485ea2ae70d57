use std::io::{self, Read};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use crossterm::terminal;
use tracing::{debug, warn};

const STDIN_CHUNK: usize = 1024;

/// The local interactive terminal, reduced to what a remote session needs.
pub trait LocalTerminal: Send + Sync {
    fn enable_raw_mode(&self) -> io::Result<()>;
    fn disable_raw_mode(&self) -> io::Result<()>;
    /// `(cols, rows)`, or `None` when there is no terminal attached.
    fn size(&self) -> Option<(u16, u16)>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CrosstermTerminal;

impl LocalTerminal for CrosstermTerminal {
    fn enable_raw_mode(&self) -> io::Result<()> {
        terminal::enable_raw_mode()
    }

    fn disable_raw_mode(&self) -> io::Result<()> {
        terminal::disable_raw_mode()
    }

    fn size(&self) -> Option<(u16, u16)> {
        terminal::size().ok()
    }
}

/// Holds the local terminal in raw mode until dropped.
pub struct RawModeGuard<'a> {
    terminal: &'a dyn LocalTerminal,
    active: bool,
}

impl<'a> RawModeGuard<'a> {
    pub fn new(terminal: &'a dyn LocalTerminal, enable: bool) -> Self {
        if !enable {
            return Self {
                terminal,
                active: false,
            };
        }
        match terminal.enable_raw_mode() {
            Ok(()) => Self {
                terminal,
                active: true,
            },
            Err(err) => {
                warn!(target: "messagebus::terminal", error = %err, "failed to enable raw mode");
                Self {
                    terminal,
                    active: false,
                }
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for RawModeGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = self.terminal.disable_raw_mode() {
                warn!(target: "messagebus::terminal", error = %err, "failed to restore terminal mode");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Data(Vec<u8>),
    /// Nothing arrived within the poll interval.
    Idle,
    Eof,
}

/// Local input polled by the terminal write loop.
pub trait TerminalInput: Send {
    fn poll(&mut self, timeout: Duration) -> io::Result<InputEvent>;
}

/// Reads process stdin on a helper thread so the write loop can poll it.
pub struct StdinInput {
    chunks: Receiver<io::Result<Vec<u8>>>,
    finished: bool,
}

impl StdinInput {
    pub fn spawn() -> io::Result<Self> {
        let (sender, chunks) = crossbeam_channel::bounded(64);
        thread::Builder::new()
            .name("terminal-stdin".into())
            .spawn(move || {
                let mut stdin = io::stdin().lock();
                let mut buffer = [0u8; STDIN_CHUNK];
                loop {
                    let read = stdin.read(&mut buffer);
                    let done = matches!(read, Ok(0) | Err(_));
                    let chunk = read.map(|count| buffer[..count].to_vec());
                    if sender.send(chunk).is_err() || done {
                        break;
                    }
                }
                debug!(target: "messagebus::terminal", "stdin reader finished");
            })?;
        Ok(Self {
            chunks,
            finished: false,
        })
    }
}

impl TerminalInput for StdinInput {
    fn poll(&mut self, timeout: Duration) -> io::Result<InputEvent> {
        if self.finished {
            return Ok(InputEvent::Eof);
        }
        match self.chunks.recv_timeout(timeout) {
            Ok(Ok(chunk)) if chunk.is_empty() => {
                self.finished = true;
                Ok(InputEvent::Eof)
            }
            Ok(Ok(chunk)) => Ok(InputEvent::Data(chunk)),
            Ok(Err(err)) => {
                self.finished = true;
                Err(err)
            }
            Err(RecvTimeoutError::Timeout) => Ok(InputEvent::Idle),
            Err(RecvTimeoutError::Disconnected) => {
                self.finished = true;
                Ok(InputEvent::Eof)
            }
        }
    }
}
