pub mod tty;

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use messagebus_proto::{Message, MessageBody, MessageKind, session_channel};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::BusConnection;
use crate::dispatch::HandlerRegistration;
use crate::error::{BusError, BusResult, HandlerFault};
use crate::signal::WaitHandle;

pub use tty::{CrosstermTerminal, InputEvent, LocalTerminal, RawModeGuard, StdinInput, TerminalInput};

pub const DEFAULT_SIZE: (u16, u16) = (80, 24);
pub const REMOTE_CLOSED_NOTICE: &[u8] = b"\r\n> Terminal closed by remote <\r\n";

const CTRL_C: u8 = 0x03;
const CTRL_C_LIMIT: usize = 3;
const CTRL_C_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Closed,
    Requesting,
    Open,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalExit {
    RemoteClosed,
    LocalEof,
    /// Ctrl+C pressed repeatedly in quick succession.
    Interrupted,
}

/// Local side of a remote terminal: where input comes from and whether the
/// terminal should be switched to raw mode while the session is open.
pub struct TerminalIo<'a> {
    pub terminal: &'a dyn LocalTerminal,
    pub input: &'a mut dyn TerminalInput,
    pub raw_mode: bool,
}

struct SessionState {
    terminal_id: String,
    state: TerminalState,
    write_channel: Option<String>,
    error: Option<String>,
}

struct Shared {
    session: Mutex<SessionState>,
    opened: WaitHandle,
    should_close: AtomicBool,
    output: Mutex<Box<dyn Write + Send>>,
}

impl Shared {
    fn matches(&self, terminal_id: &str) -> bool {
        let session = self.session.lock();
        session.state != TerminalState::Closed && session.terminal_id == terminal_id
    }

    fn write_output(&self, data: &[u8]) -> Result<(), HandlerFault> {
        let mut output = self.output.lock();
        output
            .write_all(data)
            .and_then(|()| output.flush())
            .map_err(|err| HandlerFault::new(format!("failed to write terminal output: {err}")))
    }

    fn on_open(&self, message: &Message, terminal_id: &str) -> Result<(), HandlerFault> {
        let mut session = self.session.lock();
        if session.terminal_id != terminal_id || session.state != TerminalState::Requesting {
            debug!(target: "messagebus::terminal", terminal_id, "ignoring unexpected open event");
            return Ok(());
        }
        let Some(back_channel) = message.back_channel.clone() else {
            session.error = Some("terminal open event carries no back channel".into());
            drop(session);
            self.opened.set();
            return Err(HandlerFault::new("terminal open event without back channel"));
        };
        debug!(target: "messagebus::terminal", terminal_id, write_channel = %back_channel, "terminal opened");
        session.write_channel = Some(back_channel);
        session.state = TerminalState::Open;
        drop(session);
        self.opened.set();
        Ok(())
    }

    fn on_close(&self, terminal_id: &str) -> Result<(), HandlerFault> {
        if !self.matches(terminal_id) {
            return Ok(());
        }
        info!(target: "messagebus::terminal", terminal_id, "terminal closed by remote");
        self.session.lock().state = TerminalState::Closing;
        self.should_close.store(true, Ordering::SeqCst);
        self.write_output(REMOTE_CLOSED_NOTICE)
    }

    fn fail(&self, reason: String) {
        warn!(target: "messagebus::terminal", error = %reason, "terminal error");
        self.session.lock().error = Some(reason);
        self.opened.set();
    }
}

/// Interactive remote terminal. Reads on `session:<terminal_id>` and learns
/// its write channel from the remote `terminal_open_event`; nothing is
/// written before that.
pub struct TerminalSession {
    connection: Arc<BusConnection>,
    shared: Arc<Shared>,
    ctrl_c: VecDeque<Instant>,
    _handlers: Vec<HandlerRegistration>,
}

impl TerminalSession {
    pub fn new(connection: Arc<BusConnection>, output: Box<dyn Write + Send>) -> Self {
        let shared = Arc::new(Shared {
            session: Mutex::new(SessionState {
                terminal_id: String::new(),
                state: TerminalState::Closed,
                write_channel: None,
                error: None,
            }),
            opened: WaitHandle::new(),
            should_close: AtomicBool::new(false),
            output: Mutex::new(output),
        });
        let dispatcher = connection.dispatcher();
        let mut handlers = Vec::with_capacity(5);

        let open = Arc::clone(&shared);
        handlers.push(dispatcher.register(MessageKind::TerminalOpenEvent, move |message: &Message| {
            match &message.body {
                MessageBody::TerminalOpenEvent { terminal_id, .. } => open.on_open(message, terminal_id),
                _ => Ok(()),
            }
        }));

        let read = Arc::clone(&shared);
        handlers.push(dispatcher.register(MessageKind::TerminalDataRead, move |message: &Message| {
            match &message.body {
                MessageBody::TerminalDataRead { terminal_id, data } if read.matches(terminal_id) => {
                    read.write_output(data)
                }
                MessageBody::TerminalDataRead { terminal_id, .. } => Err(HandlerFault::new(format!(
                    "terminal data for unknown terminal {terminal_id}"
                ))),
                _ => Ok(()),
            }
        }));

        let close = Arc::clone(&shared);
        handlers.push(dispatcher.register(MessageKind::TerminalCloseEvent, move |message: &Message| {
            match &message.body {
                MessageBody::TerminalCloseEvent { terminal_id } => close.on_close(terminal_id),
                _ => Ok(()),
            }
        }));

        let terminal_error = Arc::clone(&shared);
        handlers.push(dispatcher.register(MessageKind::TerminalError, move |message: &Message| {
            if let MessageBody::TerminalError { terminal_id, error } = &message.body {
                if terminal_error.matches(terminal_id) {
                    terminal_error.fail(error.message.clone());
                }
            }
            Ok(())
        }));

        let general_error = Arc::clone(&shared);
        handlers.push(dispatcher.register(MessageKind::GeneralError, move |message: &Message| {
            if let MessageBody::GeneralError { error } = &message.body {
                general_error.fail(error.message.clone());
            }
            Ok(())
        }));

        Self {
            connection,
            shared,
            ctrl_c: VecDeque::new(),
            _handlers: handlers,
        }
    }

    pub fn terminal_id(&self) -> String {
        self.shared.session.lock().terminal_id.clone()
    }

    pub fn read_channel(&self) -> String {
        session_channel(&self.terminal_id())
    }

    pub fn write_channel(&self) -> Option<String> {
        self.shared.session.lock().write_channel.clone()
    }

    pub fn state(&self) -> TerminalState {
        self.shared.session.lock().state
    }

    /// Runs a terminal on `target` until the remote closes it, local input
    /// ends, or the user interrupts. `existing_terminal_id` reattaches to a
    /// terminal the remote side already has open.
    pub fn run(
        &mut self,
        target: &str,
        existing_terminal_id: Option<&str>,
        shell: Option<&str>,
        io: TerminalIo<'_>,
    ) -> BusResult<TerminalExit> {
        if self.state() != TerminalState::Closed {
            return Err(BusError::InvalidArgument("terminal session already running".into()));
        }
        let terminal_id = existing_terminal_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        {
            let mut session = self.shared.session.lock();
            session.terminal_id = terminal_id.clone();
            session.write_channel = None;
            session.error = None;
        }
        self.shared.should_close.store(false, Ordering::SeqCst);
        self.shared.opened.clear();
        self.ctrl_c.clear();
        let _closed = CloseOnDrop(Arc::clone(&self.shared));

        let read_channel = session_channel(&terminal_id);
        self.connection.subscribe(&read_channel)?;

        let size = io.terminal.size().unwrap_or(DEFAULT_SIZE);
        if existing_terminal_id.is_some() {
            let mut session = self.shared.session.lock();
            session.write_channel = Some(target.to_string());
            session.state = TerminalState::Open;
        } else {
            self.negotiate(target, &terminal_id, &read_channel, shell, size)?;
        }

        let write_channel = self
            .write_channel()
            .ok_or_else(|| BusError::Connection("terminal write channel unknown".into()))?;
        info!(
            target: "messagebus::terminal",
            terminal_id = %terminal_id,
            write_channel = %write_channel,
            "terminal session open, return to local shell with 'exit' or Ctrl+D"
        );
        self.write_loop(&terminal_id, &write_channel, size, io)
    }

    fn negotiate(
        &self,
        target: &str,
        terminal_id: &str,
        read_channel: &str,
        shell: Option<&str>,
        (cols, rows): (u16, u16),
    ) -> BusResult<()> {
        self.shared.session.lock().state = TerminalState::Requesting;
        let request = Message::new(
            target,
            MessageBody::TerminalOpenRequest {
                terminal_id: terminal_id.to_string(),
                rows,
                cols,
                shell: shell.map(str::to_string),
            },
        )
        .with_back_channel(read_channel);
        info!(target: "messagebus::terminal", terminal_id, target, "requesting terminal");
        self.connection.send_message(&request)?;

        let timeout = self.connection.config().subscription_timeout;
        let signalled = self.shared.opened.wait(timeout);
        self.shared.opened.clear();
        let mut session = self.shared.session.lock();
        if let Some(error) = session.error.take() {
            return Err(BusError::Terminal(error));
        }
        if !signalled || session.state != TerminalState::Open {
            return Err(BusError::Connection(format!(
                "failed to open terminal on {target} within {timeout:?}"
            )));
        }
        Ok(())
    }

    fn write_loop(
        &mut self,
        terminal_id: &str,
        write_channel: &str,
        size: (u16, u16),
        io: TerminalIo<'_>,
    ) -> BusResult<TerminalExit> {
        let TerminalIo {
            terminal,
            input,
            raw_mode,
        } = io;
        let _raw = RawModeGuard::new(terminal, raw_mode);
        let poll = self.connection.config().input_poll_interval;
        let mut last_size = size;
        loop {
            if self.shared.should_close.load(Ordering::SeqCst) {
                return Ok(TerminalExit::RemoteClosed);
            }
            if let Some(error) = self.shared.session.lock().error.take() {
                return Err(BusError::Terminal(error));
            }
            if let Some(current) = terminal.size() {
                if current != last_size {
                    last_size = current;
                    self.send_resize(terminal_id, write_channel, current)?;
                }
            }
            match input.poll(poll)? {
                InputEvent::Idle => {}
                InputEvent::Eof => {
                    debug!(target: "messagebus::terminal", terminal_id, "local input closed");
                    return Ok(TerminalExit::LocalEof);
                }
                InputEvent::Data(data) => {
                    if data == [CTRL_C] && self.interrupt_requested() {
                        info!(target: "messagebus::terminal", terminal_id, "interrupted, closing terminal");
                        return Ok(TerminalExit::Interrupted);
                    }
                    let message = Message::new(
                        write_channel,
                        MessageBody::TerminalDataWrite {
                            terminal_id: terminal_id.to_string(),
                            data: Bytes::from(data),
                        },
                    );
                    self.connection.send_message(&message)?;
                }
            }
        }
    }

    fn send_resize(&self, terminal_id: &str, write_channel: &str, (cols, rows): (u16, u16)) -> BusResult<()> {
        debug!(target: "messagebus::terminal", terminal_id, cols, rows, "local terminal resized");
        self.connection.send_message(&Message::new(
            write_channel,
            MessageBody::TerminalResizeRequest {
                terminal_id: terminal_id.to_string(),
                rows,
                cols,
            },
        ))
    }

    fn interrupt_requested(&mut self) -> bool {
        let now = Instant::now();
        self.ctrl_c.push_back(now);
        while self
            .ctrl_c
            .front()
            .is_some_and(|pressed| now.duration_since(*pressed) > CTRL_C_WINDOW)
        {
            self.ctrl_c.pop_front();
        }
        self.ctrl_c.len() > CTRL_C_LIMIT
    }
}

/// Returns the session to `Closed` on every exit path of `run`.
struct CloseOnDrop(Arc<Shared>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let mut session = self.0.session.lock();
        session.state = TerminalState::Closed;
        session.write_channel = None;
        drop(session);
        self.0.opened.clear();
    }
}
