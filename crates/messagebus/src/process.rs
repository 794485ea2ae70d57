use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossterm::style::{Color, Stylize};
use messagebus_proto::channel::target_label;
use messagebus_proto::{Message, MessageBody, MessageKind};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::BusConnection;
use crate::dispatch::HandlerRegistration;
use crate::error::{BusError, BusResult, HandlerFault};
use crate::signal::WaitHandle;

pub const STDIN_CHUNK_SIZE: usize = 32_768;
pub const MAX_BUFFER_SIZE: usize = 100_000;

const PREFIX_COLORS: [Color; 12] = [
    Color::DarkRed,
    Color::DarkGreen,
    Color::DarkYellow,
    Color::DarkBlue,
    Color::DarkMagenta,
    Color::DarkCyan,
    Color::Red,
    Color::Green,
    Color::Yellow,
    Color::Blue,
    Color::Magenta,
    Color::Cyan,
];

#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub channels: Vec<String>,
    pub command: Vec<String>,
    pub shell: bool,
    /// Processes running at the same time.
    pub concurrency: usize,
    /// Run time limit per process; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Fed to every process once it has started.
    pub stdin: Bytes,
    pub show_host_names: bool,
    pub color: bool,
}

impl ProcessRequest {
    pub fn new(channels: Vec<String>, command: Vec<String>) -> Self {
        Self {
            channels,
            command,
            shell: false,
            concurrency: 100,
            timeout: None,
            stdin: Bytes::new(),
            show_host_names: true,
            color: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    pub channel: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl ProcessOutcome {
    pub fn failed(&self) -> bool {
        self.error.is_some() || self.exit_code.is_some_and(|code| code != 0)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessReport {
    /// In request order.
    pub outcomes: Vec<ProcessOutcome>,
}

impl ProcessReport {
    pub fn failed_channels(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.failed())
            .map(|outcome| outcome.channel.as_str())
            .collect()
    }

    /// First non-zero remote exit code, else 1 if any process errored.
    pub fn exit_code(&self) -> i32 {
        if let Some(code) = self
            .outcomes
            .iter()
            .filter_map(|outcome| outcome.exit_code)
            .find(|code| *code != 0)
        {
            return code;
        }
        if self.outcomes.iter().any(|outcome| outcome.error.is_some()) {
            1
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Default)]
struct Layout {
    show_host_names: bool,
    label_width: usize,
}

/// Local stdout and stderr shared by all processes of one execution.
pub struct ProcessOutput {
    streams: Mutex<(Box<dyn Write + Send>, Box<dyn Write + Send>)>,
    layout: Mutex<Layout>,
}

impl ProcessOutput {
    pub fn new(stdout: Box<dyn Write + Send>, stderr: Box<dyn Write + Send>) -> Self {
        Self {
            streams: Mutex::new((stdout, stderr)),
            layout: Mutex::new(Layout::default()),
        }
    }

    pub fn stdio() -> Self {
        Self::new(Box::new(std::io::stdout()), Box::new(std::io::stderr()))
    }

    fn prefix(&self, label: &str, color: Option<Color>) -> Option<String> {
        let layout = self.layout.lock();
        if !layout.show_host_names || label.is_empty() {
            return None;
        }
        let plain = format!("{label:<width$} | ", width = layout.label_width);
        Some(match color {
            Some(color) => format!("{}", plain.with(color).bold()),
            None => plain,
        })
    }

    fn write(&self, stream: Stream, data: &[u8], label: &str, color: Option<Color>) {
        if data.is_empty() {
            return;
        }
        let rendered = match self.prefix(label, color) {
            Some(prefix) => prefix_lines(data, prefix.as_bytes()),
            None => data.to_vec(),
        };
        let mut streams = self.streams.lock();
        let target = match stream {
            Stream::Stdout => &mut streams.0,
            Stream::Stderr => &mut streams.1,
        };
        if let Err(err) = target.write_all(&rendered).and_then(|()| target.flush()) {
            warn!(target: "messagebus::process", error = %err, "failed to write process output");
        }
    }
}

/// Prefixes every line that ends in a newline; a trailing partial line is
/// left as is.
fn prefix_lines(data: &[u8], prefix: &[u8]) -> Vec<u8> {
    let mut rendered = Vec::with_capacity(data.len() + prefix.len());
    let mut lines = data.split(|byte| *byte == b'\n').peekable();
    while let Some(line) = lines.next() {
        if lines.peek().is_some() {
            rendered.extend_from_slice(prefix);
            rendered.extend_from_slice(line);
            rendered.push(b'\n');
        } else {
            rendered.extend_from_slice(line);
        }
    }
    rendered
}

#[derive(Default)]
struct Progress {
    start_request_time: Option<Instant>,
    start_event_time: Option<Instant>,
    stopped: bool,
    exit_code: Option<i32>,
    error: Option<String>,
    last_data_created: i64,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

struct RemoteProcess {
    process_id: String,
    channel: String,
    label: String,
    color: Option<Color>,
    start_request: Message,
    progress: Mutex<Progress>,
}

impl RemoteProcess {
    fn flush_lines(&self, progress: &mut Progress, output: &ProcessOutput) {
        for stream in [Stream::Stdout, Stream::Stderr] {
            let buffer = match stream {
                Stream::Stdout => &mut progress.stdout,
                Stream::Stderr => &mut progress.stderr,
            };
            let cut = match buffer.iter().rposition(|byte| *byte == b'\n') {
                Some(newline) => newline + 1,
                None if buffer.len() > MAX_BUFFER_SIZE => MAX_BUFFER_SIZE,
                None => continue,
            };
            let rest = buffer.split_off(cut);
            let complete = std::mem::replace(buffer, rest);
            output.write(stream, &complete, &self.label, self.color);
        }
    }

    fn flush_all(&self, progress: &mut Progress, output: &ProcessOutput) {
        let stdout = std::mem::take(&mut progress.stdout);
        let stderr = std::mem::take(&mut progress.stderr);
        output.write(Stream::Stdout, &stdout, &self.label, self.color);
        output.write(Stream::Stderr, &stderr, &self.label, self.color);
    }

    /// Only the first error of a process is kept and shown.
    fn fail(&self, reason: &str, output: &ProcessOutput) {
        let mut progress = self.progress.lock();
        if progress.error.is_some() {
            return;
        }
        progress.error = Some(reason.to_string());
        progress.stopped = true;
        self.flush_all(&mut progress, output);
        let line = format!("{reason}\n");
        let text = match self.color {
            Some(_) => format!("{}", line.as_str().red()),
            None => line,
        };
        output.write(Stream::Stderr, text.as_bytes(), &self.label, self.color);
    }

    fn outcome(&self) -> ProcessOutcome {
        let progress = self.progress.lock();
        ProcessOutcome {
            channel: self.channel.clone(),
            exit_code: progress.exit_code,
            error: progress.error.clone(),
        }
    }
}

struct ProcessTable {
    processes: Mutex<HashMap<String, Arc<RemoteProcess>>>,
    stdin: Mutex<Bytes>,
    output: ProcessOutput,
    changed: WaitHandle,
}

impl ProcessTable {
    fn lookup(&self, process_id: &str) -> Result<Arc<RemoteProcess>, HandlerFault> {
        self.processes
            .lock()
            .get(process_id)
            .cloned()
            .ok_or_else(|| HandlerFault::new(format!("unknown process id {process_id}")))
    }

    fn on_start(&self, connection: &BusConnection, process_id: &str) -> Result<(), HandlerFault> {
        let process = self.lookup(process_id)?;
        let mut progress = process.progress.lock();
        progress.start_event_time = Some(Instant::now());
        self.changed.set();
        let stdin = self.stdin.lock().clone();
        if stdin.is_empty() {
            return Ok(());
        }
        let chunks = stdin
            .chunks(STDIN_CHUNK_SIZE)
            .map(|chunk| stdin.slice_ref(chunk))
            .chain(std::iter::once(Bytes::new()));
        for chunk in chunks {
            let write = Message::new(
                process.channel.clone(),
                MessageBody::ProcessDataWrite {
                    process_id: process.process_id.clone(),
                    stdin: chunk,
                },
            );
            connection
                .send_message(&write)
                .map_err(|err| HandlerFault::new(format!("failed to forward stdin: {err}")))?;
        }
        Ok(())
    }

    fn on_data(&self, message: &Message) -> Result<(), HandlerFault> {
        let MessageBody::ProcessDataRead {
            process_id,
            stdout,
            stderr,
        } = &message.body
        else {
            return Ok(());
        };
        let process = self.lookup(process_id)?;
        let mut progress = process.progress.lock();
        if message.created < progress.last_data_created {
            return Err(HandlerFault::new(format!(
                "process data for {process_id} is older than data already received"
            )));
        }
        progress.last_data_created = message.created;
        progress.stdout.extend_from_slice(stdout);
        progress.stderr.extend_from_slice(stderr);
        process.flush_lines(&mut progress, &self.output);
        Ok(())
    }

    fn on_stop(&self, process_id: &str, exit_code: i32) -> Result<(), HandlerFault> {
        let process = self.lookup(process_id)?;
        let mut progress = process.progress.lock();
        progress.exit_code = Some(exit_code);
        progress.stopped = true;
        process.flush_all(&mut progress, &self.output);
        drop(progress);
        self.changed.set();
        Ok(())
    }

    fn on_error(&self, process_id: &str, reason: &str) -> Result<(), HandlerFault> {
        let process = self.lookup(process_id)?;
        process.fail(reason, &self.output);
        self.changed.set();
        Ok(())
    }
}

/// Runs one command on many targets with streamed output. Each target gets
/// its own process id; output is written line by line while it runs.
pub struct ProcessExecutor {
    connection: Arc<BusConnection>,
    table: Arc<ProcessTable>,
    _handlers: Vec<HandlerRegistration>,
}

impl ProcessExecutor {
    pub fn new(connection: Arc<BusConnection>, output: ProcessOutput) -> Self {
        let table = Arc::new(ProcessTable {
            processes: Mutex::new(HashMap::new()),
            stdin: Mutex::new(Bytes::new()),
            output,
            changed: WaitHandle::new(),
        });
        let dispatcher = connection.dispatcher();
        let mut handlers = Vec::with_capacity(4);

        let starts = Arc::clone(&table);
        // Weak so the handler table does not keep the connection alive.
        let sender = Arc::downgrade(&connection);
        handlers.push(dispatcher.register(MessageKind::ProcessStartEvent, move |message: &Message| {
            let MessageBody::ProcessStartEvent { process_id, os_process_id, .. } = &message.body else {
                return Ok(());
            };
            debug!(target: "messagebus::process", process_id = %process_id, ?os_process_id, "process started");
            let connection = sender
                .upgrade()
                .ok_or_else(|| HandlerFault::new("connection dropped"))?;
            starts.on_start(&connection, process_id)
        }));

        let reads = Arc::clone(&table);
        handlers.push(dispatcher.register(MessageKind::ProcessDataRead, move |message: &Message| {
            reads.on_data(message)
        }));

        let stops = Arc::clone(&table);
        handlers.push(dispatcher.register(MessageKind::ProcessStopEvent, move |message: &Message| {
            match &message.body {
                MessageBody::ProcessStopEvent { process_id, exit_code } => {
                    debug!(target: "messagebus::process", process_id = %process_id, exit_code, "process stopped");
                    stops.on_stop(process_id, *exit_code)
                }
                _ => Ok(()),
            }
        }));

        let errors = Arc::clone(&table);
        handlers.push(dispatcher.register(MessageKind::ProcessError, move |message: &Message| {
            match &message.body {
                MessageBody::ProcessError { process_id, error } => errors.on_error(process_id, &error.message),
                _ => Ok(()),
            }
        }));

        Self {
            connection,
            table,
            _handlers: handlers,
        }
    }

    pub fn execute(&self, request: &ProcessRequest) -> BusResult<ProcessReport> {
        let mut seen = BTreeSet::new();
        if let Some(duplicate) = request.channels.iter().find(|channel| !seen.insert(channel.as_str())) {
            return Err(BusError::InvalidArgument(format!(
                "duplicate channel {duplicate} in list of channels"
            )));
        }
        if request.command.is_empty() {
            return Err(BusError::InvalidArgument("no command given".into()));
        }

        let processes = self.prepare(request);
        let _clear = ClearOnDrop(&self.table);
        let start_timeout = match request.timeout {
            Some(timeout) if !timeout.is_zero() => timeout.min(self.connection.config().process_start_timeout),
            _ => self.connection.config().process_start_timeout,
        };
        let run_timeout = request.timeout.filter(|timeout| !timeout.is_zero());
        let concurrency = request.concurrency.max(1);
        info!(
            target: "messagebus::process",
            targets = processes.len(),
            concurrency,
            command = ?request.command,
            "starting processes"
        );

        loop {
            self.table.changed.clear();
            let mut running = 0;
            let mut waiting = Vec::new();
            for process in &processes {
                let (stopped, started_at, requested_at) = {
                    let progress = process.progress.lock();
                    (progress.stopped, progress.start_event_time, progress.start_request_time)
                };
                if stopped {
                    continue;
                }
                if let Some(started) = started_at {
                    let elapsed = started.elapsed();
                    if run_timeout.map_or(true, |limit| elapsed < limit) {
                        running += 1;
                        continue;
                    }
                    warn!(
                        target: "messagebus::process",
                        host = %process.label,
                        elapsed = ?elapsed,
                        "timed out waiting for process to end"
                    );
                    process.fail("Process timeout", &self.table.output);
                    self.connection.send_message(&Message::new(
                        process.channel.clone(),
                        MessageBody::ProcessStopRequest {
                            process_id: process.process_id.clone(),
                        },
                    ))?;
                    continue;
                }
                if let Some(requested) = requested_at {
                    let elapsed = requested.elapsed();
                    if elapsed < start_timeout {
                        running += 1;
                        continue;
                    }
                    warn!(
                        target: "messagebus::process",
                        host = %process.label,
                        elapsed = ?elapsed,
                        "timed out waiting for process to start"
                    );
                    process.fail("Failed to start process", &self.table.output);
                    continue;
                }
                waiting.push(Arc::clone(process));
            }

            if running == 0 && waiting.is_empty() {
                break;
            }
            let launch = waiting.len().min(concurrency.saturating_sub(running));
            for process in waiting.into_iter().take(launch) {
                debug!(target: "messagebus::process", host = %process.label, "sending process start request");
                process.progress.lock().start_request_time = Some(Instant::now());
                self.connection.send_message(&process.start_request)?;
            }
            self.table.changed.wait(self.connection.config().process_poll_interval);
        }

        let report = ProcessReport {
            outcomes: processes.iter().map(|process| process.outcome()).collect(),
        };
        let failed = report.failed_channels();
        if !failed.is_empty() {
            warn!(target: "messagebus::process", failed = ?failed, "processes failed on some targets");
        }
        Ok(report)
    }

    fn prepare(&self, request: &ProcessRequest) -> Vec<Arc<RemoteProcess>> {
        let processes: Vec<Arc<RemoteProcess>> = request
            .channels
            .iter()
            .enumerate()
            .map(|(position, channel)| {
                let process_id = Uuid::new_v4().to_string();
                let start_request = Message::new(
                    channel.clone(),
                    MessageBody::ProcessStartRequest {
                        process_id: process_id.clone(),
                        command: request.command.clone(),
                        shell: request.shell,
                    },
                );
                Arc::new(RemoteProcess {
                    process_id,
                    channel: channel.clone(),
                    label: target_label(channel).to_string(),
                    color: request
                        .color
                        .then(|| PREFIX_COLORS[position % PREFIX_COLORS.len()]),
                    start_request,
                    progress: Mutex::new(Progress::default()),
                })
            })
            .collect();
        *self.table.output.layout.lock() = Layout {
            show_host_names: request.show_host_names,
            label_width: processes.iter().map(|process| process.label.len()).max().unwrap_or(0),
        };
        *self.table.stdin.lock() = request.stdin.clone();
        *self.table.processes.lock() = processes
            .iter()
            .map(|process| (process.process_id.clone(), Arc::clone(process)))
            .collect();
        processes
    }
}

/// Forgets the processes of an execution once it returns.
struct ClearOnDrop<'a>(&'a ProcessTable);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.processes.lock().clear();
        *self.0.stdin.lock() = Bytes::new();
        self.0.changed.clear();
    }
}
