mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use messagebus::{BusError, ProcessExecutor, ProcessOutput, ProcessRequest};
use messagebus_proto::{ErrorPayload, Message, MessageBody, MessageKind};
use parking_lot::Mutex;
use transport_bus::LocalBus;

use common::{SharedBuffer, open};

fn process_id_of(message: &Message) -> String {
    match &message.body {
        MessageBody::ProcessStartRequest { process_id, .. } => process_id.clone(),
        other => panic!("not a start request: {other:?}"),
    }
}

fn reply(request: &Message, body: MessageBody) -> Message {
    Message::new("@", body).with_sender(request.channel.clone())
}

/// Remote process that prints `chunks` on stdout and exits with `exit_code`.
fn run_remote(request: &Message, chunks: &[&'static [u8]], exit_code: i32) -> Vec<Message> {
    let process_id = process_id_of(request);
    let mut replies = vec![reply(
        request,
        MessageBody::ProcessStartEvent {
            process_id: process_id.clone(),
            os_process_id: Some(4711),
            locale_encoding: Some("utf-8".into()),
        },
    )];
    for chunk in chunks {
        replies.push(reply(
            request,
            MessageBody::ProcessDataRead {
                process_id: process_id.clone(),
                stdout: Bytes::from_static(chunk),
                stderr: Bytes::new(),
            },
        ));
    }
    replies.push(reply(request, MessageBody::ProcessStopEvent { process_id, exit_code }));
    replies
}

fn executor(bus: &LocalBus) -> (ProcessExecutor, SharedBuffer, SharedBuffer, messagebus::ConnectionScope) {
    let scope = open(bus);
    let stdout = SharedBuffer::default();
    let stderr = SharedBuffer::default();
    let executor = ProcessExecutor::new(
        Arc::clone(scope.connection()),
        ProcessOutput::new(Box::new(stdout.clone()), Box::new(stderr.clone())),
    );
    (executor, stdout, stderr, scope)
}

fn request(channels: &[&str]) -> ProcessRequest {
    let mut request = ProcessRequest::new(
        channels.iter().map(|channel| channel.to_string()).collect(),
        vec!["echo".into(), "hello".into()],
    );
    request.color = false;
    request
}

#[test_timeout::timeout]
fn test_output_is_line_buffered_and_prefixed() {
    let bus = LocalBus::new();
    bus.set_responder(|message| match message.kind() {
        MessageKind::ProcessStartRequest => run_remote(message, &[b"hello\nwor", b"ld\n"], 0),
        _ => Vec::new(),
    });
    let (executor, stdout, _stderr, _scope) = executor(&bus);

    let report = executor.execute(&request(&["host:c1"])).expect("report");

    assert_eq!(report.exit_code(), 0);
    assert_eq!(stdout.contents(), "c1 | hello\nc1 | world\n");
}

#[test_timeout::timeout]
fn test_exit_code_is_first_non_zero_remote_code() {
    let bus = LocalBus::new();
    bus.set_responder(|message| match (message.kind(), message.channel.as_str()) {
        (MessageKind::ProcessStartRequest, "host:ok") => run_remote(message, &[], 0),
        (MessageKind::ProcessStartRequest, _) => run_remote(message, &[], 3),
        _ => Vec::new(),
    });
    let (executor, _stdout, _stderr, _scope) = executor(&bus);

    let report = executor.execute(&request(&["host:ok", "host:bad"])).expect("report");
    assert_eq!(report.exit_code(), 3);
    assert_eq!(report.failed_channels(), vec!["host:bad"]);
}

#[test_timeout::timeout]
fn test_unanswered_start_fails_after_start_timeout() {
    let bus = LocalBus::new();
    let (executor, _stdout, stderr, _scope) = executor(&bus);

    let started = Instant::now();
    let report = executor.execute(&request(&["host:offline"])).expect("report");

    assert!(started.elapsed() >= common::fast_config().process_start_timeout);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.outcomes[0].error.as_deref(), Some("Failed to start process"));
    assert!(stderr.contents().contains("Failed to start process"));
}

#[test_timeout::timeout]
fn test_run_timeout_sends_stop_request() {
    let bus = LocalBus::new();
    bus.set_responder(|message| match &message.body {
        MessageBody::ProcessStartRequest { process_id, .. } => vec![reply(
            message,
            MessageBody::ProcessStartEvent {
                process_id: process_id.clone(),
                os_process_id: None,
                locale_encoding: None,
            },
        )],
        _ => Vec::new(),
    });
    let (executor, _stdout, _stderr, _scope) = executor(&bus);

    let mut sleepy = request(&["host:c1"]);
    sleepy.timeout = Some(Duration::from_millis(150));
    let report = executor.execute(&sleepy).expect("report");

    assert_eq!(report.outcomes[0].error.as_deref(), Some("Process timeout"));
    let stops = bus.sent_of_kind(MessageKind::ProcessStopRequest);
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].channel, "host:c1");
}

#[test_timeout::timeout]
fn test_remote_error_keeps_first_error_only() {
    let bus = LocalBus::new();
    bus.set_responder(|message| match &message.body {
        MessageBody::ProcessStartRequest { process_id, .. } => ["command not found", "second"]
            .into_iter()
            .map(|text| {
                reply(
                    message,
                    MessageBody::ProcessError {
                        process_id: process_id.clone(),
                        error: ErrorPayload::new(text),
                    },
                )
            })
            .collect(),
        _ => Vec::new(),
    });
    let (executor, _stdout, stderr, _scope) = executor(&bus);

    let report = executor.execute(&request(&["host:c1"])).expect("report");

    assert_eq!(report.outcomes[0].error.as_deref(), Some("command not found"));
    assert_eq!(report.exit_code(), 1);
    assert!(!stderr.contents().contains("second"));
}

#[test_timeout::timeout]
fn test_stdin_is_forwarded_in_chunks_after_start() {
    let bus = LocalBus::new();
    bus.set_responder(|message| match message.kind() {
        MessageKind::ProcessStartRequest => run_remote(message, &[], 0),
        _ => Vec::new(),
    });
    let (executor, _stdout, _stderr, _scope) = executor(&bus);

    let mut piped = request(&["host:c1"]);
    piped.stdin = Bytes::from(vec![b'x'; 70_000]);
    executor.execute(&piped).expect("report");

    let writes: Vec<usize> = bus
        .sent_of_kind(MessageKind::ProcessDataWrite)
        .iter()
        .map(|message| match &message.body {
            MessageBody::ProcessDataWrite { stdin, .. } => stdin.len(),
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(writes, vec![32_768, 32_768, 4_464, 0]);
}

#[test_timeout::timeout]
fn test_concurrency_limits_started_processes() {
    let bus = LocalBus::new();
    let starts: Arc<Mutex<Vec<(String, Instant)>>> = Arc::default();
    let seen = Arc::clone(&starts);
    bus.set_responder(move |message| {
        if message.kind() != MessageKind::ProcessStartRequest {
            return Vec::new();
        }
        seen.lock().push((message.channel.clone(), Instant::now()));
        if message.channel == "host:slow" {
            return Vec::new();
        }
        run_remote(message, &[], 0)
    });
    let (executor, _stdout, _stderr, _scope) = executor(&bus);

    let mut limited = request(&["host:slow", "host:fast"]);
    limited.concurrency = 1;
    let report = executor.execute(&limited).expect("report");

    let starts = starts.lock();
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[0].0, "host:slow");
    assert!(starts[1].1.duration_since(starts[0].1) >= common::fast_config().process_start_timeout);
    assert_eq!(report.failed_channels(), vec!["host:slow"]);
}

#[test_timeout::timeout]
fn test_out_of_order_data_is_dropped() {
    let bus = LocalBus::new();
    bus.set_responder(|message| {
        if message.kind() != MessageKind::ProcessStartRequest {
            return Vec::new();
        }
        let process_id = process_id_of(message);
        let data = |created: i64, text: &'static [u8]| {
            reply(
                message,
                MessageBody::ProcessDataRead {
                    process_id: process_id.clone(),
                    stdout: Bytes::from_static(text),
                    stderr: Bytes::new(),
                },
            )
            .with_created(created)
        };
        vec![
            reply(
                message,
                MessageBody::ProcessStartEvent {
                    process_id: process_id.clone(),
                    os_process_id: None,
                    locale_encoding: None,
                },
            ),
            data(2_000, b"new\n"),
            data(1_000, b"old\n"),
            reply(
                message,
                MessageBody::ProcessStopEvent {
                    process_id: process_id.clone(),
                    exit_code: 0,
                },
            ),
        ]
    });
    let (executor, stdout, _stderr, _scope) = executor(&bus);

    let mut quiet = request(&["host:c1"]);
    quiet.show_host_names = false;
    executor.execute(&quiet).expect("report");
    assert_eq!(stdout.contents(), "new\n");
}

#[test]
fn test_duplicate_channels_are_rejected() {
    let bus = LocalBus::new();
    let (executor, _stdout, _stderr, _scope) = executor(&bus);
    let err = executor.execute(&request(&["host:a", "host:a"])).unwrap_err();
    assert!(matches!(err, BusError::InvalidArgument(_)));
}
