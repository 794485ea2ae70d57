use std::sync::Arc;
use std::time::Duration;

use messagebus::BusConfig;
use messagebus_proto::{Message, MessageBody, MessageKind};
use opsi_cli::cli::{ExecuteArgs, JsonrpcArgs, WaitEventArgs, WaitHostsArgs, WakeupArgs};
use opsi_cli::commands::{self, Context};
use opsi_cli::config::Settings;
use opsi_cli::error::CliError;
use opsi_cli::output::OutputFormat;
use opsi_cli::telemetry::logging::LogConfig;
use serde_json::{Value, json};
use transport_bus::LocalBus;

fn context(bus: &LocalBus, dry_run: bool) -> Context {
    let settings = Settings {
        service: "local".into(),
        log: LogConfig::default(),
        output_format: OutputFormat::Text,
        dry_run,
        bus: BusConfig {
            subscription_timeout: Duration::from_millis(300),
            jsonrpc_timeout: Duration::from_millis(300),
            process_start_timeout: Duration::from_millis(300),
            input_poll_interval: Duration::from_millis(5),
            process_poll_interval: Duration::from_millis(20),
        },
    };
    Context::new(settings, Arc::new(bus.clone()))
}

fn rpc_reply(request: &Message, result: Value) -> Vec<Message> {
    let MessageBody::JsonrpcRequest { rpc_id, .. } = &request.body else {
        return Vec::new();
    };
    vec![
        Message::new(
            "@",
            MessageBody::JsonrpcResponse {
                rpc_id: Some(rpc_id.clone()),
                result: Some(result),
                error: None,
            },
        )
        .with_sender(request.channel.clone()),
    ]
}

fn method_of(message: &Message) -> Option<&str> {
    match &message.body {
        MessageBody::JsonrpcRequest { method, .. } => Some(method.as_str()),
        _ => None,
    }
}

fn text(out: Vec<u8>) -> String {
    String::from_utf8(out).expect("utf8 output")
}

fn execute_args(clients: &[&str]) -> ExecuteArgs {
    ExecuteArgs {
        clients: clients.iter().map(|client| client.to_string()).collect(),
        depots: Vec::new(),
        timeout: Some(Duration::ZERO),
        concurrent: 10,
        shell: false,
        stream: false,
        no_host_names: false,
        command: vec!["hostname".into()],
    }
}

#[test_timeout::timeout]
fn test_jsonrpc_prints_result_and_parses_params() {
    let bus = LocalBus::new();
    bus.set_responder(|message| match method_of(message) {
        Some("host_getIdents") => rpc_reply(message, json!(["c1.domain.tld", "c2.domain.tld"])),
        _ => Vec::new(),
    });
    let ctx = context(&bus, false);
    let args = JsonrpcArgs {
        method: "host_getIdents".into(),
        params: vec!["str".into(), "{\"type\": \"OpsiClient\"}".into()],
        channel: "service:config:jsonrpc".into(),
    };

    let mut out: Vec<u8> = Vec::new();
    commands::jsonrpc::run(&ctx, &args, &mut out).expect("jsonrpc");
    assert_eq!(text(out), "c1.domain.tld\nc2.domain.tld\n");

    let sent = bus.sent_of_kind(MessageKind::JsonrpcRequest);
    let MessageBody::JsonrpcRequest { params, .. } = &sent[0].body else {
        unreachable!();
    };
    assert_eq!(params, &vec![json!("str"), json!({"type": "OpsiClient"})]);
    assert_eq!(bus.disconnect_count(), 1);
}

#[test_timeout::timeout]
fn test_execute_dry_run_sends_nothing() {
    let bus = LocalBus::new();
    let ctx = context(&bus, true);

    let mut out: Vec<u8> = Vec::new();
    commands::execute::run(&ctx, &execute_args(&["c1.domain.tld"]), &mut out).expect("dry run");
    assert!(text(out).contains("clients c1.domain.tld"));
    assert_eq!(bus.connect_count(), 0);
    assert!(bus.sent().is_empty());
}

#[test_timeout::timeout]
fn test_execute_reports_remote_exit_code() {
    let bus = LocalBus::new();
    bus.set_responder(|message| match (method_of(message), message.channel.as_str()) {
        (Some("process_execute"), "host:c1.domain.tld") => {
            rpc_reply(message, json!({"exit_code": 0, "stdout": "c1\n"}))
        }
        (Some("process_execute"), _) => rpc_reply(message, json!({"exit_code": 2, "stderr": "boom"})),
        _ => Vec::new(),
    });
    let ctx = context(&bus, false);

    let mut out: Vec<u8> = Vec::new();
    let err = commands::execute::run(&ctx, &execute_args(&["c1.domain.tld", "C2.domain.tld"]), &mut out)
        .unwrap_err();
    assert!(matches!(err, CliError::Failed(2)), "{err:?}");
    let summary = text(out);
    assert!(summary.contains("host:c1.domain.tld:\nc1\n"));
    assert!(summary.contains("Failed on 1 of 2 targets"));
    assert!(summary.contains("host:c2.domain.tld"));
}

#[test_timeout::timeout]
fn test_execute_all_clients_expands_through_service() {
    let bus = LocalBus::new();
    bus.set_responder(|message| match method_of(message) {
        Some("host_getIdents") => rpc_reply(message, json!(["C1.domain.tld"])),
        Some("process_execute") => rpc_reply(message, json!({"exit_code": 0})),
        _ => Vec::new(),
    });
    let ctx = context(&bus, false);

    let mut out: Vec<u8> = Vec::new();
    commands::execute::run(&ctx, &execute_args(&["all"]), &mut out).expect("execute");
    let channels: Vec<String> = bus
        .sent_of_kind(MessageKind::JsonrpcRequest)
        .into_iter()
        .filter(|message| method_of(message) == Some("process_execute"))
        .map(|message| message.channel)
        .collect();
    assert_eq!(channels, vec!["host:c1.domain.tld"]);
}

#[test_timeout::timeout]
fn test_execute_requires_targets() {
    let bus = LocalBus::new();
    let ctx = context(&bus, false);
    let err = commands::execute::run(&ctx, &execute_args(&[]), &mut Vec::<u8>::new()).unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert_eq!(bus.connect_count(), 0);
}

#[test_timeout::timeout]
fn test_wait_hosts_lists_missing_hosts() {
    let bus = LocalBus::new();
    bus.set_responder(|message| match method_of(message) {
        Some("host_getMessagebusConnectedIds") => rpc_reply(message, json!(["c1.domain.tld"])),
        _ => Vec::new(),
    });
    let ctx = context(&bus, false);
    let args = WaitHostsArgs {
        hosts: vec!["c1.domain.tld".into(), "c2.domain.tld".into()],
        timeout: Some(Duration::from_millis(200)),
    };

    let mut out: Vec<u8> = Vec::new();
    let err = commands::wait::hosts(&ctx, &args, &mut out).unwrap_err();
    assert!(matches!(err, CliError::Failed(1)));
    let report = text(out);
    assert!(report.starts_with("1 of 2 hosts connected"));
    assert!(report.contains("Not connected: c2.domain.tld"));
}

fn host_connected(host: &str) -> Message {
    Message::new(
        "event:host_connected",
        MessageBody::Event {
            event: "host_connected".into(),
            data: json!({"host": {"type": "OpsiClient", "id": host}}),
        },
    )
}

#[test_timeout::timeout]
fn test_wakeup_wakes_only_disconnected_hosts() {
    let bus = LocalBus::new();
    bus.set_responder(|message| match method_of(message) {
        Some("host_getMessagebusConnectedIds") => rpc_reply(message, json!(["c1.domain.tld"])),
        Some("hostControlSafe_start") => {
            let mut replies = rpc_reply(
                message,
                json!({"c2.domain.tld": {"result": "sent", "error": null}}),
            );
            replies.push(host_connected("C2.domain.tld"));
            replies
        }
        _ => Vec::new(),
    });
    let ctx = context(&bus, false);
    let args = WakeupArgs {
        hosts: vec!["c1.domain.tld".into(), "c2.domain.tld".into()],
        timeout: Some(Duration::from_secs(5)),
    };

    let mut out: Vec<u8> = Vec::new();
    commands::wait::wakeup(&ctx, &args, &mut out).expect("wakeup");
    let report = text(out);
    assert!(report.starts_with("Sent wakeup to 1 of 1 hosts\n"), "{report}");
    assert!(report.contains("2 of 2 hosts connected"));

    let wakeups: Vec<Message> = bus
        .sent_of_kind(MessageKind::JsonrpcRequest)
        .into_iter()
        .filter(|message| method_of(message) == Some("hostControlSafe_start"))
        .collect();
    assert_eq!(wakeups.len(), 1);
    let MessageBody::JsonrpcRequest { params, .. } = &wakeups[0].body else {
        unreachable!();
    };
    assert_eq!(params, &vec![json!(["c2.domain.tld"])]);
}

#[test_timeout::timeout]
fn test_wakeup_reports_hosts_that_stay_down() {
    let bus = LocalBus::new();
    bus.set_responder(|message| match method_of(message) {
        Some("host_getMessagebusConnectedIds") => rpc_reply(message, json!([])),
        Some("hostControlSafe_start") => rpc_reply(
            message,
            json!({
                "c1.domain.tld": {"result": "sent", "error": null},
                "c2.domain.tld": {"result": null, "error": "no mac address"},
            }),
        ),
        _ => Vec::new(),
    });
    let ctx = context(&bus, false);
    let args = WakeupArgs {
        hosts: vec!["c1.domain.tld".into(), "c2.domain.tld".into()],
        timeout: Some(Duration::from_millis(200)),
    };

    let mut out: Vec<u8> = Vec::new();
    let err = commands::wait::wakeup(&ctx, &args, &mut out).unwrap_err();
    assert!(matches!(err, CliError::Failed(1)));
    let report = text(out);
    assert!(report.contains("Sent wakeup to 1 of 2 hosts"));
    assert!(report.contains("0 of 2 hosts connected"));
    assert!(report.contains("Not connected: c1.domain.tld, c2.domain.tld"));
}

#[test_timeout::timeout]
fn test_wakeup_dry_run_sends_nothing() {
    let bus = LocalBus::new();
    let ctx = context(&bus, true);
    let args = WakeupArgs {
        hosts: vec!["c1.domain.tld".into()],
        timeout: None,
    };

    let mut out: Vec<u8> = Vec::new();
    commands::wait::wakeup(&ctx, &args, &mut out).expect("dry run");
    assert_eq!(text(out), "Would wake c1.domain.tld\n");
    assert_eq!(bus.connect_count(), 0);
}

#[test_timeout::timeout]
fn test_wait_event_prints_matching_event() {
    let bus = LocalBus::new();
    bus.set_responder(|message| {
        let subscribes = matches!(
            &message.body,
            MessageBody::ChannelSubscriptionRequest { channels, .. }
                if channels.iter().any(|channel| channel == "event:product_on_client_updated")
        );
        if !subscribes {
            return Vec::new();
        }
        ["opsi-script", "firefox"]
            .into_iter()
            .map(|product| {
                Message::new(
                    "event:product_on_client_updated",
                    MessageBody::Event {
                        event: "product_on_client_updated".into(),
                        data: json!({"productId": product, "clientId": "c1.domain.tld"}),
                    },
                )
            })
            .collect()
    });
    let ctx = context(&bus, false);
    let args = WaitEventArgs {
        event: "product_on_client_updated".into(),
        matches: vec![("productId".into(), "firefox".into())],
        timeout: Some(Duration::from_secs(5)),
    };

    let mut out: Vec<u8> = Vec::new();
    commands::wait::event(&ctx, &args, &mut out).expect("event");
    let printed: Value = serde_json::from_slice(&out).expect("json output");
    assert_eq!(printed["productId"], "firefox");
}

#[test_timeout::timeout]
fn test_wait_event_without_match_fails() {
    let bus = LocalBus::new();
    let ctx = context(&bus, false);
    let args = WaitEventArgs {
        event: "host_connected".into(),
        matches: Vec::new(),
        timeout: Some(Duration::from_millis(100)),
    };

    let err = commands::wait::event(&ctx, &args, &mut Vec::<u8>::new()).unwrap_err();
    assert!(matches!(err, CliError::NoMatchingEvent { ref event } if event == "host_connected"));
}
