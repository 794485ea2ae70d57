use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use messagebus_proto::{Message, MessageBody, MessageKind, event_channel};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::connection::BusConnection;
use crate::dispatch::HandlerRegistration;
use crate::error::BusResult;
use crate::signal::WaitHandle;

pub const HOST_CONNECTED_EVENT: &str = "host_connected";

/// Source of hosts that are connected right now, queried once before the
/// event-driven wait starts.
pub trait HostDirectory {
    fn connected_host_ids(&self) -> BusResult<Vec<String>>;
}

impl<F> HostDirectory for F
where
    F: Fn() -> BusResult<Vec<String>>,
{
    fn connected_host_ids(&self) -> BusResult<Vec<String>> {
        self()
    }
}

type KeyFn = Box<dyn Fn(&Value) -> Option<String> + Send>;

struct Watch {
    event: String,
    remaining: BTreeSet<String>,
    key: KeyFn,
    last_match: Option<Value>,
}

#[derive(Default)]
struct WaitSet {
    watch: Mutex<Option<Watch>>,
    emptied: WaitHandle,
}

impl WaitSet {
    fn arm(&self, watch: Watch) {
        self.emptied.clear();
        let empty = watch.remaining.is_empty();
        *self.watch.lock() = Some(watch);
        if empty {
            self.emptied.set();
        }
    }

    fn remove(&self, key: &str) -> bool {
        let mut watch = self.watch.lock();
        let Some(current) = watch.as_mut() else {
            return false;
        };
        let removed = current.remaining.remove(key);
        if removed && current.remaining.is_empty() {
            self.emptied.set();
        }
        removed
    }

    fn observe(&self, message: &Message) {
        let MessageBody::Event { event, data } = &message.body else {
            return;
        };
        let mut watch = self.watch.lock();
        let Some(current) = watch.as_mut() else {
            return;
        };
        if current.event != *event {
            return;
        }
        let Some(key) = (current.key)(data) else {
            debug!(target: "messagebus::waiter", event = %event, "event does not match");
            return;
        };
        if current.remaining.remove(&key) {
            debug!(target: "messagebus::waiter", event = %event, key = %key, "event matched");
            current.last_match = Some(data.clone());
            if current.remaining.is_empty() {
                self.emptied.set();
            }
        }
    }

    fn remaining(&self) -> BTreeSet<String> {
        self.watch
            .lock()
            .as_ref()
            .map(|watch| watch.remaining.clone())
            .unwrap_or_default()
    }

    fn last_match(&self) -> Option<Value> {
        self.watch
            .lock()
            .as_ref()
            .and_then(|watch| watch.last_match.clone())
    }

    fn reset(&self) {
        *self.watch.lock() = None;
        self.emptied.clear();
    }
}

struct ResetOnDrop<'a>(&'a WaitSet);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.reset();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostWaitReport {
    pub requested: BTreeSet<String>,
    pub missing: BTreeSet<String>,
    pub elapsed: Duration,
}

impl HostWaitReport {
    pub fn connected(&self) -> BTreeSet<&str> {
        self.requested
            .iter()
            .filter(|host| !self.missing.contains(*host))
            .map(String::as_str)
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.requested.len() - self.missing.len()
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Blocks until broadcast events arrive on an `event:<name>` channel.
///
/// The wait set is armed before the subscription is requested so events
/// published in between are not lost, and it is reset when the wait ends.
pub struct EventWaiter {
    connection: Arc<BusConnection>,
    waits: Arc<WaitSet>,
    _events: HandlerRegistration,
}

impl EventWaiter {
    pub fn new(connection: Arc<BusConnection>) -> Self {
        let waits = Arc::new(WaitSet::default());
        let sink = Arc::clone(&waits);
        let events = connection
            .dispatcher()
            .register(MessageKind::Event, move |message: &Message| {
                sink.observe(message);
                Ok(())
            });
        Self {
            connection,
            waits,
            _events: events,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.waits.watch.lock().is_none()
    }

    /// Waits for one `event` whose data satisfies `predicate`. Returns the
    /// event data, or `None` on timeout.
    pub fn wait_for_event<P>(
        &self,
        event: &str,
        predicate: P,
        timeout: Duration,
    ) -> BusResult<Option<Value>>
    where
        P: Fn(&Value) -> bool + Send + 'static,
    {
        const ANY: &str = "*";
        self.waits.arm(Watch {
            event: event.to_string(),
            remaining: BTreeSet::from([ANY.to_string()]),
            key: Box::new(move |data: &Value| predicate(data).then(|| ANY.to_string())),
            last_match: None,
        });
        let _reset = ResetOnDrop(&self.waits);
        self.connection.subscribe(&event_channel(event))?;
        info!(target: "messagebus::waiter", event, timeout = ?timeout, "waiting for event");
        if self.waits.emptied.wait(timeout) {
            Ok(self.waits.last_match())
        } else {
            info!(target: "messagebus::waiter", event, "no matching event before timeout");
            Ok(None)
        }
    }

    /// Waits until every host in `host_ids` is connected to the messagebus.
    /// Hosts that never connect are reported, not raised. Host ids compare
    /// case-insensitively and are reported lowercased.
    pub fn wait_for_hosts(
        &self,
        host_ids: &BTreeSet<String>,
        timeout: Duration,
        directory: &dyn HostDirectory,
    ) -> BusResult<HostWaitReport> {
        self.wait_for_hosts_with(host_ids, timeout, directory, |_| Ok(()))
    }

    /// Like [`EventWaiter::wait_for_hosts`], but calls `wake` with the hosts
    /// that are not connected yet before blocking. `wake` runs after the
    /// event subscription is in place and is skipped when nothing is missing.
    pub fn wait_for_hosts_with<F>(
        &self,
        host_ids: &BTreeSet<String>,
        timeout: Duration,
        directory: &dyn HostDirectory,
        wake: F,
    ) -> BusResult<HostWaitReport>
    where
        F: FnOnce(&BTreeSet<String>) -> BusResult<()>,
    {
        let started = Instant::now();
        let host_ids: BTreeSet<String> = host_ids.iter().map(|host| host.to_lowercase()).collect();
        let host_ids = &host_ids;
        self.waits.arm(Watch {
            event: HOST_CONNECTED_EVENT.to_string(),
            remaining: host_ids.clone(),
            key: Box::new(|data: &Value| {
                data.get("host")
                    .and_then(|host| host.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_lowercase)
            }),
            last_match: None,
        });
        let _reset = ResetOnDrop(&self.waits);
        if host_ids.is_empty() {
            return Ok(self.report(host_ids, started));
        }
        self.connection.subscribe(&event_channel(HOST_CONNECTED_EVENT))?;

        for host in directory.connected_host_ids()? {
            if self.waits.remove(&host.to_lowercase()) {
                info!(target: "messagebus::waiter", host = %host, "host already connected");
            }
        }
        if !self.waits.emptied.is_set() {
            let missing = self.waits.remaining();
            if !missing.is_empty() {
                wake(&missing)?;
            }
            info!(
                target: "messagebus::waiter",
                waiting = missing.len(),
                timeout = ?timeout,
                "waiting for hosts to connect"
            );
            self.waits.emptied.wait(timeout);
        }

        let report = self.report(host_ids, started);
        if report.is_complete() {
            info!(target: "messagebus::waiter", hosts = host_ids.len(), "all hosts connected");
        } else {
            error!(
                target: "messagebus::waiter",
                connected = report.connected_count(),
                requested = host_ids.len(),
                missing = ?report.missing,
                "not all hosts connected before timeout"
            );
        }
        Ok(report)
    }

    fn report(&self, host_ids: &BTreeSet<String>, started: Instant) -> HostWaitReport {
        HostWaitReport {
            requested: host_ids.clone(),
            missing: self.waits.remaining(),
            elapsed: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn host_event(host: &str) -> Message {
        Message::new(
            "event:host_connected",
            MessageBody::Event {
                event: HOST_CONNECTED_EVENT.into(),
                data: json!({"host": {"id": host}}),
            },
        )
    }

    fn host_watch(hosts: &[&str]) -> Watch {
        Watch {
            event: HOST_CONNECTED_EVENT.into(),
            remaining: hosts.iter().map(|host| host.to_string()).collect(),
            key: Box::new(|data: &Value| data["host"]["id"].as_str().map(str::to_string)),
            last_match: None,
        }
    }

    #[test]
    fn matching_events_drain_the_set() {
        let waits = WaitSet::default();
        waits.arm(host_watch(&["a", "b"]));
        waits.observe(&host_event("a"));
        waits.observe(&host_event("zzz"));
        assert!(!waits.emptied.is_set());
        waits.observe(&host_event("b"));
        assert!(waits.emptied.is_set());
    }

    #[test]
    fn events_without_watch_are_ignored() {
        let waits = WaitSet::default();
        waits.observe(&host_event("a"));
        assert!(waits.remaining().is_empty());
        assert!(!waits.emptied.is_set());
    }

    #[test]
    fn reset_disarms() {
        let waits = WaitSet::default();
        waits.arm(host_watch(&["a"]));
        waits.reset();
        waits.observe(&host_event("a"));
        assert!(!waits.emptied.is_set());
    }

    #[test]
    fn report_counts() {
        let report = HostWaitReport {
            requested: ["a", "b"].iter().map(|h| h.to_string()).collect(),
            missing: ["b"].iter().map(|h| h.to_string()).collect(),
            elapsed: Duration::ZERO,
        };
        assert_eq!(report.connected_count(), 1);
        assert_eq!(report.connected(), BTreeSet::from(["a"]));
        assert!(!report.is_complete());
    }
}
