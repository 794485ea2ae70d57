use std::collections::BTreeSet;

use messagebus::{BusError, BusResult, HostDirectory, RpcCorrelator};
use messagebus_proto::{CONFIG_JSONRPC_CHANNEL, depot_process_channel, depot_terminal_channel, host_channel};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::CliError;

pub const CONFIGSERVER_TARGET: &str = "configserver";
const ALL_HOSTS: &str = "all";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HostObject {
    pub id: String,
    #[serde(rename = "type")]
    pub host_type: String,
}

/// The configserver and every depot server, the configserver included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerHosts {
    pub configserver: Option<String>,
    pub depots: BTreeSet<String>,
}

impl ServerHosts {
    pub fn from_objects(objects: Vec<HostObject>) -> Self {
        let mut hosts = ServerHosts::default();
        for object in objects {
            let id = object.id.to_lowercase();
            if object.host_type == "OpsiConfigserver" {
                hosts.configserver = Some(id.clone());
            }
            hosts.depots.insert(id);
        }
        hosts
    }
}

pub struct ConfigService<'a> {
    rpc: &'a RpcCorrelator,
}

impl<'a> ConfigService<'a> {
    pub fn new(rpc: &'a RpcCorrelator) -> Self {
        Self { rpc }
    }

    fn call(&self, method: &str, params: Vec<Value>) -> BusResult<Value> {
        self.rpc.jsonrpc(CONFIG_JSONRPC_CHANNEL, method, params)
    }

    pub fn messagebus_connected_ids(&self) -> BusResult<Vec<String>> {
        string_list(self.call("host_getMessagebusConnectedIds", vec![])?)
    }

    pub fn client_ids(&self) -> BusResult<Vec<String>> {
        string_list(self.call("host_getIdents", vec![json!("str"), json!({"type": "OpsiClient"})])?)
    }

    pub fn server_hosts(&self) -> BusResult<ServerHosts> {
        let result = self.call(
            "host_getObjects",
            vec![json!(["id", "type"]), json!({"type": "OpsiDepotserver"})],
        )?;
        let objects: Vec<HostObject> = serde_json::from_value(result)
            .map_err(|err| BusError::Connection(format!("unexpected host_getObjects result: {err}")))?;
        Ok(ServerHosts::from_objects(objects))
    }

    /// Sends wakeup packets to `host_ids` and returns how many were sent.
    /// A sent packet says nothing about whether the host comes up.
    pub fn wake_hosts(&self, host_ids: &[String]) -> BusResult<usize> {
        let result = self.call("hostControlSafe_start", vec![json!(host_ids)])?;
        count_successes(&result)
    }
}

impl HostDirectory for ConfigService<'_> {
    fn connected_host_ids(&self) -> BusResult<Vec<String>> {
        self.messagebus_connected_ids()
    }
}

/// Counts the entries of a per-host result object that carry no error.
fn count_successes(result: &Value) -> BusResult<usize> {
    let Value::Object(entries) = result else {
        return Err(BusError::Connection(format!(
            "expected a result per host, got {result}"
        )));
    };
    let mut sent = 0;
    for (host, entry) in entries {
        match entry.get("error") {
            Some(error) if !error.is_null() && error != "" => {
                warn!(target: "opsi_cli::service", host = %host, error = %error, "host control request failed");
            }
            _ => sent += 1,
        }
    }
    Ok(sent)
}

fn string_list(value: Value) -> BusResult<Vec<String>> {
    serde_json::from_value(value)
        .map_err(|err| BusError::Connection(format!("expected a list of host ids: {err}")))
}

/// Lowercases and checks a fully qualified host id.
pub fn normalize_host_id(raw: &str) -> Result<String, CliError> {
    let id = raw.trim().trim_end_matches('.').to_lowercase();
    let labels: Vec<&str> = id.split('.').collect();
    let valid = labels.len() >= 3
        && labels.iter().all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if valid {
        Ok(id)
    } else {
        Err(CliError::InvalidArgument(format!("'{raw}' is not a valid host id")))
    }
}

/// Channel a terminal on `target` is requested on. Hosts other than the
/// configserver must currently be connected to the messagebus.
pub fn terminal_channel(
    target: &str,
    servers: &ServerHosts,
    connected: &[String],
) -> Result<String, CliError> {
    let host_id = if target.eq_ignore_ascii_case(CONFIGSERVER_TARGET) {
        servers
            .configserver
            .clone()
            .ok_or_else(|| CliError::InvalidArgument("no configserver known to the service".into()))?
    } else {
        normalize_host_id(target)?
    };
    let is_configserver = servers.configserver.as_deref() == Some(host_id.as_str());
    if !is_configserver && !connected.iter().any(|id| id.eq_ignore_ascii_case(&host_id)) {
        return Err(CliError::HostNotConnected(host_id));
    }
    let channel = if servers.depots.contains(&host_id) {
        depot_terminal_channel(&host_id)
    } else {
        host_channel(&host_id)
    };
    debug!(target: "opsi_cli::service", host = %host_id, channel = %channel, "resolved terminal target");
    Ok(channel)
}

/// Splits a host list option; `all` expands through `expand_all`.
pub fn select_hosts<F>(raw: &[String], expand_all: F) -> Result<BTreeSet<String>, CliError>
where
    F: FnOnce() -> BusResult<Vec<String>>,
{
    let entries: Vec<&str> = raw
        .iter()
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .collect();
    if entries.iter().any(|entry| entry.eq_ignore_ascii_case(ALL_HOSTS)) {
        return Ok(expand_all()?.iter().map(|id| id.to_lowercase()).collect());
    }
    entries.into_iter().map(normalize_host_id).collect()
}

pub fn client_channels(clients: &BTreeSet<String>) -> Vec<String> {
    clients.iter().map(|id| host_channel(id)).collect()
}

pub fn depot_channels(depots: &BTreeSet<String>) -> Vec<String> {
    depots.iter().map(|id| depot_process_channel(id)).collect()
}
