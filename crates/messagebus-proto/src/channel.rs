/// Channel the server uses to address this connection's user.
pub const CONNECTION_USER_CHANNEL: &str = "@";
/// Control channel that accepts subscription requests.
pub const MESSAGEBUS_SERVICE_CHANNEL: &str = "service:messagebus";
/// Channel answering JSONRPC calls against the config service backend.
pub const CONFIG_JSONRPC_CHANNEL: &str = "service:config:jsonrpc";

pub fn session_channel(session_id: &str) -> String {
    format!("session:{session_id}")
}

pub fn host_channel(host_id: &str) -> String {
    format!("host:{host_id}")
}

pub fn depot_process_channel(depot_id: &str) -> String {
    format!("service:depot:{depot_id}:process")
}

pub fn depot_terminal_channel(depot_id: &str) -> String {
    format!("service:depot:{depot_id}:terminal")
}

pub fn event_channel(event: &str) -> String {
    format!("event:{event}")
}

/// Host id addressed by a `host:` channel, if any.
pub fn host_id_of(channel: &str) -> Option<&str> {
    channel.strip_prefix("host:")
}

/// Short label for a target channel, used to prefix fan-out output.
pub fn target_label(channel: &str) -> &str {
    if let Some(host) = host_id_of(channel) {
        return host;
    }
    channel
        .strip_prefix("service:depot:")
        .and_then(|rest| rest.rsplit_once(':').map(|(depot, _)| depot))
        .unwrap_or(channel)
}
