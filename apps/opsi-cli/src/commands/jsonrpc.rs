use std::io::Write;
use std::sync::Arc;

use messagebus::RpcCorrelator;
use serde_json::Value;
use tracing::debug;

use super::Context;
use crate::cli::JsonrpcArgs;
use crate::error::CliError;
use crate::output;

pub fn run<W: Write>(ctx: &Context, args: &JsonrpcArgs, out: &mut W) -> Result<(), CliError> {
    let params: Vec<Value> = args.params.iter().map(|raw| parse_param(raw)).collect();
    debug!(target: "opsi_cli::jsonrpc", method = %args.method, channel = %args.channel, ?params, "calling");

    let scope = ctx.connect()?;
    let rpc = RpcCorrelator::new(Arc::clone(scope.connection()));
    let result = rpc.jsonrpc(&args.channel, &args.method, params)?;
    output::write_value(out, ctx.settings.output_format, &result)?;
    Ok(())
}

/// JSON if it parses, the raw string otherwise.
fn parse_param(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
