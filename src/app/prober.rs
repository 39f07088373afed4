use std::time::Duration;

use tracing::{debug, warn};

use crate::app::adb::parse::parse_device_status;
use crate::app::adb::runner::collect_output;
use crate::app::error::AppError;
use crate::app::models::ProbeResult;
use crate::app::transport::Transport;

/// Runs `adb devices -l` once through `transport` and parses the listing.
///
/// Any transport-level failure (missing binary, unreachable host, timeout, non-zero exit)
/// becomes `ERR_PROBE_FAILURE`, so an `Ok` with no devices always means "zero devices".
pub fn probe(
    transport: &dyn Transport,
    timeout: Duration,
    trace_id: &str,
) -> Result<ProbeResult, AppError> {
    let args = vec!["devices".to_string(), "-l".to_string()];
    let process = transport.execute(&args, trace_id).map_err(|err| {
        warn!(trace_id = %trace_id, code = %err.code, error = %err.error, "probe could not start");
        AppError::probe_failure(
            format!("Device probe failed via {}: {}", transport.describe(), err.error),
            trace_id,
        )
    })?;

    let output = collect_output(process, timeout, trace_id).map_err(|err| {
        warn!(trace_id = %trace_id, error = %err.error, "probe did not complete");
        AppError::probe_failure(format!("Device probe failed: {}", err.error), trace_id)
    })?;

    if !output.success() {
        let detail = output.text();
        warn!(trace_id = %trace_id, exit_code = ?output.exit_code, "probe exited with failure");
        return Err(AppError::probe_failure(
            if detail.trim().is_empty() {
                format!("adb devices exited with {:?}", output.exit_code)
            } else {
                detail.trim().to_string()
            },
            trace_id,
        ));
    }

    let result = parse_device_status(&output.text());
    debug!(trace_id = %trace_id, devices = result.devices.len(), "probe complete");
    Ok(result)
}

/// Never fails: an empty result plus the error, kept separate from "zero devices".
pub fn probe_or_empty(
    transport: &dyn Transport,
    timeout: Duration,
    trace_id: &str,
) -> (ProbeResult, Option<AppError>) {
    match probe(transport, timeout, trace_id) {
        Ok(result) => (result, None),
        Err(err) => (ProbeResult::default(), Some(err)),
    }
}
