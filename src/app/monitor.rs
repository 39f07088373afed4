use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::app::error::AppError;
use crate::app::models::{DeviceStatus, ProbeResult};
use crate::app::prober::probe;
use crate::app::transport::Transport;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    Connected { device: String },
    Disconnected { device: String, status: DeviceStatus },
    ProbeFailed { error: AppError },
}

pub type DeviceEmitter = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

/// Connect/disconnect events between two snapshots, in listing order.
pub fn diff_snapshots(previous: &ProbeResult, current: &ProbeResult) -> Vec<DeviceEvent> {
    let before: HashSet<String> = previous.connected().into_iter().collect();
    let after: HashSet<String> = current.connected().into_iter().collect();

    let mut events = Vec::new();
    for device in &previous.devices {
        if before.contains(device) && !after.contains(device) {
            events.push(DeviceEvent::Disconnected {
                device: device.clone(),
                status: current.status_of(device),
            });
        }
    }
    for device in &current.devices {
        if after.contains(device) && !before.contains(device) {
            events.push(DeviceEvent::Connected {
                device: device.clone(),
            });
        }
    }
    events
}

pub struct DeviceMonitorHandle {
    stop_flag: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl DeviceMonitorHandle {
    pub fn stop(self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Polls the prober every `interval`. A failed probe emits `ProbeFailed` and keeps the last
/// good snapshot, so an unreachable adb never reports every device as gone.
pub fn start_device_monitor(
    transport: Arc<dyn Transport>,
    interval: Duration,
    probe_timeout: Duration,
    emitter: DeviceEmitter,
    trace_id: String,
) -> Result<DeviceMonitorHandle, AppError> {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_thread = Arc::clone(&stop_flag);
    let interval = interval.max(Duration::from_millis(10));
    let thread_trace_id = trace_id.clone();

    let join = thread::Builder::new()
        .name("device-monitor".to_string())
        .spawn(move || {
            let trace_id = thread_trace_id;
            info!(trace_id = %trace_id, transport = %transport.describe(), "device monitor started");
            let mut last = ProbeResult::default();
            let mut last_failed = false;
            loop {
                if stop_thread.load(Ordering::Relaxed) {
                    break;
                }
                match probe(transport.as_ref(), probe_timeout, &trace_id) {
                    Ok(current) => {
                        for event in diff_snapshots(&last, &current) {
                            emitter(event);
                        }
                        last = current;
                        last_failed = false;
                    }
                    Err(err) => {
                        if !last_failed {
                            warn!(trace_id = %trace_id, error = %err.error, "device monitor probe failed");
                        }
                        last_failed = true;
                        emitter(DeviceEvent::ProbeFailed { error: err });
                    }
                }

                let deadline = Instant::now() + interval;
                while Instant::now() < deadline {
                    if stop_thread.load(Ordering::Relaxed) {
                        break;
                    }
                    thread::sleep(Duration::from_millis(20).min(interval));
                }
            }
            info!(trace_id = %trace_id, "device monitor stopped");
        })
        .map_err(|err| AppError::system(format!("Failed to start device monitor: {err}"), trace_id))?;

    Ok(DeviceMonitorHandle { stop_flag, join })
}
