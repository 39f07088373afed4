use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::Local;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::adb::command::ParsedCommand;
use crate::app::config::DispatchSettings;
use crate::app::error::{AppError, ERR_SYSTEM};
use crate::app::models::{
    InstallProgress, JobReport, LogLine, SshConnection, WorkerOutcome, WorkerResult,
};
use crate::app::transport::{LocalTransport, SshTransport, Transport};
use crate::app::worker::{CommandWorker, WorkerMessage, WorkerRequest, WorkerState};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    JobStarted {
        job_id: String,
        command: String,
        header: String,
        devices: Vec<String>,
        started_at: String,
    },
    Output {
        job_id: String,
        device: String,
        line: String,
    },
    Progress {
        job_id: String,
        device: String,
        progress: InstallProgress,
    },
    DeviceState {
        job_id: String,
        device: String,
        state: WorkerState,
    },
    DeviceFinished {
        job_id: String,
        result: WorkerResult,
        summary: LogLine,
        completed: usize,
        total: usize,
        wall_seconds: f64,
    },
    BatchComplete {
        job_id: String,
        total: usize,
        succeeded: usize,
        failed: usize,
    },
}

pub type DispatchEmitter = Arc<dyn Fn(DispatchEvent) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub devices: Vec<String>,
    pub command: String,
    /// Merged with any `-r` in an install command.
    pub reinstall: bool,
    pub trace_id: Option<String>,
}

pub(crate) fn resolve_trace_id(input: Option<String>) -> String {
    input
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Trimmed, non-empty, first occurrence wins.
fn unique_devices(devices: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    devices
        .iter()
        .map(|device| device.trim().to_string())
        .filter(|device| !device.is_empty() && seen.insert(device.clone()))
        .collect()
}

pub fn job_header(command: &str, at: &chrono::DateTime<Local>) -> String {
    format!(
        "{} COMMAND: {}",
        command.trim().to_uppercase(),
        at.format("%Y-%m-%d %H:%M:%S")
    )
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, settings: DispatchSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    pub fn local(settings: DispatchSettings) -> Self {
        let transport = Arc::new(LocalTransport::new(&settings.adb_path));
        Self::new(transport, settings)
    }

    pub fn ssh(connection: SshConnection, settings: DispatchSettings) -> Self {
        let transport = Arc::new(SshTransport::new(connection, &settings.remote_adb));
        Self::new(transport, settings)
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn dispatch(
        &self,
        devices: &[String],
        command: &str,
        emitter: DispatchEmitter,
    ) -> Result<JobHandle, AppError> {
        self.dispatch_with(
            DispatchRequest {
                devices: devices.to_vec(),
                command: command.to_string(),
                ..DispatchRequest::default()
            },
            emitter,
        )
    }

    /// Starts one worker per device and returns immediately. Validation failures are
    /// returned synchronously and nothing is spawned.
    pub fn dispatch_with(
        &self,
        request: DispatchRequest,
        emitter: DispatchEmitter,
    ) -> Result<JobHandle, AppError> {
        let trace_id = resolve_trace_id(request.trace_id);
        let command = request.command.trim().to_string();
        let parsed = ParsedCommand::parse(&command, &trace_id)?;
        let devices = unique_devices(&request.devices);
        if devices.is_empty() {
            return Err(AppError::validation(
                "Select at least one device",
                &trace_id,
            ));
        }

        let timeout = if parsed.verb.is_unbounded() {
            None
        } else {
            self.settings.command_timeout()
        };
        let job_id = Uuid::new_v4().to_string();
        let total = devices.len();
        let job_start = Instant::now();
        let now = Local::now();

        info!(
            trace_id = %trace_id,
            job_id = %job_id,
            transport = %self.transport.describe(),
            verb = parsed.verb.name(),
            devices = total,
            "dispatching job"
        );
        emitter(DispatchEvent::JobStarted {
            job_id: job_id.clone(),
            command: command.clone(),
            header: job_header(&command, &now),
            devices: devices.clone(),
            started_at: now.to_rfc3339(),
        });

        let (tx, rx) = mpsc::channel::<WorkerMessage>();
        let mut cancel_flags = HashMap::new();
        let mut started = HashMap::new();
        for device in &devices {
            let flag = Arc::new(AtomicBool::new(false));
            cancel_flags.insert(device.clone(), Arc::clone(&flag));
            started.insert(device.clone(), Instant::now());
            let worker = CommandWorker::with_cancel_flag(
                WorkerRequest {
                    device: device.clone(),
                    command: command.clone(),
                    reinstall: request.reinstall,
                    timeout,
                    trace_id: trace_id.clone(),
                },
                flag,
            );
            let transport = Arc::clone(&self.transport);
            let worker_tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("worker-{device}"))
                .spawn(move || {
                    worker.run(transport.as_ref(), &worker_tx);
                });
            if let Err(err) = spawned {
                warn!(trace_id = %trace_id, device = %device, error = %err, "failed to spawn worker");
                let result = WorkerResult::failed(
                    device,
                    &command,
                    WorkerOutcome::Failed,
                    0.0,
                    ERR_SYSTEM,
                    format!("Failed to start worker: {err}"),
                );
                let _ = tx.send(WorkerMessage::Finished { result });
            }
        }
        drop(tx);

        let completed = Arc::new(AtomicUsize::new(0));
        let aggregator = Aggregator {
            job_id: job_id.clone(),
            trace_id: trace_id.clone(),
            command,
            total,
            job_start,
            active: started,
            completed: Arc::clone(&completed),
            emitter,
        };
        let join = thread::Builder::new()
            .name(format!("job-{job_id}"))
            .spawn(move || aggregator.run(rx));
        let join = match join {
            Ok(join) => join,
            Err(err) => {
                for flag in cancel_flags.values() {
                    flag.store(true, Ordering::SeqCst);
                }
                return Err(AppError::system(
                    format!("Failed to start job aggregator: {err}"),
                    &trace_id,
                ));
            }
        };

        Ok(JobHandle {
            job_id,
            trace_id,
            devices,
            total,
            completed,
            cancel_flags,
            join,
        })
    }
}

/// Owns the device -> start-time map. Only this thread mutates it.
struct Aggregator {
    job_id: String,
    trace_id: String,
    command: String,
    total: usize,
    job_start: Instant,
    active: HashMap<String, Instant>,
    completed: Arc<AtomicUsize>,
    emitter: DispatchEmitter,
}

impl Aggregator {
    fn run(mut self, rx: Receiver<WorkerMessage>) -> JobReport {
        let mut results = Vec::with_capacity(self.total);
        for message in rx {
            match message {
                WorkerMessage::Output { device, line } => (self.emitter)(DispatchEvent::Output {
                    job_id: self.job_id.clone(),
                    device,
                    line,
                }),
                WorkerMessage::Progress { device, progress } => {
                    (self.emitter)(DispatchEvent::Progress {
                        job_id: self.job_id.clone(),
                        device,
                        progress,
                    })
                }
                WorkerMessage::State { device, state } => {
                    (self.emitter)(DispatchEvent::DeviceState {
                        job_id: self.job_id.clone(),
                        device,
                        state,
                    })
                }
                WorkerMessage::Finished { result } => self.record(result, &mut results),
            }
        }

        // Every sender is gone; anything still active never reported.
        let mut silent: Vec<String> = self.active.keys().cloned().collect();
        silent.sort();
        for device in silent {
            warn!(trace_id = %self.trace_id, job_id = %self.job_id, device = %device, "worker ended without a result");
            let result = WorkerResult::failed(
                &device,
                &self.command,
                WorkerOutcome::Failed,
                0.0,
                ERR_SYSTEM,
                "Worker ended without reporting a result",
            );
            self.record(result, &mut results);
        }

        let succeeded: Vec<String> = results
            .iter()
            .filter(|result: &&WorkerResult| result.success)
            .map(|result| result.device.clone())
            .collect();
        let failed: Vec<String> = results
            .iter()
            .filter(|result: &&WorkerResult| !result.success)
            .map(|result| result.device.clone())
            .collect();

        info!(
            trace_id = %self.trace_id,
            job_id = %self.job_id,
            succeeded = succeeded.len(),
            failed = failed.len(),
            "job complete"
        );
        (self.emitter)(DispatchEvent::BatchComplete {
            job_id: self.job_id.clone(),
            total: self.total,
            succeeded: succeeded.len(),
            failed: failed.len(),
        });

        JobReport {
            job_id: self.job_id,
            command: self.command,
            total: self.total,
            completed: results.len(),
            succeeded,
            failed,
            results,
            total_duration_seconds: self.job_start.elapsed().as_secs_f64(),
        }
    }

    fn record(&mut self, result: WorkerResult, results: &mut Vec<WorkerResult>) {
        let Some(started) = self.active.remove(&result.device) else {
            debug!(trace_id = %self.trace_id, device = %result.device, "ignored duplicate result");
            return;
        };
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        (self.emitter)(DispatchEvent::DeviceFinished {
            job_id: self.job_id.clone(),
            summary: LogLine::for_result(&result),
            result: result.clone(),
            completed,
            total: self.total,
            wall_seconds: started.elapsed().as_secs_f64(),
        });
        results.push(result);
    }
}

pub struct JobHandle {
    job_id: String,
    trace_id: String,
    devices: Vec<String>,
    total: usize,
    completed: Arc<AtomicUsize>,
    cancel_flags: HashMap<String, Arc<AtomicBool>>,
    join: JoinHandle<JobReport>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Returns false when the device is not part of this job.
    pub fn cancel(&self, device: &str) -> bool {
        match self.cancel_flags.get(device.trim()) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for flag in self.cancel_flags.values() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Blocks until every worker has reported.
    pub fn wait(self) -> Result<JobReport, AppError> {
        self.join
            .join()
            .map_err(|_| AppError::system("Job aggregator panicked", &self.trace_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::error::{ERR_APK_NOT_FOUND, ERR_EMPTY_COMMAND, ERR_VALIDATION};
    use crate::app::transport::testing::{Script, ScriptedTransport};
    use std::sync::Mutex;
    use std::time::Duration;

    fn collector() -> (DispatchEmitter, Arc<Mutex<Vec<DispatchEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let emitter: DispatchEmitter = Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        });
        (emitter, events)
    }

    fn devices(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn dispatcher(transport: ScriptedTransport) -> (Dispatcher, Arc<ScriptedTransport>) {
        let transport = Arc::new(transport);
        let dispatcher = Dispatcher::new(transport.clone(), DispatchSettings::default());
        (dispatcher, transport)
    }

    fn count_batch_complete(events: &[DispatchEvent]) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, DispatchEvent::BatchComplete { .. }))
            .count()
    }

    #[test]
    fn partial_failure_is_reported_per_device() {
        let (dispatcher, _) = dispatcher(
            ScriptedTransport::local()
                .with_device("A", Script::exit(0, &["hi"]))
                .with_device("B", Script::exit(1, &["error: closed"])),
        );
        let (emitter, events) = collector();
        let job = dispatcher
            .dispatch(&devices(&["A", "B"]), "shell echo hi", emitter)
            .unwrap();
        assert_eq!(job.total(), 2);
        let report = job.wait().unwrap();

        assert_eq!(report.completed, 2);
        assert_eq!(report.succeeded, vec!["A"]);
        assert_eq!(report.failed, vec!["B"]);
        assert!(report.result_for("A").unwrap().success);
        assert!(!report.result_for("B").unwrap().success);

        let events = events.lock().unwrap();
        assert!(matches!(events.first(), Some(DispatchEvent::JobStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(DispatchEvent::BatchComplete {
                total: 2,
                succeeded: 1,
                failed: 1,
                ..
            })
        ));
        assert_eq!(count_batch_complete(&events), 1);

        let mut counts: Vec<usize> = events
            .iter()
            .filter_map(|event| match event {
                DispatchEvent::DeviceFinished { completed, .. } => Some(*completed),
                _ => None,
            })
            .collect();
        counts.sort();
        assert_eq!(counts, vec![1, 2]);
    }

    #[test]
    fn forwards_device_state_transitions() {
        let (dispatcher, _) = dispatcher(
            ScriptedTransport::local().with_device("B", Script::exit(1, &[])),
        );
        let (emitter, events) = collector();
        dispatcher
            .dispatch(&devices(&["A", "B"]), "shell true", emitter)
            .unwrap()
            .wait()
            .unwrap();
        let events = events.lock().unwrap();
        let states_of = |target: &str| -> Vec<WorkerState> {
            events
                .iter()
                .filter_map(|event| match event {
                    DispatchEvent::DeviceState { device, state, .. } if device == target => {
                        Some(*state)
                    }
                    _ => None,
                })
                .collect()
        };
        assert_eq!(states_of("A"), vec![WorkerState::Running, WorkerState::Succeeded]);
        assert_eq!(states_of("B"), vec![WorkerState::Running, WorkerState::Failed]);
    }

    #[test]
    fn summary_lines_are_color_coded() {
        let (dispatcher, _) = dispatcher(
            ScriptedTransport::local().with_device("B", Script::exit(1, &[])),
        );
        let (emitter, events) = collector();
        dispatcher
            .dispatch(&devices(&["A", "B"]), "shell true", emitter)
            .unwrap()
            .wait()
            .unwrap();
        let events = events.lock().unwrap();
        for event in events.iter() {
            if let DispatchEvent::DeviceFinished { result, summary, .. } = event {
                let expected = if result.device == "A" { "green" } else { "red" };
                assert_eq!(summary.tone.color(), expected);
            }
        }
    }

    #[test]
    fn empty_command_spawns_nothing() {
        let (dispatcher, transport) = dispatcher(ScriptedTransport::local());
        let (emitter, events) = collector();
        let err = dispatcher
            .dispatch(&devices(&["A", "B"]), "   ", emitter)
            .err()
            .expect("must fail");
        assert_eq!(err.code, ERR_EMPTY_COMMAND);
        assert_eq!(transport.call_count(), 0);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_selection_is_rejected() {
        let (dispatcher, transport) = dispatcher(ScriptedTransport::local());
        let (emitter, _) = collector();
        let err = dispatcher
            .dispatch(&devices(&[" ", ""]), "shell ls", emitter)
            .err()
            .expect("must fail");
        assert_eq!(err.code, ERR_VALIDATION);
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn one_result_per_unique_device() {
        let (dispatcher, transport) = dispatcher(ScriptedTransport::local());
        let (emitter, _) = collector();
        let report = dispatcher
            .dispatch(&devices(&["A", "B", "A", "C"]), "get-state", emitter)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(report.total, 3);
        let mut reported: Vec<_> = report.results.iter().map(|r| r.device.clone()).collect();
        reported.sort();
        assert_eq!(reported, vec!["A", "B", "C"]);
        assert_eq!(transport.call_count(), 3);
    }

    #[test]
    fn missing_apk_fails_every_device_without_processes() {
        let (dispatcher, transport) = dispatcher(ScriptedTransport::local());
        let (emitter, events) = collector();
        let report = dispatcher
            .dispatch(&devices(&["A", "B", "C"]), "install /no/such/app.apk -r", emitter)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(report.failed.len(), 3);
        assert!(report
            .results
            .iter()
            .all(|result| result.error_code.as_deref() == Some(ERR_APK_NOT_FOUND)));
        assert_eq!(transport.call_count(), 0);
        assert_eq!(count_batch_complete(&events.lock().unwrap()), 1);
    }

    #[test]
    fn cancelling_one_device_leaves_others_running() {
        let (dispatcher, transport) = dispatcher(
            ScriptedTransport::local()
                .with_device("A", Script::endless())
                .with_device("B", Script::exit(0, &["done"]).delayed(Duration::from_millis(50))),
        );
        let (emitter, _) = collector();
        let job = dispatcher
            .dispatch(&devices(&["A", "B"]), "shell watch", emitter)
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(job.cancel("A"));
        assert!(!job.cancel("Z"));
        let report = job.wait().unwrap();
        assert_eq!(
            report.result_for("A").unwrap().outcome,
            WorkerOutcome::Cancelled
        );
        assert!(report.result_for("B").unwrap().success);
        assert!(transport.launches_for("A")[0].killed());
    }

    #[test]
    fn header_upper_cases_command() {
        let at = Local::now();
        let header = job_header("shell echo hi", &at);
        assert!(header.starts_with("SHELL ECHO HI COMMAND: "));
    }
}
