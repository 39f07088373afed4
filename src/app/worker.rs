//! Per-device command worker: one command against one device, reported exactly once.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::adb::command::{remote_install_plan, AdbVerb, ParsedCommand};
use crate::app::adb::parse::parse_progress_percent;
use crate::app::adb::runner::{collect_output, LineRead, RunningCommand, EXIT_POLL};
use crate::app::error::{AppError, ERR_CANCELLED, ERR_PROCESS_FAILURE, ERR_SYSTEM};
use crate::app::models::{InstallProgress, WorkerOutcome, WorkerResult};
use crate::app::transport::{Transport, TransportKind};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(15);
const MESSAGE_TAIL_LINES: usize = 5;
const ESTIMATE_STEP: u8 = 5;
const ESTIMATE_CAP: u8 = 89;
pub const CANCELLED_LINE: &str = "Cancelled.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerState::Succeeded | WorkerState::Failed | WorkerState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: WorkerState) -> bool {
        match self {
            WorkerState::Pending => matches!(next, WorkerState::Running | WorkerState::Failed),
            WorkerState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl From<WorkerOutcome> for WorkerState {
    fn from(outcome: WorkerOutcome) -> Self {
        match outcome {
            WorkerOutcome::Succeeded => WorkerState::Succeeded,
            WorkerOutcome::Failed => WorkerState::Failed,
            WorkerOutcome::Cancelled => WorkerState::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub device: String,
    pub command: String,
    pub reinstall: bool,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
    pub trace_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Output {
        device: String,
        line: String,
    },
    Progress {
        device: String,
        progress: InstallProgress,
    },
    /// Sent on every accepted lifecycle transition.
    State {
        device: String,
        state: WorkerState,
    },
    Finished {
        result: WorkerResult,
    },
}

/// Turns install output into progress values, tagging each as measured or estimated.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last: Option<u8>,
}

impl ProgressTracker {
    pub fn start(&mut self) -> InstallProgress {
        self.last = Some(0);
        InstallProgress::Estimated(0)
    }

    pub fn observe(&mut self, line: &str) -> Option<InstallProgress> {
        if let Some(percent) = parse_progress_percent(line) {
            if self.last == Some(percent) {
                return None;
            }
            self.last = Some(percent);
            return Some(InstallProgress::Exact(percent));
        }
        let current = self.last.unwrap_or(0);
        if current >= ESTIMATE_CAP {
            return None;
        }
        let next = current.saturating_add(ESTIMATE_STEP).min(ESTIMATE_CAP);
        self.last = Some(next);
        Some(InstallProgress::Estimated(next))
    }

    pub fn complete(&mut self) -> InstallProgress {
        self.last = Some(100);
        InstallProgress::Exact(100)
    }
}

enum StageEnd {
    Exited(Option<i32>),
    Cancelled,
    TimedOut,
    Unavailable(AppError),
}

struct StageOutcome {
    end: StageEnd,
    tail: VecDeque<String>,
    reported_failure: bool,
}

/// Guarantees one `Finished` message even if the worker unwinds.
struct Reporter<'a> {
    sink: &'a Sender<WorkerMessage>,
    device: String,
    command: String,
    started: Instant,
    sent: bool,
}

impl Reporter<'_> {
    fn finish(&mut self, result: WorkerResult) {
        self.sent = true;
        let _ = self.sink.send(WorkerMessage::Finished { result });
    }
}

impl Drop for Reporter<'_> {
    fn drop(&mut self) {
        if self.sent {
            return;
        }
        let result = WorkerResult::failed(
            &self.device,
            &self.command,
            WorkerOutcome::Failed,
            self.started.elapsed().as_secs_f64(),
            ERR_SYSTEM,
            "Worker stopped unexpectedly",
        );
        let _ = self.sink.send(WorkerMessage::Finished { result });
    }
}

pub struct CommandWorker {
    request: WorkerRequest,
    cancel: Arc<AtomicBool>,
    state: WorkerState,
}

impl CommandWorker {
    pub fn new(request: WorkerRequest) -> Self {
        Self::with_cancel_flag(request, Arc::new(AtomicBool::new(false)))
    }

    pub fn with_cancel_flag(request: WorkerRequest, cancel: Arc<AtomicBool>) -> Self {
        Self {
            request,
            cancel,
            state: WorkerState::Pending,
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn transition(&mut self, next: WorkerState, sink: &Sender<WorkerMessage>) {
        if self.state.can_transition_to(next) {
            self.state = next;
            let _ = sink.send(WorkerMessage::State {
                device: self.request.device.clone(),
                state: next,
            });
        } else {
            warn!(
                trace_id = %self.request.trace_id,
                device = %self.request.device,
                from = ?self.state,
                to = ?next,
                "ignored invalid worker transition"
            );
        }
    }

    /// Runs to a terminal state, streaming to `sink`. The returned result is also sent as
    /// the last message for this device.
    pub fn run(mut self, transport: &dyn Transport, sink: &Sender<WorkerMessage>) -> WorkerResult {
        let mut reporter = Reporter {
            sink,
            device: self.request.device.clone(),
            command: self.request.command.clone(),
            started: Instant::now(),
            sent: false,
        };

        let result = match self.prepare() {
            Err(err) => {
                info!(
                    trace_id = %self.request.trace_id,
                    device = %self.request.device,
                    code = %err.code,
                    "worker rejected command"
                );
                self.transition(WorkerState::Failed, sink);
                self.fail(WorkerOutcome::Failed, 0.0, &err.code, err.error)
            }
            Ok(plan) => {
                self.transition(WorkerState::Running, sink);
                let result = self.execute(plan, transport, sink);
                self.transition(WorkerState::from(result.outcome), sink);
                result
            }
        };

        if result.outcome == WorkerOutcome::Cancelled {
            let _ = sink.send(WorkerMessage::Output {
                device: self.request.device.clone(),
                line: CANCELLED_LINE.to_string(),
            });
        }
        debug!(
            trace_id = %self.request.trace_id,
            device = %self.request.device,
            success = result.success,
            elapsed = result.elapsed_seconds,
            "worker finished"
        );
        reporter.finish(result.clone());
        result
    }

    /// Validation that must pass before any process is spawned.
    fn prepare(&self) -> Result<ParsedCommand, AppError> {
        let trace_id = &self.request.trace_id;
        let parsed = ParsedCommand::parse(&self.request.command, trace_id)?
            .with_reinstall(self.request.reinstall);
        match &parsed.verb {
            AdbVerb::Install { paths, .. } => {
                let Some(path) = paths.first() else {
                    return Err(AppError::apk_not_found("No APK path given", trace_id));
                };
                if paths.len() > 1 {
                    return Err(AppError::validation(
                        "install takes exactly one APK path",
                        trace_id,
                    ));
                }
                let local = crate::app::adb::command::normalize_apk_path(path);
                if !local.is_file() {
                    return Err(AppError::apk_not_found(
                        format!("APK file not found: {}", local.display()),
                        trace_id,
                    ));
                }
            }
            AdbVerb::Uninstall { packages, .. } => {
                if packages.is_empty() {
                    return Err(AppError::missing_package_name(
                        "uninstall requires a package name",
                        trace_id,
                    ));
                }
                if packages.len() > 1 {
                    return Err(AppError::validation(
                        "uninstall takes exactly one package name",
                        trace_id,
                    ));
                }
            }
            _ => {}
        }
        Ok(parsed)
    }

    fn execute(
        &self,
        parsed: ParsedCommand,
        transport: &dyn Transport,
        sink: &Sender<WorkerMessage>,
    ) -> WorkerResult {
        let deadline = if parsed.verb.is_unbounded() {
            None
        } else {
            self.request.timeout.map(|timeout| Instant::now() + timeout)
        };
        let started = Instant::now();

        let outcome = match &parsed.verb {
            AdbVerb::Install {
                paths,
                reinstall,
                flags,
            } if transport.kind() == TransportKind::Ssh => {
                let local = paths
                    .first()
                    .map(|path| crate::app::adb::command::normalize_apk_path(path))
                    .unwrap_or_default();
                self.remote_install(transport, &local, *reinstall, flags, deadline, sink)
            }
            AdbVerb::Install { .. } => {
                let mut tracker = ProgressTracker::default();
                self.send_progress(sink, tracker.start());
                let argv = parsed.build_argv(&self.request.device);
                let outcome = self.stream_stage(transport, &argv, deadline, sink, Some(&mut tracker));
                if stage_succeeded(&outcome) {
                    self.send_progress(sink, tracker.complete());
                }
                outcome
            }
            _ => {
                let argv = parsed.build_argv(&self.request.device);
                self.stream_stage(transport, &argv, deadline, sink, None)
            }
        };
        let elapsed = started.elapsed().as_secs_f64();
        self.result_from(outcome, elapsed)
    }

    /// Push to the device tmp dir, `pm install`, then remove the pushed file whatever happened.
    fn remote_install(
        &self,
        transport: &dyn Transport,
        local: &Path,
        reinstall: bool,
        flags: &[String],
        deadline: Option<Instant>,
        sink: &Sender<WorkerMessage>,
    ) -> StageOutcome {
        let plan = remote_install_plan(&self.request.device, local, reinstall, flags);
        let mut tracker = ProgressTracker::default();
        self.send_progress(sink, tracker.start());

        let pushed = self.stream_stage(transport, &plan.push, deadline, sink, Some(&mut tracker));
        if matches!(pushed.end, StageEnd::Unavailable(_)) {
            return pushed;
        }
        let outcome = if stage_succeeded(&pushed) {
            let installed =
                self.stream_stage(transport, &plan.install, deadline, sink, Some(&mut tracker));
            if stage_succeeded(&installed) {
                self.send_progress(sink, tracker.complete());
            }
            installed
        } else {
            pushed
        };

        self.cleanup_remote(transport, &plan.cleanup, &plan.remote_path);
        outcome
    }

    fn cleanup_remote(&self, transport: &dyn Transport, argv: &[String], remote_path: &str) {
        let trace_id = &self.request.trace_id;
        let cleaned = transport
            .execute(argv, trace_id)
            .and_then(|process| collect_output(process, CLEANUP_TIMEOUT, trace_id));
        match cleaned {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(
                trace_id = %trace_id,
                device = %self.request.device,
                remote_path,
                exit_code = ?output.exit_code,
                "remote cleanup failed"
            ),
            Err(err) => warn!(
                trace_id = %trace_id,
                device = %self.request.device,
                remote_path,
                error = %err.error,
                "remote cleanup failed"
            ),
        }
    }

    fn stream_stage(
        &self,
        transport: &dyn Transport,
        argv: &[String],
        deadline: Option<Instant>,
        sink: &Sender<WorkerMessage>,
        mut progress: Option<&mut ProgressTracker>,
    ) -> StageOutcome {
        let trace_id = &self.request.trace_id;
        let device = &self.request.device;
        let mut tail = VecDeque::with_capacity(MESSAGE_TAIL_LINES);
        let mut reported_failure = false;

        let mut process = match transport.execute(argv, trace_id) {
            Ok(process) => process,
            Err(err) => {
                warn!(trace_id = %trace_id, device = %device, code = %err.code, "failed to start command");
                return StageOutcome {
                    end: StageEnd::Unavailable(err),
                    tail,
                    reported_failure,
                };
            }
        };

        loop {
            let wait = match self.interrupt(process.as_mut(), deadline, POLL_INTERVAL) {
                Ok(wait) => wait,
                Err(end) => {
                    return StageOutcome {
                        end,
                        tail,
                        reported_failure,
                    }
                }
            };
            match process.read_line(wait) {
                LineRead::Line(line) => {
                    if let Some(tracker) = progress.as_deref_mut() {
                        if let Some(value) = tracker.observe(&line) {
                            self.send_progress(sink, value);
                        }
                        if line.trim_start().starts_with("Failure") {
                            reported_failure = true;
                        }
                    }
                    if !line.trim().is_empty() {
                        if tail.len() == MESSAGE_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.clone());
                    }
                    let _ = sink.send(WorkerMessage::Output {
                        device: device.clone(),
                        line,
                    });
                }
                LineRead::Idle => {}
                LineRead::Closed => break,
            }
        }

        // Output can close while the process lives on; keep honouring cancel and the deadline.
        while process.is_running() {
            match self.interrupt(process.as_mut(), deadline, EXIT_POLL) {
                Ok(wait) => thread::sleep(wait),
                Err(end) => {
                    return StageOutcome {
                        end,
                        tail,
                        reported_failure,
                    }
                }
            }
        }

        let end = match process.wait() {
            Ok(code) => StageEnd::Exited(code),
            Err(err) => StageEnd::Unavailable(err),
        };
        StageOutcome {
            end,
            tail,
            reported_failure,
        }
    }

    /// Kills the process when the worker was cancelled or the deadline passed; otherwise
    /// returns how long the caller may block, at most `slice`.
    fn interrupt(
        &self,
        process: &mut dyn RunningCommand,
        deadline: Option<Instant>,
        slice: Duration,
    ) -> Result<Duration, StageEnd> {
        let trace_id = &self.request.trace_id;
        let device = &self.request.device;
        if self.cancel.load(Ordering::SeqCst) {
            process.kill();
            info!(trace_id = %trace_id, device = %device, "worker cancelled");
            return Err(StageEnd::Cancelled);
        }
        let Some(deadline) = deadline else {
            return Ok(slice);
        };
        let now = Instant::now();
        if now >= deadline {
            process.kill();
            warn!(trace_id = %trace_id, device = %device, "command timed out");
            return Err(StageEnd::TimedOut);
        }
        Ok((deadline - now).min(slice))
    }

    fn result_from(&self, outcome: StageOutcome, elapsed: f64) -> WorkerResult {
        let printed = outcome.tail.iter().cloned().collect::<Vec<_>>().join("\n");
        match outcome.end {
            StageEnd::Exited(Some(0)) if !outcome.reported_failure => WorkerResult::succeeded(
                &self.request.device,
                &self.request.command,
                elapsed,
            ),
            StageEnd::Exited(code) => {
                let message = if printed.is_empty() {
                    match code {
                        Some(code) => format!("Process exited with code {code}"),
                        None => "Process terminated by signal".to_string(),
                    }
                } else {
                    printed
                };
                self.fail(WorkerOutcome::Failed, elapsed, ERR_PROCESS_FAILURE, message)
            }
            StageEnd::Cancelled => {
                self.fail(WorkerOutcome::Cancelled, elapsed, ERR_CANCELLED, CANCELLED_LINE)
            }
            StageEnd::TimedOut => {
                let secs = self.request.timeout.map(|t| t.as_secs()).unwrap_or_default();
                self.fail(
                    WorkerOutcome::Failed,
                    elapsed,
                    ERR_PROCESS_FAILURE,
                    format!("Timed out after {secs}s"),
                )
            }
            StageEnd::Unavailable(err) => {
                self.fail(WorkerOutcome::Failed, elapsed, &err.code, err.error)
            }
        }
    }

    fn fail(
        &self,
        outcome: WorkerOutcome,
        elapsed: f64,
        code: &str,
        message: impl Into<String>,
    ) -> WorkerResult {
        WorkerResult::failed(
            &self.request.device,
            &self.request.command,
            outcome,
            elapsed,
            code,
            message,
        )
    }

    fn send_progress(&self, sink: &Sender<WorkerMessage>, progress: InstallProgress) {
        let _ = sink.send(WorkerMessage::Progress {
            device: self.request.device.clone(),
            progress,
        });
    }
}

fn stage_succeeded(outcome: &StageOutcome) -> bool {
    matches!(outcome.end, StageEnd::Exited(Some(0))) && !outcome.reported_failure
}
