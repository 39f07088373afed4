use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::adb::runner::{LineRead, RunningCommand, EXIT_POLL};
use crate::app::config::DispatchSettings;
use crate::app::error::AppError;
use crate::app::transport::Transport;

const BATCH_LIMIT: usize = 50;
const BATCH_DELAY: Duration = Duration::from_millis(60);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Logcat priority; the session shows this level and above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LogLevel {
    #[default]
    V,
    D,
    I,
    W,
    E,
    F,
}

impl LogLevel {
    pub fn letter(self) -> &'static str {
        match self {
            LogLevel::V => "V",
            LogLevel::D => "D",
            LogLevel::I => "I",
            LogLevel::W => "W",
            LogLevel::E => "E",
            LogLevel::F => "F",
        }
    }

    pub fn filter_spec(self) -> String {
        format!("*:{}", self.letter())
    }

    pub fn parse(value: &str, trace_id: &str) -> Result<Self, AppError> {
        value.parse().map_err(|_| {
            AppError::validation(
                format!("Unknown logcat level '{}': expected one of V, D, I, W, E, F", value.trim()),
                trace_id,
            )
        })
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "V" | "VERBOSE" => Ok(LogLevel::V),
            "D" | "DEBUG" => Ok(LogLevel::D),
            "I" | "INFO" => Ok(LogLevel::I),
            "W" | "WARN" | "WARNING" => Ok(LogLevel::W),
            "E" | "ERROR" => Ok(LogLevel::E),
            "F" | "FATAL" => Ok(LogLevel::F),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogcatOptions {
    pub level: LogLevel,
    /// Write raw lines here instead of emitting them.
    pub output_file: Option<PathBuf>,
}

impl LogcatOptions {
    pub fn from_settings(settings: &DispatchSettings, trace_id: &str) -> Result<Self, AppError> {
        Ok(Self {
            level: LogLevel::parse(&settings.logcat_level, trace_id)?,
            output_file: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogcatFinish {
    Stopped,
    Exited { code: Option<i32> },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogcatEvent {
    Started {
        device: String,
        session_id: String,
        trace_id: String,
    },
    Lines {
        device: String,
        lines: Vec<String>,
        trace_id: String,
    },
    Finished {
        device: String,
        session_id: String,
        reason: LogcatFinish,
        trace_id: String,
    },
}

pub type LogcatEmitter = Arc<dyn Fn(LogcatEvent) + Send + Sync>;

struct LogcatSession {
    session_id: String,
    trace_id: String,
    stop_flag: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Owns the device -> session map. Session threads never touch it; they report their end
/// on a channel that is drained before every map access.
pub struct LogcatManager {
    transport: Arc<dyn Transport>,
    sessions: HashMap<String, LogcatSession>,
    ended_tx: Sender<(String, String)>,
    ended_rx: Receiver<(String, String)>,
}

impl LogcatManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (ended_tx, ended_rx) = mpsc::channel();
        Self {
            transport,
            sessions: HashMap::new(),
            ended_tx,
            ended_rx,
        }
    }

    /// Returns `Ok(false)` without spawning anything when `device` already has a session.
    pub fn start(
        &mut self,
        device: &str,
        options: LogcatOptions,
        emitter: LogcatEmitter,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        self.reap();
        let device = device.trim().to_string();
        if device.is_empty() {
            return Err(AppError::validation("device is required", trace_id));
        }
        if self.sessions.contains_key(&device) {
            info!(trace_id = %trace_id, device = %device, "logcat already running");
            return Ok(false);
        }

        let args = vec![
            "-s".to_string(),
            device.clone(),
            "logcat".to_string(),
            options.level.filter_spec(),
        ];
        let mut process = self.transport.execute(&args, trace_id)?;

        // Truncate the output file only once the process is up.
        let sink = match &options.output_file {
            Some(path) => match File::create(path) {
                Ok(file) => LineSink::File(BufWriter::new(file)),
                Err(err) => {
                    process.kill();
                    return Err(AppError::system(
                        format!("Failed to open logcat file {}: {err}", path.display()),
                        trace_id,
                    ));
                }
            },
            None => LineSink::Emit(Vec::new()),
        };

        let session_id = Uuid::new_v4().to_string();
        let stop_flag = Arc::new(AtomicBool::new(false));

        let runner = SessionRunner {
            device: device.clone(),
            session_id: session_id.clone(),
            trace_id: trace_id.to_string(),
            stop_flag: Arc::clone(&stop_flag),
            emitter,
            ended_tx: self.ended_tx.clone(),
        };
        let join = thread::Builder::new()
            .name(format!("logcat-{device}"))
            .spawn(move || runner.run(process, sink))
            .map_err(|err| {
                AppError::system(format!("Failed to start logcat thread: {err}"), trace_id)
            })?;

        info!(trace_id = %trace_id, device = %device, level = options.level.letter(), "logcat started");
        self.sessions.insert(
            device,
            LogcatSession {
                session_id,
                trace_id: trace_id.to_string(),
                stop_flag,
                join,
            },
        );
        Ok(true)
    }

    /// Kills the session's process and waits for its `Finished` event. `Ok(false)` when no
    /// session was running.
    pub fn stop(&mut self, device: &str, trace_id: &str) -> Result<bool, AppError> {
        self.reap();
        let Some(session) = self.sessions.remove(device.trim()) else {
            return Ok(false);
        };
        info!(
            trace_id = %trace_id,
            session_trace_id = %session.trace_id,
            device = %device.trim(),
            "stopping logcat"
        );
        session.stop_flag.store(true, Ordering::Relaxed);
        session
            .join
            .join()
            .map_err(|_| AppError::system("Logcat session panicked", trace_id))?;
        Ok(true)
    }

    /// Stops every session, each under the trace id it was started with.
    pub fn stop_all(&mut self) {
        let sessions: Vec<(String, String)> = self
            .sessions
            .iter()
            .map(|(device, session)| (device.clone(), session.trace_id.clone()))
            .collect();
        for (device, trace_id) in sessions {
            if let Err(err) = self.stop(&device, &trace_id) {
                warn!(trace_id = %trace_id, device = %device, error = %err.error, "failed to stop logcat");
            }
        }
    }

    pub fn is_active(&mut self, device: &str) -> bool {
        self.reap();
        self.sessions.contains_key(device.trim())
    }

    pub fn active_devices(&mut self) -> Vec<String> {
        self.reap();
        let mut devices: Vec<String> = self.sessions.keys().cloned().collect();
        devices.sort();
        devices
    }

    /// Drops sessions whose process ended on its own.
    fn reap(&mut self) {
        while let Ok((device, session_id)) = self.ended_rx.try_recv() {
            let matches = self
                .sessions
                .get(&device)
                .is_some_and(|session| session.session_id == session_id);
            if matches {
                if let Some(session) = self.sessions.remove(&device) {
                    let _ = session.join.join();
                }
            }
        }
    }
}

impl Drop for LogcatManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

enum LineSink {
    Emit(Vec<String>),
    File(BufWriter<File>),
}

struct SessionRunner {
    device: String,
    session_id: String,
    trace_id: String,
    stop_flag: Arc<AtomicBool>,
    emitter: LogcatEmitter,
    ended_tx: Sender<(String, String)>,
}

impl SessionRunner {
    fn run(self, mut process: Box<dyn RunningCommand>, mut sink: LineSink) {
        (self.emitter)(LogcatEvent::Started {
            device: self.device.clone(),
            session_id: self.session_id.clone(),
            trace_id: self.trace_id.clone(),
        });
        let mut last_emit = Instant::now();
        let reason = loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                process.kill();
                break LogcatFinish::Stopped;
            }
            match process.read_line(POLL_INTERVAL) {
                LineRead::Line(line) => match &mut sink {
                    LineSink::File(writer) => {
                        if let Err(err) = writeln!(writer, "{line}") {
                            warn!(trace_id = %self.trace_id, device = %self.device, error = %err, "failed to write logcat file");
                            process.kill();
                            break LogcatFinish::Failed {
                                error: err.to_string(),
                            };
                        }
                    }
                    LineSink::Emit(pending) => {
                        pending.push(line);
                        if pending.len() >= BATCH_LIMIT || last_emit.elapsed() >= BATCH_DELAY {
                            self.flush(pending);
                            last_emit = Instant::now();
                        }
                    }
                },
                LineRead::Idle => {
                    if let LineSink::Emit(pending) = &mut sink {
                        self.flush(pending);
                        last_emit = Instant::now();
                    }
                }
                LineRead::Closed => {
                    // Output closed early; the stop flag is checked again at the top.
                    if process.is_running() {
                        thread::sleep(EXIT_POLL);
                        continue;
                    }
                    let code = match process.wait() {
                        Ok(code) => code,
                        Err(err) => {
                            break LogcatFinish::Failed { error: err.error };
                        }
                    };
                    break LogcatFinish::Exited { code };
                }
            }
        };

        match &mut sink {
            LineSink::Emit(pending) => self.flush(pending),
            LineSink::File(writer) => {
                if let Err(err) = writer.flush() {
                    warn!(trace_id = %self.trace_id, device = %self.device, error = %err, "failed to flush logcat file");
                }
            }
        }
        info!(trace_id = %self.trace_id, device = %self.device, reason = ?reason, "logcat finished");
        (self.emitter)(LogcatEvent::Finished {
            device: self.device.clone(),
            session_id: self.session_id.clone(),
            reason,
            trace_id: self.trace_id.clone(),
        });
        let _ = self.ended_tx.send((self.device, self.session_id));
    }

    fn flush(&self, pending: &mut Vec<String>) {
        if pending.is_empty() {
            return;
        }
        (self.emitter)(LogcatEvent::Lines {
            device: self.device.clone(),
            lines: std::mem::take(pending),
            trace_id: self.trace_id.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::error::ERR_VALIDATION;
    use crate::app::transport::testing::{Script, ScriptedTransport};

    fn recorder() -> (LogcatEmitter, Receiver<LogcatEvent>) {
        let (tx, rx) = mpsc::channel();
        let emitter: LogcatEmitter = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (emitter, rx)
    }

    fn finished_count(events: &[LogcatEvent]) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, LogcatEvent::Finished { .. }))
            .count()
    }

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!(LogLevel::parse("w", "t").unwrap(), LogLevel::W);
        assert_eq!(LogLevel::parse(" Error ", "t").unwrap(), LogLevel::E);
        assert_eq!(LogLevel::F.filter_spec(), "*:F");
        let err = LogLevel::parse("loud", "t").unwrap_err();
        assert_eq!(err.code, ERR_VALIDATION);
    }

    #[test]
    fn second_start_is_a_no_op() {
        let transport = Arc::new(ScriptedTransport::local().with_device("A", Script::endless()));
        let mut manager = LogcatManager::new(transport.clone());
        let (emitter, _rx) = recorder();

        assert!(manager
            .start("A", LogcatOptions::default(), emitter.clone(), "t")
            .unwrap());
        assert!(!manager
            .start("A", LogcatOptions::default(), emitter, "t")
            .unwrap());
        assert_eq!(manager.active_devices(), vec!["A"]);
        assert_eq!(transport.call_count(), 1);
        assert_eq!(transport.calls()[0], ["-s", "A", "logcat", "*:V"]);
        manager.stop_all();
    }

    #[test]
    fn stop_kills_process_and_finishes_once() {
        let transport = Arc::new(ScriptedTransport::local().with_device("A", Script::endless()));
        let mut manager = LogcatManager::new(transport.clone());
        let (emitter, rx) = recorder();
        let options = LogcatOptions {
            level: LogLevel::W,
            output_file: None,
        };
        manager.start("A", options, emitter, "t").unwrap();
        thread::sleep(Duration::from_millis(150));

        assert!(manager.stop("A", "trace-stop").unwrap());
        assert!(!manager.stop("A", "trace-stop").unwrap());
        assert!(!manager.is_active("A"));
        assert!(transport.launches_for("A")[0].killed());

        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(events.first(), Some(LogcatEvent::Started { .. })));
        assert!(events
            .iter()
            .any(|event| matches!(event, LogcatEvent::Lines { lines, .. } if !lines.is_empty())));
        assert_eq!(finished_count(&events), 1);
        assert!(matches!(
            events.last(),
            Some(LogcatEvent::Finished {
                reason: LogcatFinish::Stopped,
                ..
            })
        ));
    }

    #[test]
    fn file_mode_writes_lines_instead_of_emitting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("A.log");
        let transport = Arc::new(
            ScriptedTransport::local().with_device("A", Script::exit(0, &["first", "second"])),
        );
        let mut manager = LogcatManager::new(transport);
        let (emitter, rx) = recorder();
        let options = LogcatOptions {
            level: LogLevel::I,
            output_file: Some(path.clone()),
        };
        manager.start("A", options, emitter, "t").unwrap();

        let finished = loop {
            match rx.recv_timeout(Duration::from_secs(5)).expect("finished event") {
                event @ LogcatEvent::Finished { .. } => break event,
                LogcatEvent::Lines { .. } => panic!("file mode must not emit lines"),
                LogcatEvent::Started { .. } => {}
            }
        };
        assert!(matches!(
            finished,
            LogcatEvent::Finished {
                reason: LogcatFinish::Exited { code: Some(0) },
                ..
            }
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn ended_session_is_reaped_and_can_restart() {
        let transport = Arc::new(ScriptedTransport::local().with_device("A", Script::exit(1, &[])));
        let mut manager = LogcatManager::new(transport.clone());
        let (emitter, rx) = recorder();
        manager
            .start("A", LogcatOptions::default(), emitter.clone(), "t")
            .unwrap();
        loop {
            if let LogcatEvent::Finished { .. } = rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                break;
            }
        }
        // The ended notice is sent right after the Finished event.
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.is_active("A") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!manager.is_active("A"));
        assert!(manager
            .start("A", LogcatOptions::default(), emitter, "t")
            .unwrap());
        assert_eq!(transport.call_count(), 2);
    }

    #[test]
    fn unavailable_transport_leaves_no_session() {
        let transport = Arc::new(ScriptedTransport::local().with_device("A", Script::unavailable()));
        let mut manager = LogcatManager::new(transport);
        let (emitter, _rx) = recorder();
        let err = manager
            .start("A", LogcatOptions::default(), emitter, "t")
            .unwrap_err();
        assert_eq!(err.code, crate::app::error::ERR_TRANSPORT_UNAVAILABLE);
        assert!(manager.active_devices().is_empty());
    }

    #[test]
    fn failed_start_keeps_existing_log_and_emits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("A.log");
        std::fs::write(&path, "previous capture\n").unwrap();
        let transport = Arc::new(ScriptedTransport::local().with_device("A", Script::unavailable()));
        let mut manager = LogcatManager::new(transport);
        let (emitter, rx) = recorder();
        let options = LogcatOptions {
            level: LogLevel::D,
            output_file: Some(path.clone()),
        };
        assert!(manager.start("A", options, emitter, "t").is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "previous capture\n");
        assert!(rx.try_iter().next().is_none());
    }

    #[test]
    fn unwritable_output_file_kills_started_process() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::local().with_device("A", Script::endless()));
        let mut manager = LogcatManager::new(transport.clone());
        let (emitter, rx) = recorder();
        let options = LogcatOptions {
            level: LogLevel::V,
            output_file: Some(dir.path().join("missing-dir").join("A.log")),
        };
        let err = manager.start("A", options, emitter, "trace-file").unwrap_err();
        assert_eq!(err.trace_id, "trace-file");
        assert!(transport.launches_for("A")[0].killed());
        assert!(manager.active_devices().is_empty());
        assert!(rx.try_iter().next().is_none());
    }

    #[test]
    fn stop_returns_when_output_closed_but_process_lives() {
        let transport =
            Arc::new(ScriptedTransport::local().with_device("A", Script::detached(&["boot"])));
        let mut manager = LogcatManager::new(transport.clone());
        let (emitter, rx) = recorder();
        manager.start("A", LogcatOptions::default(), emitter, "t").unwrap();
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        assert!(manager.stop("A", "trace-stop").unwrap());
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(transport.launches_for("A")[0].killed());
        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(
            events.last(),
            Some(LogcatEvent::Finished {
                reason: LogcatFinish::Stopped,
                ..
            })
        ));
    }

    #[test]
    fn settings_level_is_validated() {
        let mut settings = DispatchSettings::default();
        settings.logcat_level = "e".to_string();
        assert_eq!(
            LogcatOptions::from_settings(&settings, "t").unwrap().level,
            LogLevel::E
        );
        settings.logcat_level = "X".to_string();
        assert!(LogcatOptions::from_settings(&settings, "t").is_err());
    }
}
