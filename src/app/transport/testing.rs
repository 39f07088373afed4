use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::app::adb::runner::{LineRead, RunningCommand};
use crate::app::error::AppError;

use super::{Transport, TransportKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tail {
    Exit(i32),
    /// Keeps producing lines until killed.
    Endless,
    /// Produces nothing and never exits until killed.
    Hang,
    /// Closes its output after the scripted lines but keeps running until killed.
    Detached,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub lines: Vec<String>,
    pub tail: Tail,
    pub line_delay: Duration,
    pub unavailable: bool,
}

impl Script {
    pub fn exit(code: i32, lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|line| line.to_string()).collect(),
            tail: Tail::Exit(code),
            line_delay: Duration::ZERO,
            unavailable: false,
        }
    }

    pub fn endless() -> Self {
        Self {
            lines: Vec::new(),
            tail: Tail::Endless,
            line_delay: Duration::from_millis(5),
            unavailable: false,
        }
    }

    pub fn hang() -> Self {
        Self {
            tail: Tail::Hang,
            ..Self::endless()
        }
    }

    pub fn detached(lines: &[&str]) -> Self {
        Self {
            tail: Tail::Detached,
            ..Self::exit(0, lines)
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::exit(0, &[])
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.line_delay = delay;
        self
    }
}

/// Observable state of one scripted process.
#[derive(Debug)]
pub struct Launch {
    pub device: String,
    pub argv: Vec<String>,
    killed: AtomicBool,
    exited: AtomicBool,
}

impl Launch {
    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> bool {
        !self.killed() && !self.exited.load(Ordering::SeqCst)
    }
}

/// Records every call and replays canned output per device. A rule whose needle appears in
/// the joined argv wins over the per-device script.
pub struct ScriptedTransport {
    kind: TransportKind,
    default_script: Script,
    by_device: Mutex<HashMap<String, Script>>,
    by_needle: Mutex<Vec<(String, Script)>>,
    calls: Mutex<Vec<Vec<String>>>,
    launches: Mutex<Vec<Arc<Launch>>>,
}

impl ScriptedTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            default_script: Script::exit(0, &[]),
            by_device: Mutex::new(HashMap::new()),
            by_needle: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn local() -> Self {
        Self::new(TransportKind::Local)
    }

    pub fn ssh() -> Self {
        Self::new(TransportKind::Ssh)
    }

    pub fn with_device(self, device: &str, script: Script) -> Self {
        self.by_device
            .lock()
            .unwrap()
            .insert(device.to_string(), script);
        self
    }

    pub fn with_rule(self, needle: &str, script: Script) -> Self {
        self.by_needle
            .lock()
            .unwrap()
            .push((needle.to_string(), script));
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn launches(&self) -> Vec<Arc<Launch>> {
        self.launches.lock().unwrap().clone()
    }

    pub fn launches_for(&self, device: &str) -> Vec<Arc<Launch>> {
        self.launches()
            .into_iter()
            .filter(|launch| launch.device == device)
            .collect()
    }

    fn script_for(&self, device: &str, argv: &[String]) -> Script {
        let joined = argv.join(" ");
        if let Some((_, script)) = self
            .by_needle
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| joined.contains(needle.as_str()))
        {
            return script.clone();
        }
        self.by_device
            .lock()
            .unwrap()
            .get(device)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }
}

/// Device an argv targets: the value after `-s`, the target of connect/disconnect, or the
/// first token.
pub fn target_device(argv: &[String]) -> String {
    if let Some(index) = argv.iter().position(|arg| arg == "-s") {
        if let Some(device) = argv.get(index + 1) {
            return device.clone();
        }
    }
    match argv.first().map(String::as_str) {
        Some("connect") | Some("disconnect") => argv.get(1).cloned().unwrap_or_default(),
        Some(first) => first.to_string(),
        None => String::new(),
    }
}

impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }

    fn execute(
        &self,
        args: &[String],
        trace_id: &str,
    ) -> Result<Box<dyn RunningCommand>, AppError> {
        self.calls.lock().unwrap().push(args.to_vec());
        let device = target_device(args);
        let script = self.script_for(&device, args);
        if script.unavailable {
            return Err(AppError::transport_unavailable(
                "adb executable not found",
                trace_id,
            ));
        }
        let launch = Arc::new(Launch {
            device,
            argv: args.to_vec(),
            killed: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        });
        self.launches.lock().unwrap().push(launch.clone());
        Ok(Box::new(ScriptedCommand {
            pending: script.lines.into_iter().collect(),
            tail: script.tail,
            line_delay: script.line_delay,
            counter: 0,
            launch,
        }))
    }
}

struct ScriptedCommand {
    pending: VecDeque<String>,
    tail: Tail,
    line_delay: Duration,
    counter: usize,
    launch: Arc<Launch>,
}

impl RunningCommand for ScriptedCommand {
    fn read_line(&mut self, wait: Duration) -> LineRead {
        if self.launch.killed() {
            return LineRead::Closed;
        }
        if !self.line_delay.is_zero() {
            thread::sleep(self.line_delay.min(wait));
        }
        if let Some(line) = self.pending.pop_front() {
            return LineRead::Line(line);
        }
        match self.tail {
            Tail::Exit(_) => {
                self.launch.exited.store(true, Ordering::SeqCst);
                LineRead::Closed
            }
            Tail::Detached => {
                thread::sleep(wait.min(Duration::from_millis(5)));
                LineRead::Closed
            }
            Tail::Endless => {
                self.counter += 1;
                LineRead::Line(format!("line {}", self.counter))
            }
            Tail::Hang => {
                if self.line_delay.is_zero() {
                    thread::sleep(wait.min(Duration::from_millis(20)));
                }
                LineRead::Idle
            }
        }
    }

    fn wait(&mut self) -> Result<Option<i32>, AppError> {
        if matches!(self.tail, Tail::Detached) {
            while !self.launch.killed() {
                thread::sleep(Duration::from_millis(5));
            }
        }
        if self.launch.killed() {
            return Ok(None);
        }
        self.launch.exited.store(true, Ordering::SeqCst);
        match self.tail {
            Tail::Exit(code) => Ok(Some(code)),
            Tail::Endless | Tail::Hang | Tail::Detached => Ok(None),
        }
    }

    fn kill(&mut self) {
        self.launch.killed.store(true, Ordering::SeqCst);
    }

    fn is_running(&mut self) -> bool {
        self.launch.running()
    }
}

impl Drop for ScriptedCommand {
    fn drop(&mut self) {
        self.launch.exited.store(true, Ordering::SeqCst);
    }
}
