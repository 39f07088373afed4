use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::app::error::AppError;

const READ_SLICE: Duration = Duration::from_millis(200);
/// How often a process whose output has closed is checked for exit.
pub const EXIT_POLL: Duration = Duration::from_millis(20);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Result of polling a running command for its next output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    Line(String),
    Idle,
    Closed,
}

/// A started command whose merged stdout/stderr is delivered line by line.
pub trait RunningCommand: Send {
    /// Waits at most `wait` for the next line.
    fn read_line(&mut self, wait: Duration) -> LineRead;
    /// Blocks until the process exits. `None` when it was killed by a signal.
    fn wait(&mut self) -> Result<Option<i32>, AppError>;
    fn kill(&mut self);
    fn is_running(&mut self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub lines: Vec<String>,
    pub exit_code: Option<i32>,
}

impl CapturedOutput {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub struct StreamingProcess {
    child: Child,
    lines: Receiver<String>,
    readers: Vec<JoinHandle<()>>,
    trace_id: String,
    exited: bool,
}

/// Spawns `program` with stdout and stderr merged into one line channel. Never opens a
/// console window on Windows.
pub fn spawn_streaming(
    program: &str,
    args: &[String],
    trace_id: &str,
) -> Result<StreamingProcess, AppError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = command.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            AppError::transport_unavailable(format!("{program} not found: {err}"), trace_id)
        } else {
            AppError::system(format!("Failed to spawn {program}: {err}"), trace_id)
        }
    })?;
    debug!(trace_id = %trace_id, program = %program, args = ?args, pid = child.id(), "spawned process");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;

    let (tx, rx) = mpsc::channel::<String>();
    let readers = vec![
        spawn_line_reader(stdout, tx.clone(), trace_id.to_string(), "stdout"),
        spawn_line_reader(stderr, tx, trace_id.to_string(), "stderr"),
    ];

    Ok(StreamingProcess {
        child,
        lines: rx,
        readers,
        trace_id: trace_id.to_string(),
        exited: false,
    })
}

fn spawn_line_reader<R: Read + Send + 'static>(
    source: R,
    tx: Sender<String>,
    trace_id: String,
    stream: &'static str,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buffer = Vec::<u8>::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(decode_line(&buffer)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(trace_id = %trace_id, stream, error = %err, "failed to read process output");
                    break;
                }
            }
        }
    })
}

impl RunningCommand for StreamingProcess {
    fn read_line(&mut self, wait: Duration) -> LineRead {
        match self.lines.recv_timeout(wait) {
            Ok(line) => LineRead::Line(line),
            Err(RecvTimeoutError::Timeout) => LineRead::Idle,
            Err(RecvTimeoutError::Disconnected) => LineRead::Closed,
        }
    }

    fn wait(&mut self) -> Result<Option<i32>, AppError> {
        let status = self.child.wait().map_err(|err| {
            AppError::system(format!("Failed to wait for process: {err}"), &self.trace_id)
        })?;
        self.exited = true;
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        Ok(status.code())
    }

    fn kill(&mut self) {
        if self.exited {
            return;
        }
        if let Err(err) = self.child.kill() {
            debug!(trace_id = %self.trace_id, error = %err, "kill on exited process");
        }
        let _ = self.child.wait();
        self.exited = true;
    }

    fn is_running(&mut self) -> bool {
        if self.exited {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for StreamingProcess {
    fn drop(&mut self) {
        if !self.exited {
            self.kill();
        }
    }
}

/// Drains a running command into memory, killing it when `timeout` elapses. The bound also
/// covers a process that closes its output but keeps running.
pub fn collect_output(
    mut process: Box<dyn RunningCommand>,
    timeout: Duration,
    trace_id: &str,
) -> Result<CapturedOutput, AppError> {
    let start = Instant::now();
    let mut lines = Vec::new();
    loop {
        let Some(remaining) = remaining_time(start, timeout) else {
            return Err(timed_out(process.as_mut(), timeout, trace_id));
        };
        match process.read_line(remaining.min(READ_SLICE)) {
            LineRead::Line(line) => lines.push(line),
            LineRead::Idle => {}
            LineRead::Closed => break,
        }
    }
    while process.is_running() {
        let Some(remaining) = remaining_time(start, timeout) else {
            return Err(timed_out(process.as_mut(), timeout, trace_id));
        };
        thread::sleep(remaining.min(EXIT_POLL));
    }
    let exit_code = process.wait()?;
    Ok(CapturedOutput { lines, exit_code })
}

fn remaining_time(start: Instant, timeout: Duration) -> Option<Duration> {
    timeout
        .checked_sub(start.elapsed())
        .filter(|remaining| !remaining.is_zero())
}

fn timed_out(process: &mut dyn RunningCommand, timeout: Duration, trace_id: &str) -> AppError {
    process.kill();
    AppError::process_failure(
        format!("Command timed out after {}s", timeout.as_secs()),
        trace_id,
    )
}

/// Decodes one raw output line without ever failing: strips line endings and a UTF-8 BOM,
/// recognises UTF-16LE output (Windows tools), otherwise replaces invalid UTF-8 sequences.
pub fn decode_line(raw: &[u8]) -> String {
    let mut bytes = raw;
    while let Some((last, rest)) = bytes.split_last() {
        if *last == b'\n' || *last == b'\r' {
            bytes = rest;
        } else {
            break;
        }
    }
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        bytes = rest;
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }
    if looks_like_utf16le(bytes) {
        let body = bytes.strip_prefix(&[0xFF, 0xFE]).unwrap_or(bytes);
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units)
            .trim_end_matches(['\r', '\n', '\0'])
            .to_string();
    }
    String::from_utf8_lossy(bytes).to_string()
}

fn looks_like_utf16le(bytes: &[u8]) -> bool {
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return true;
    }
    if bytes.len() < 4 {
        return false;
    }
    let pairs = bytes.len() / 2;
    let zero_high = bytes.chunks_exact(2).filter(|pair| pair[1] == 0).count();
    zero_high * 10 >= pairs * 8
}
