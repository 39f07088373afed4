use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Connection state reported by `adb devices`. Only `device` counts as connected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceStatus {
    Device,
    Offline,
    Unauthorized,
    Other(String),
}

impl DeviceStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, DeviceStatus::Device)
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeviceStatus::Device => "device",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unauthorized => "unauthorized",
            DeviceStatus::Other(value) => value.as_str(),
        }
    }

    pub fn color(&self) -> &'static str {
        if self.is_connected() {
            "green"
        } else {
            "red"
        }
    }
}

impl From<String> for DeviceStatus {
    fn from(value: String) -> Self {
        match value.trim() {
            "device" => DeviceStatus::Device,
            "offline" => DeviceStatus::Offline,
            "unauthorized" => DeviceStatus::Unauthorized,
            other => DeviceStatus::Other(other.to_string()),
        }
    }
}

impl From<&str> for DeviceStatus {
    fn from(value: &str) -> Self {
        DeviceStatus::from(value.to_string())
    }
}

impl From<DeviceStatus> for String {
    fn from(value: DeviceStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One probe snapshot: devices in the order adb listed them plus their status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeResult {
    pub devices: Vec<String>,
    pub statuses: HashMap<String, DeviceStatus>,
}

impl ProbeResult {
    pub fn status_of(&self, device: &str) -> DeviceStatus {
        self.statuses
            .get(device)
            .cloned()
            .unwrap_or(DeviceStatus::Offline)
    }

    pub fn connected(&self) -> Vec<String> {
        self.devices
            .iter()
            .filter(|device| self.status_of(device).is_connected())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshConnection {
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub hostkey: String,
    #[serde(default = "default_verify_host_key")]
    pub verify_host_key: bool,
}

pub fn default_ssh_port() -> u16 {
    22
}

pub fn default_ssh_user() -> String {
    "Administrator".to_string()
}

fn default_verify_host_key() -> bool {
    true
}

impl SshConnection {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            host: host.into(),
            port: default_ssh_port(),
            user: user.into(),
            password: String::new(),
            hostkey: String::new(),
            verify_host_key: true,
        }
    }

    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            format!("{}@{}:{}", self.user, self.host, self.port)
        } else {
            self.name.trim().to_string()
        }
    }
}

/// Install progress. `Estimated` values are fabricated from line counts and must not be
/// presented as measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "percent", rename_all = "snake_case")]
pub enum InstallProgress {
    Exact(u8),
    Estimated(u8),
}

impl InstallProgress {
    pub fn percent(&self) -> u8 {
        match self {
            InstallProgress::Exact(value) | InstallProgress::Estimated(value) => *value,
        }
    }

    pub fn is_estimated(&self) -> bool {
        matches!(self, InstallProgress::Estimated(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// Terminal report of one worker. Produced exactly once per started worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerResult {
    pub device: String,
    pub command: String,
    pub success: bool,
    pub outcome: WorkerOutcome,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WorkerResult {
    pub fn succeeded(device: &str, command: &str, elapsed_seconds: f64) -> Self {
        Self {
            device: device.to_string(),
            command: command.to_string(),
            success: true,
            outcome: WorkerOutcome::Succeeded,
            elapsed_seconds,
            error_code: None,
            message: None,
        }
    }

    pub fn failed(
        device: &str,
        command: &str,
        outcome: WorkerOutcome,
        elapsed_seconds: f64,
        error_code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.to_string(),
            command: command.to_string(),
            success: false,
            outcome,
            elapsed_seconds,
            error_code: Some(error_code.to_string()),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogTone {
    Success,
    Failure,
}

impl LogTone {
    pub fn color(&self) -> &'static str {
        match self {
            LogTone::Success => "green",
            LogTone::Failure => "red",
        }
    }
}

/// Summary line appended to the shared log when a device finishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    pub text: String,
    pub tone: LogTone,
}

impl LogLine {
    pub fn for_result(result: &WorkerResult) -> Self {
        let text = match result.outcome {
            WorkerOutcome::Succeeded => format!(
                "[{}] {}: succeeded in {:.2}s",
                result.device, result.command, result.elapsed_seconds
            ),
            WorkerOutcome::Cancelled => format!(
                "[{}] {}: cancelled after {:.2}s",
                result.device, result.command, result.elapsed_seconds
            ),
            WorkerOutcome::Failed => match result.message.as_deref() {
                Some(message) if !message.trim().is_empty() => format!(
                    "[{}] {}: failed in {:.2}s ({})",
                    result.device,
                    result.command,
                    result.elapsed_seconds,
                    message.trim()
                ),
                _ => format!(
                    "[{}] {}: failed in {:.2}s",
                    result.device, result.command, result.elapsed_seconds
                ),
            },
        };
        let tone = if result.success {
            LogTone::Success
        } else {
            LogTone::Failure
        };
        Self { text, tone }
    }
}

/// Aggregate of one finished job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobReport {
    pub job_id: String,
    pub command: String,
    pub total: usize,
    pub completed: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub results: Vec<WorkerResult>,
    pub total_duration_seconds: f64,
}

impl JobReport {
    pub fn result_for(&self, device: &str) -> Option<&WorkerResult> {
        self.results.iter().find(|result| result.device == device)
    }
}
