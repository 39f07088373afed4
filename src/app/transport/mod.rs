//! Uniform execution contract over the local adb binary and adb reached through SSH.

pub mod local;
pub mod ssh;
#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};

use crate::app::error::AppError;

pub use crate::app::adb::runner::{LineRead, RunningCommand};
pub use local::LocalTransport;
pub use ssh::SshTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Local,
    Ssh,
}

pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Short label used in logs, e.g. `local:adb` or `ssh:lab@10.0.0.5:22`.
    fn describe(&self) -> String;

    /// Starts `adb <args...>` and returns as soon as the process is running. `args` never
    /// includes the adb program itself.
    fn execute(&self, args: &[String], trace_id: &str)
        -> Result<Box<dyn RunningCommand>, AppError>;
}
