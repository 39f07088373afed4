use tracing::warn;

use crate::app::adb::locator::{locate_adb, resolve_adb_program};
use crate::app::adb::runner::{spawn_streaming, RunningCommand};
use crate::app::error::AppError;

use super::{Transport, TransportKind};

/// Runs the adb binary on this machine.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    program: String,
}

impl LocalTransport {
    /// `configured` is the user's adb path setting; blank means `adb` on PATH.
    pub fn new(configured: &str) -> Self {
        Self {
            program: resolve_adb_program(configured),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new("")
    }
}

impl Transport for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    fn describe(&self) -> String {
        format!("local:{}", self.program)
    }

    fn execute(
        &self,
        args: &[String],
        trace_id: &str,
    ) -> Result<Box<dyn RunningCommand>, AppError> {
        let path = locate_adb(&self.program).map_err(|message| {
            warn!(trace_id = %trace_id, program = %self.program, "adb not available");
            AppError::transport_unavailable(message, trace_id)
        })?;
        let process = spawn_streaming(&path.to_string_lossy(), args, trace_id)?;
        Ok(Box::new(process))
    }
}
