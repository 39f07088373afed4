use std::path::PathBuf;

use tracing::{debug, warn};

use crate::app::adb::locator::{locate_plink, locate_ssh};
use crate::app::adb::runner::{spawn_streaming, RunningCommand};
use crate::app::error::AppError;
use crate::app::models::SshConnection;

use super::{Transport, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshClient {
    /// PuTTY `plink`, the only client here that accepts a password non-interactively.
    Plink,
    OpenSsh,
}

/// Client choice plus its full argument list, remote command last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshInvocation {
    pub client: SshClient,
    pub args: Vec<String>,
}

/// Builds the batch-mode client invocation for `remote_argv`. An empty or blank remote
/// command is rejected: ssh would otherwise open an interactive shell.
pub fn ssh_invocation(
    connection: &SshConnection,
    remote_argv: &[String],
    trace_id: &str,
) -> Result<SshInvocation, AppError> {
    if remote_argv.iter().all(|arg| arg.trim().is_empty()) {
        return Err(AppError::empty_command(
            "Remote command is empty; refusing to open an interactive session",
            trace_id,
        ));
    }
    let host = connection.host.trim();
    if host.is_empty() {
        return Err(AppError::validation("SSH host is required", trace_id));
    }
    let user = if connection.user.trim().is_empty() {
        crate::app::models::default_ssh_user()
    } else {
        connection.user.trim().to_string()
    };
    let remote = join_remote_command(remote_argv);

    if !connection.password.is_empty() {
        let mut args = vec![
            "-batch".to_string(),
            "-P".to_string(),
            connection.port.to_string(),
            "-l".to_string(),
            user,
            "-pw".to_string(),
            connection.password.clone(),
        ];
        if !connection.hostkey.trim().is_empty() {
            args.push("-hostkey".to_string());
            args.push(connection.hostkey.trim().to_string());
        }
        args.push(host.to_string());
        args.push(remote);
        return Ok(SshInvocation {
            client: SshClient::Plink,
            args,
        });
    }

    let mut args = vec!["-p".to_string(), connection.port.to_string()];
    let mut options = vec![
        "BatchMode=yes",
        "NumberOfPasswordPrompts=0",
        "ConnectTimeout=10",
    ];
    if !connection.verify_host_key {
        options.push("StrictHostKeyChecking=no");
        options.push("UserKnownHostsFile=/dev/null");
    }
    for option in options {
        args.push("-o".to_string());
        args.push(option.to_string());
    }
    args.push(format!("{user}@{host}"));
    args.push(remote);
    Ok(SshInvocation {
        client: SshClient::OpenSsh,
        args,
    })
}

/// Joins argv into one remote command line. Arguments that are empty or contain whitespace
/// or quotes are double-quoted.
pub fn join_remote_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            let needs_quotes = arg.is_empty()
                || arg
                    .chars()
                    .any(|ch| ch.is_whitespace() || ch == '"' || ch == '\'');
            if needs_quotes {
                format!("\"{}\"", arg.replace('"', "\\\""))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs adb on a remote host through ssh or plink.
#[derive(Debug, Clone)]
pub struct SshTransport {
    connection: SshConnection,
    remote_adb: String,
}

impl SshTransport {
    pub fn new(connection: SshConnection, remote_adb: &str) -> Self {
        let remote_adb = remote_adb.trim();
        Self {
            connection,
            remote_adb: if remote_adb.is_empty() {
                "adb".to_string()
            } else {
                remote_adb.to_string()
            },
        }
    }

    pub fn connection(&self) -> &SshConnection {
        &self.connection
    }

    fn client_path(&self, client: SshClient, trace_id: &str) -> Result<PathBuf, AppError> {
        let located = match client {
            SshClient::Plink => locate_plink(),
            SshClient::OpenSsh => locate_ssh(),
        };
        located.map_err(|message| {
            warn!(
                trace_id = %trace_id,
                host = %self.connection.host,
                client = ?client,
                "ssh client not available"
            );
            AppError::transport_unavailable(message, trace_id)
        })
    }
}

impl Transport for SshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn describe(&self) -> String {
        format!("ssh:{}", self.connection.display_name())
    }

    fn execute(
        &self,
        args: &[String],
        trace_id: &str,
    ) -> Result<Box<dyn RunningCommand>, AppError> {
        if args.iter().all(|arg| arg.trim().is_empty()) {
            return Err(AppError::empty_command(
                "Remote adb arguments are empty",
                trace_id,
            ));
        }
        let mut remote_argv = Vec::with_capacity(args.len() + 1);
        remote_argv.push(self.remote_adb.clone());
        remote_argv.extend(args.iter().cloned());

        let invocation = ssh_invocation(&self.connection, &remote_argv, trace_id)?;
        let program = self.client_path(invocation.client, trace_id)?;
        debug!(
            trace_id = %trace_id,
            host = %self.connection.host,
            port = self.connection.port,
            client = ?invocation.client,
            "starting remote adb"
        );
        let process = spawn_streaming(&program.to_string_lossy(), &invocation.args, trace_id)?;
        Ok(Box::new(process))
    }
}
