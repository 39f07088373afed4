//! Command Builder: turns a free-form command string into a closed verb enum and then
//! into the adb argument vector for one device.

use std::path::{Path, PathBuf};

use crate::app::error::AppError;

pub const REMOTE_TMP_DIR: &str = "/data/local/tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdbVerb {
    Install {
        paths: Vec<String>,
        reinstall: bool,
        flags: Vec<String>,
    },
    Uninstall {
        packages: Vec<String>,
        keep_data: bool,
        flags: Vec<String>,
    },
    Connect {
        target: Option<String>,
    },
    Disconnect {
        target: Option<String>,
    },
    Logcat {
        args: Vec<String>,
    },
    Passthrough {
        tokens: Vec<String>,
    },
}

impl AdbVerb {
    pub fn name(&self) -> &'static str {
        match self {
            AdbVerb::Install { .. } => "install",
            AdbVerb::Uninstall { .. } => "uninstall",
            AdbVerb::Connect { .. } => "connect",
            AdbVerb::Disconnect { .. } => "disconnect",
            AdbVerb::Logcat { .. } => "logcat",
            AdbVerb::Passthrough { .. } => "passthrough",
        }
    }

    /// Streams that never end on their own.
    pub fn is_unbounded(&self) -> bool {
        matches!(self, AdbVerb::Logcat { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub raw: String,
    pub tokens: Vec<String>,
    pub verb: AdbVerb,
}

impl ParsedCommand {
    pub fn parse(spec: &str, trace_id: &str) -> Result<Self, AppError> {
        let raw = spec.trim().to_string();
        let tokens = tokenize(&raw);
        let Some(first) = tokens.first() else {
            return Err(AppError::empty_command("Command is empty", trace_id));
        };
        let args = &tokens[1..];
        let verb = match first.to_lowercase().as_str() {
            "install" => {
                let (flags, paths) = split_flags(args);
                let reinstall = flags.iter().any(|flag| flag.eq_ignore_ascii_case("-r"));
                AdbVerb::Install {
                    paths,
                    reinstall,
                    flags: flags
                        .into_iter()
                        .filter(|flag| !flag.eq_ignore_ascii_case("-r"))
                        .collect(),
                }
            }
            "uninstall" => {
                let (flags, packages) = split_flags(args);
                let keep_data = flags.iter().any(|flag| flag.eq_ignore_ascii_case("-k"));
                AdbVerb::Uninstall {
                    packages,
                    keep_data,
                    flags: flags
                        .into_iter()
                        .filter(|flag| !flag.eq_ignore_ascii_case("-k"))
                        .collect(),
                }
            }
            "connect" => AdbVerb::Connect {
                target: args.first().cloned(),
            },
            "disconnect" => AdbVerb::Disconnect {
                target: args.first().cloned(),
            },
            "logcat" => AdbVerb::Logcat {
                args: args.to_vec(),
            },
            _ => AdbVerb::Passthrough {
                tokens: tokens.clone(),
            },
        };
        Ok(Self { raw, tokens, verb })
    }

    /// Merges an external reinstall toggle with any `-r` flag in the command.
    pub fn with_reinstall(mut self, reinstall: bool) -> Self {
        if let AdbVerb::Install {
            reinstall: current, ..
        } = &mut self.verb
        {
            *current = *current || reinstall;
        }
        self
    }

    pub fn build_argv(&self, device: &str) -> Vec<String> {
        let device = device.trim();
        match &self.verb {
            AdbVerb::Connect { target } | AdbVerb::Disconnect { target } => {
                let verb = self.verb.name().to_string();
                match target {
                    Some(_) => {
                        let mut argv = vec![verb];
                        argv.extend(self.tokens.iter().skip(1).cloned());
                        argv
                    }
                    None if device.is_empty() => vec![verb],
                    None => vec![verb, device.to_string()],
                }
            }
            AdbVerb::Install {
                paths,
                reinstall,
                flags,
            } => {
                let mut argv = device_scope(device);
                argv.push("install".to_string());
                if *reinstall {
                    argv.push("-r".to_string());
                }
                argv.extend(flags.iter().cloned());
                argv.extend(
                    paths
                        .iter()
                        .map(|path| normalize_apk_path(path).to_string_lossy().to_string()),
                );
                argv
            }
            AdbVerb::Uninstall {
                packages,
                keep_data,
                flags,
            } => {
                let mut argv = device_scope(device);
                argv.push("uninstall".to_string());
                if *keep_data {
                    argv.push("-k".to_string());
                }
                argv.extend(flags.iter().cloned());
                argv.extend(packages.iter().cloned());
                argv
            }
            AdbVerb::Logcat { .. } | AdbVerb::Passthrough { .. } => {
                let mut argv = device_scope(device);
                argv.extend(self.tokens.iter().cloned());
                argv
            }
        }
    }
}

/// Convenience for callers that only need the argument vector.
pub fn build(device: &str, spec: &str, trace_id: &str) -> Result<Vec<String>, AppError> {
    Ok(ParsedCommand::parse(spec, trace_id)?.build_argv(device))
}

fn device_scope(device: &str) -> Vec<String> {
    vec!["-s".to_string(), device.to_string()]
}

fn split_flags(args: &[String]) -> (Vec<String>, Vec<String>) {
    args.iter()
        .cloned()
        .partition(|arg| arg.starts_with('-') && arg.len() > 1)
}

/// Shell-like split that keeps quoted segments together. Backslashes outside single quotes
/// are literal so Windows paths survive. Unbalanced quotes fall back to whitespace splitting.
pub fn tokenize(spec: &str) -> Vec<String> {
    match shell_words::split(&escape_backslashes(spec)) {
        Ok(tokens) => tokens,
        Err(_) => spec
            .split_whitespace()
            .map(|token| token.trim_matches(['"', '\'']).to_string())
            .filter(|token| !token.is_empty())
            .collect(),
    }
}

fn escape_backslashes(spec: &str) -> String {
    let mut escaped = String::with_capacity(spec.len());
    let mut in_single = false;
    let mut in_double = false;
    for ch in spec.chars() {
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '\\' if !in_single => {
                escaped.push_str("\\\\");
                continue;
            }
            _ => {}
        }
        escaped.push(ch);
    }
    escaped
}

pub fn normalize_apk_path(path: &str) -> PathBuf {
    let trimmed = path.trim().trim_matches(['"', '\'']);
    if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(trimmed)
}

/// Argument vectors for installing through a remote host: push the APK to the device's tmp
/// dir, `pm install` it, then remove it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInstallPlan {
    pub remote_path: String,
    pub push: Vec<String>,
    pub install: Vec<String>,
    pub cleanup: Vec<String>,
}

pub fn remote_install_plan(
    device: &str,
    local_path: &Path,
    reinstall: bool,
    flags: &[String],
) -> RemoteInstallPlan {
    let file_name = local_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "package.apk".to_string());
    let safe_name: String = file_name
        .chars()
        .map(|ch| if ch.is_whitespace() { '_' } else { ch })
        .collect();
    let remote_path = format!("{REMOTE_TMP_DIR}/{safe_name}");

    let mut push = device_scope(device);
    push.extend([
        "push".to_string(),
        local_path.to_string_lossy().to_string(),
        remote_path.clone(),
    ]);

    let mut install = device_scope(device);
    install.extend(["shell", "pm", "install"].map(String::from));
    if reinstall {
        install.push("-r".to_string());
    }
    install.extend(flags.iter().cloned());
    install.push(remote_path.clone());

    let mut cleanup = device_scope(device);
    cleanup.extend(["shell", "rm", "-f"].map(String::from));
    cleanup.push(remote_path.clone());

    RemoteInstallPlan {
        remote_path,
        push,
        install,
        cleanup,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(device: &str, spec: &str) -> Vec<String> {
        build(device, spec, "trace").expect("build")
    }

    #[test]
    fn empty_command_fails_fast() {
        let err = build("A", "   ", "trace-e").unwrap_err();
        assert_eq!(err.code, crate::app::error::ERR_EMPTY_COMMAND);
        assert_eq!(err.trace_id, "trace-e");
    }

    #[test]
    fn passthrough_is_device_scoped() {
        assert_eq!(
            argv("emulator-5554", "shell getprop ro.product.model"),
            vec!["-s", "emulator-5554", "shell", "getprop", "ro.product.model"]
        );
    }

    #[test]
    fn connect_injects_device_only_without_target() {
        assert_eq!(argv("10.0.0.7:5555", "connect"), vec!["connect", "10.0.0.7:5555"]);
        assert_eq!(
            argv("10.0.0.7:5555", "connect 10.0.0.9:5555"),
            vec!["connect", "10.0.0.9:5555"]
        );
        assert_eq!(argv("10.0.0.7:5555", "DISCONNECT"), vec!["disconnect", "10.0.0.7:5555"]);
    }

    #[test]
    fn reinstall_flag_position_does_not_matter() {
        let after = argv("A", "install /tmp/app.apk -r");
        let before = argv("A", "install -r /tmp/app.apk");
        assert!(after.contains(&"-r".to_string()));
        assert_eq!(after, before);
        assert_eq!(after, vec!["-s", "A", "install", "-r", "/tmp/app.apk"]);
    }

    #[test]
    fn reinstall_toggle_merges_with_flag() {
        let parsed = ParsedCommand::parse("install -g /tmp/app.apk", "t")
            .unwrap()
            .with_reinstall(true);
        assert_eq!(
            parsed.build_argv("A"),
            vec!["-s", "A", "install", "-r", "-g", "/tmp/app.apk"]
        );
    }

    #[test]
    fn quoted_paths_survive_as_one_token() {
        let parsed = ParsedCommand::parse(r#"install "/tmp/My Apps/app.apk""#, "t").unwrap();
        match parsed.verb {
            AdbVerb::Install { paths, .. } => assert_eq!(paths, vec!["/tmp/My Apps/app.apk"]),
            other => panic!("unexpected verb {other:?}"),
        }
    }

    #[test]
    fn windows_paths_keep_backslashes() {
        assert_eq!(
            tokenize(r#"install "C:\Users\qa\my app.apk""#),
            vec!["install", r"C:\Users\qa\my app.apk"]
        );
        assert_eq!(tokenize(r"push C:\tmp\a.txt /sdcard/"), vec!["push", r"C:\tmp\a.txt", "/sdcard/"]);
    }

    #[test]
    fn unbalanced_quotes_fall_back_to_whitespace() {
        assert_eq!(tokenize("shell echo \"hi"), vec!["shell", "echo", "hi"]);
    }

    #[test]
    fn uninstall_keep_data() {
        assert_eq!(
            argv("A", "uninstall -k com.example.app"),
            vec!["-s", "A", "uninstall", "-k", "com.example.app"]
        );
        let parsed = ParsedCommand::parse("uninstall -k", "t").unwrap();
        assert_eq!(
            parsed.verb,
            AdbVerb::Uninstall {
                packages: vec![],
                keep_data: true,
                flags: vec![]
            }
        );
    }

    #[test]
    fn logcat_is_unbounded() {
        let parsed = ParsedCommand::parse("logcat *:W", "t").unwrap();
        assert!(parsed.verb.is_unbounded());
        assert_eq!(parsed.build_argv("A"), vec!["-s", "A", "logcat", "*:W"]);
    }

    #[test]
    fn remote_plan_pushes_installs_and_cleans_up() {
        let plan = remote_install_plan("A", Path::new("/tmp/My App.apk"), true, &[]);
        assert_eq!(plan.remote_path, "/data/local/tmp/My_App.apk");
        assert_eq!(plan.push, vec!["-s", "A", "push", "/tmp/My App.apk", "/data/local/tmp/My_App.apk"]);
        assert_eq!(
            plan.install,
            vec!["-s", "A", "shell", "pm", "install", "-r", "/data/local/tmp/My_App.apk"]
        );
        assert_eq!(
            plan.cleanup,
            vec!["-s", "A", "shell", "rm", "-f", "/data/local/tmp/My_App.apk"]
        );
    }
}
