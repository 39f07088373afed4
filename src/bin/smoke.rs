use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use adb_fleet_lib::app::config::{load_data, DispatchSettings};
use adb_fleet_lib::app::dispatcher::{DispatchEmitter, DispatchEvent, DispatchRequest, Dispatcher};
use adb_fleet_lib::app::logcat::{LogLevel, LogcatEmitter, LogcatEvent, LogcatManager, LogcatOptions};
use adb_fleet_lib::app::logging::init_logging;
use adb_fleet_lib::app::models::{JobReport, SshConnection};
use adb_fleet_lib::app::prober::probe;
use adb_fleet_lib::app::transport::Transport;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Args {
    serials: Vec<String>,
    command: String,
    reinstall: bool,
    timeout_secs: Option<u64>,
    logcat_secs: Option<u64>,
    logcat_level: Option<String>,
    ssh_host: Option<String>,
    ssh_user: Option<String>,
    ssh_port: Option<u16>,
    json: bool,
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    transport: String,
    devices: Vec<String>,
    checks: Vec<SmokeCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<JobReport>,
}

#[derive(Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: &'static str, // pass|fail|warn|skip
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SmokeCheck {
    fn pass(name: &'static str, start: Instant) -> Self {
        Self {
            name,
            status: "pass",
            duration_ms: start.elapsed().as_millis(),
            error_code: None,
            error: None,
        }
    }

    fn fail(name: &'static str, start: Instant, code: &str, error: String) -> Self {
        Self {
            name,
            status: "fail",
            duration_ms: start.elapsed().as_millis(),
            error_code: Some(code.to_string()),
            error: Some(error),
        }
    }

    fn skip(name: &'static str) -> Self {
        Self {
            name,
            status: "skip",
            duration_ms: 0,
            error_code: None,
            error: None,
        }
    }
}

const USAGE: &str = "Usage: cargo run --bin smoke -- [--serial SERIAL]... [--command CMD] [--reinstall] [--timeout-secs N] [--logcat-secs N] [--logcat-level L] [--ssh-host HOST] [--ssh-user USER] [--ssh-port PORT] [--json]\n";

fn parse_args() -> Result<Args, String> {
    let mut serials: Vec<String> = std::env::var("ANDROID_SERIAL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .into_iter()
        .collect();
    let mut command = "shell getprop ro.product.model".to_string();
    let mut reinstall = false;
    let mut timeout_secs = None;
    let mut logcat_secs = None;
    let mut logcat_level = None;
    let mut ssh_host = None;
    let mut ssh_user = None;
    let mut ssh_port = None;
    let mut json = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => {
                let value = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| "--serial requires a value".to_string())?;
                serials.push(value);
            }
            "--command" => {
                command = it
                    .next()
                    .ok_or_else(|| "--command requires a value".to_string())?;
            }
            "--reinstall" => {
                reinstall = true;
            }
            "--timeout-secs" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--timeout-secs requires a value".to_string())?;
                timeout_secs = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| format!("Invalid --timeout-secs: {value}"))?,
                );
            }
            "--logcat-secs" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--logcat-secs requires a value".to_string())?;
                logcat_secs = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| format!("Invalid --logcat-secs: {value}"))?,
                );
            }
            "--logcat-level" => {
                logcat_level = Some(
                    it.next()
                        .ok_or_else(|| "--logcat-level requires a value".to_string())?,
                );
            }
            "--ssh-host" => {
                ssh_host = Some(
                    it.next()
                        .ok_or_else(|| "--ssh-host requires a value".to_string())?,
                );
            }
            "--ssh-user" => {
                ssh_user = Some(
                    it.next()
                        .ok_or_else(|| "--ssh-user requires a value".to_string())?,
                );
            }
            "--ssh-port" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--ssh-port requires a value".to_string())?;
                ssh_port = Some(
                    value
                        .parse::<u16>()
                        .map_err(|_| format!("Invalid --ssh-port: {value}"))?,
                );
            }
            "--json" => {
                json = true;
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("Unknown arg: {other}")),
        }
    }

    Ok(Args {
        serials,
        command,
        reinstall,
        timeout_secs,
        logcat_secs,
        logcat_level,
        ssh_host,
        ssh_user,
        ssh_port,
        json,
    })
}

fn build_dispatcher(args: &Args, settings: DispatchSettings) -> Dispatcher {
    match &args.ssh_host {
        Some(host) => {
            let user = args.ssh_user.clone().unwrap_or_default();
            let mut connection = SshConnection::new(host.clone(), user);
            if let Some(port) = args.ssh_port {
                connection.port = port;
            }
            Dispatcher::ssh(connection, settings)
        }
        None => Dispatcher::local(settings),
    }
}

fn finish(summary: SmokeSummary, json: bool) -> ! {
    let output = if json {
        serde_json::to_string_pretty(&summary).unwrap_or_else(|_| "{}".to_string())
    } else {
        let mut text = format!(
            "status: {}\ntrace_id: {}\ntransport: {}\ndevices: {}\n",
            summary.status,
            summary.trace_id,
            summary.transport,
            summary.devices.join(", ")
        );
        for check in &summary.checks {
            text.push_str(&format!(
                "  {:<10} {:<5} {}ms{}\n",
                check.name,
                check.status,
                check.duration_ms,
                check
                    .error
                    .as_deref()
                    .map(|err| format!(" ({err})"))
                    .unwrap_or_default()
            ));
        }
        text
    };
    println!("{output}");
    std::process::exit(if summary.status == "pass" { 0 } else { 1 });
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let data = load_data();
    let mut settings = data.settings.clone();
    if let Some(timeout) = args.timeout_secs {
        settings.command_timeout_secs = timeout;
    }
    init_logging(&settings.log_level);

    let trace_id = Uuid::new_v4().to_string();
    let dispatcher = build_dispatcher(&args, settings.clone());
    let transport: Arc<dyn Transport> = dispatcher.transport();
    let mut summary = SmokeSummary {
        tool: "adb_fleet_smoke",
        status: "pass",
        trace_id: trace_id.clone(),
        transport: transport.describe(),
        devices: Vec::new(),
        checks: Vec::new(),
        report: None,
    };

    // probe
    let start = Instant::now();
    let probed = match probe(transport.as_ref(), settings.probe_timeout(), &trace_id) {
        Ok(result) => {
            summary.checks.push(SmokeCheck::pass("probe", start));
            result
        }
        Err(err) => {
            summary
                .checks
                .push(SmokeCheck::fail("probe", start, &err.code, err.error));
            summary.status = "fail";
            finish(summary, args.json);
        }
    };

    let devices = if args.serials.is_empty() {
        probed.connected()
    } else {
        args.serials.clone()
    };
    if devices.is_empty() {
        summary.checks.push(SmokeCheck::fail(
            "dispatch",
            Instant::now(),
            "ERR_VALIDATION",
            "No online adb devices found. Set ANDROID_SERIAL or pass --serial.".to_string(),
        ));
        summary.status = "fail";
        finish(summary, args.json);
    }
    summary.devices = devices.clone();

    // dispatch
    let start = Instant::now();
    let batches = Arc::new(Mutex::new(0usize));
    let batches_emit = Arc::clone(&batches);
    let quiet = args.json;
    let emitter: DispatchEmitter = Arc::new(move |event| match event {
        DispatchEvent::JobStarted { header, .. } if !quiet => println!("{header}"),
        DispatchEvent::Output { device, line, .. } if !quiet => println!("[{device}] {line}"),
        DispatchEvent::DeviceFinished { summary, .. } if !quiet => println!("{}", summary.text),
        DispatchEvent::BatchComplete { .. } => {
            if let Ok(mut count) = batches_emit.lock() {
                *count += 1;
            }
        }
        _ => {}
    });
    let request = DispatchRequest {
        devices: devices.clone(),
        command: args.command.clone(),
        reinstall: args.reinstall,
        trace_id: Some(trace_id.clone()),
    };
    match dispatcher
        .dispatch_with(request, emitter)
        .and_then(|job| job.wait())
    {
        Ok(report) => {
            let batch_count = batches.lock().map(|count| *count).unwrap_or_default();
            if batch_count != 1 {
                summary.checks.push(SmokeCheck::fail(
                    "dispatch",
                    start,
                    "ERR_SYSTEM",
                    format!("batch complete fired {batch_count} times"),
                ));
                summary.status = "fail";
            } else if report.failed.is_empty() {
                summary.checks.push(SmokeCheck::pass("dispatch", start));
            } else {
                summary.checks.push(SmokeCheck::fail(
                    "dispatch",
                    start,
                    "ERR_PROCESS_FAILURE",
                    format!("failed on {}", report.failed.join(", ")),
                ));
                summary.status = "fail";
            }
            summary.report = Some(report);
        }
        Err(err) => {
            summary
                .checks
                .push(SmokeCheck::fail("dispatch", start, &err.code, err.error));
            summary.status = "fail";
        }
    }

    // logcat
    match args.logcat_secs {
        Some(secs) => {
            let start = Instant::now();
            let level = args
                .logcat_level
                .as_deref()
                .map(|level| LogLevel::parse(level, &trace_id))
                .unwrap_or_else(|| {
                    LogcatOptions::from_settings(&settings, &trace_id).map(|options| options.level)
                });
            let (tx, rx) = mpsc::channel();
            let emitter: LogcatEmitter = Arc::new(move |event| {
                let _ = tx.send(event);
            });
            let mut manager = LogcatManager::new(Arc::clone(&transport));
            let started = level.and_then(|level| {
                manager.start(
                    &devices[0],
                    LogcatOptions {
                        level,
                        output_file: None,
                    },
                    emitter,
                    &trace_id,
                )
            });
            match started {
                Ok(_) => {
                    std::thread::sleep(Duration::from_secs(secs));
                    let _ = manager.stop(&devices[0], &trace_id);
                    let events: Vec<LogcatEvent> = rx.try_iter().collect();
                    let lines: usize = events
                        .iter()
                        .map(|event| match event {
                            LogcatEvent::Lines { lines, .. } => lines.len(),
                            _ => 0,
                        })
                        .sum();
                    let finished = events
                        .iter()
                        .filter(|event| matches!(event, LogcatEvent::Finished { .. }))
                        .count();
                    if finished == 1 {
                        if !quiet {
                            println!("logcat: {lines} lines in {secs}s");
                        }
                        summary.checks.push(SmokeCheck::pass("logcat", start));
                    } else {
                        summary.checks.push(SmokeCheck::fail(
                            "logcat",
                            start,
                            "ERR_SYSTEM",
                            format!("expected one finished event, got {finished}"),
                        ));
                        summary.status = "fail";
                    }
                }
                Err(err) => {
                    summary
                        .checks
                        .push(SmokeCheck::fail("logcat", start, &err.code, err.error));
                    summary.status = "fail";
                }
            }
        }
        None => summary.checks.push(SmokeCheck::skip("logcat")),
    }

    finish(summary, args.json);
}
