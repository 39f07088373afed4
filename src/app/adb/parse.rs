use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::app::models::{DeviceStatus, ProbeResult};

/// Parses `adb devices [-l]` output. The first line is the header and is always dropped;
/// daemon notices (`* daemon started ...`) and lines without a status column are skipped.
pub fn parse_device_status(output: &str) -> ProbeResult {
    let mut devices = Vec::new();
    let mut statuses = HashMap::new();
    let mut saw_header = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('*') {
            continue;
        }
        if !saw_header {
            saw_header = true;
            continue;
        }
        let mut tokens = trimmed.split_whitespace();
        let (Some(device), Some(state)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        if statuses
            .insert(device.to_string(), DeviceStatus::from(state))
            .is_none()
        {
            devices.push(device.to_string());
        }
    }

    ProbeResult { devices, statuses }
}

fn percent_regex() -> &'static Regex {
    static PERCENT: OnceLock<Regex> = OnceLock::new();
    PERCENT.get_or_init(|| Regex::new(r"(\d{1,3})\s*%").expect("valid percent regex"))
}

/// Extracts the first `NN%` value (0..=100) from an install or push line.
pub fn parse_progress_percent(line: &str) -> Option<u8> {
    percent_regex()
        .captures_iter(line)
        .filter_map(|caps| caps[1].parse::<u8>().ok())
        .find(|value| *value <= 100)
}
