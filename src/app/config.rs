use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::app::error::AppError;
use crate::app::models::{default_ssh_port, default_ssh_user, SshConnection};

pub const DATA_PATH_ENV: &str = "ADB_FLEET_DATA_PATH";

const KEY_DEVICES: &str = "devices";
const KEY_COMMANDS: &str = "commands";
const KEY_DEVICE_GROUPS: &str = "device_groups";
const KEY_SSH_CONNECTIONS: &str = "ssh_connections";
const KEY_SETTINGS: &str = "settings";

const KNOWN_KEYS: [&str; 5] = [
    KEY_DEVICES,
    KEY_COMMANDS,
    KEY_DEVICE_GROUPS,
    KEY_SSH_CONNECTIONS,
    KEY_SETTINGS,
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchSettings {
    pub adb_path: String,
    pub remote_adb: String,
    pub command_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub monitor_interval_secs: u64,
    pub logcat_level: String,
    pub log_level: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            adb_path: String::new(),
            remote_adb: "adb".to_string(),
            command_timeout_secs: 120,
            probe_timeout_secs: 10,
            monitor_interval_secs: 5,
            logcat_level: "V".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl DispatchSettings {
    /// `None` means workers may run indefinitely.
    pub fn command_timeout(&self) -> Option<Duration> {
        if self.command_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.command_timeout_secs))
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }
}

/// The persisted document. Keys this crate does not know about are carried in `extra`
/// and written back untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppData {
    pub devices: Vec<String>,
    pub commands: Vec<String>,
    pub device_groups: BTreeMap<String, String>,
    pub ssh_connections: Vec<SshConnection>,
    pub settings: DispatchSettings,
    pub extra: Map<String, Value>,
}

impl AppData {
    pub fn add_device(&mut self, device: &str) -> bool {
        push_unique(&mut self.devices, device)
    }

    pub fn remove_device(&mut self, device: &str) -> bool {
        let device = device.trim();
        if !remove_value(&mut self.devices, device) {
            return false;
        }
        self.device_groups.remove(device);
        true
    }

    pub fn add_command(&mut self, command: &str) -> bool {
        push_unique(&mut self.commands, command)
    }

    pub fn remove_command(&mut self, command: &str) -> bool {
        remove_value(&mut self.commands, command.trim())
    }
}

fn remove_value(list: &mut Vec<String>, value: &str) -> bool {
    let before = list.len();
    list.retain(|item| item != value);
    list.len() != before
}

fn push_unique(list: &mut Vec<String>, value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() || list.iter().any(|item| item == trimmed) {
        return false;
    }
    list.push(trimmed.to_string());
    true
}

pub fn data_path() -> PathBuf {
    if let Ok(path) = std::env::var(DATA_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".adb_fleet_data.json")
}

pub fn load_data() -> AppData {
    load_data_from_path(&data_path())
}

pub fn save_data(data: &AppData) -> Result<(), AppError> {
    save_data_to_path(data, &data_path())
}

/// Never fails: a missing or corrupt document yields defaults.
pub fn load_data_from_path(path: &Path) -> AppData {
    if !path.exists() {
        return AppData::default();
    }
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read data file; using defaults");
            return AppData::default();
        }
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => data_from_map(map),
        Ok(_) => {
            warn!(path = %path.display(), "data file is not a JSON object; using defaults");
            AppData::default()
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to parse data file; using defaults");
            AppData::default()
        }
    }
}

pub fn save_data_to_path(data: &AppData, path: &Path) -> Result<(), AppError> {
    let mut document = read_existing_object(path);
    for (key, value) in &data.extra {
        if !document.contains_key(key) {
            document.insert(key.clone(), value.clone());
        }
    }
    document.insert(KEY_DEVICES.to_string(), to_value(&data.devices)?);
    document.insert(KEY_COMMANDS.to_string(), to_value(&data.commands)?);
    document.insert(KEY_DEVICE_GROUPS.to_string(), to_value(&data.device_groups)?);
    document.insert(KEY_SSH_CONNECTIONS.to_string(), to_value(&data.ssh_connections)?);
    document.insert(KEY_SETTINGS.to_string(), to_value(&data.settings)?);

    let payload = serde_json::to_string_pretty(&Value::Object(document))
        .map_err(|err| AppError::system(format!("Failed to serialize data: {err}"), ""))?;
    write_atomic(path, payload.as_bytes())?;
    info!(path = %path.display(), devices = data.devices.len(), "saved data file");
    Ok(())
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|err| AppError::system(format!("Failed to serialize data: {err}"), ""))
}

fn read_existing_object(path: &Path) -> Map<String, Value> {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|value| match value {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)
        .map_err(|err| AppError::system(format!("Failed to create data dir: {err}"), ""))?;
    let mut tmp = NamedTempFile::new_in(&dir)
        .map_err(|err| AppError::system(format!("Failed to create temp file: {err}"), ""))?;
    tmp.write_all(bytes)
        .map_err(|err| AppError::system(format!("Failed to write data: {err}"), ""))?;
    tmp.as_file()
        .sync_all()
        .map_err(|err| AppError::system(format!("Failed to sync data: {err}"), ""))?;
    tmp.persist(path)
        .map_err(|err| AppError::system(format!("Failed to replace data file: {}", err.error), ""))?;
    Ok(())
}

fn data_from_map(mut map: Map<String, Value>) -> AppData {
    let devices = map.get(KEY_DEVICES).map(string_list).unwrap_or_default();
    let commands = map.get(KEY_COMMANDS).map(string_list).unwrap_or_default();
    let device_groups = map
        .get(KEY_DEVICE_GROUPS)
        .and_then(Value::as_object)
        .map(|groups| {
            groups
                .iter()
                .filter_map(|(device, label)| {
                    label
                        .as_str()
                        .map(|label| (device.clone(), label.to_string()))
                })
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();
    let ssh_connections = map
        .get(KEY_SSH_CONNECTIONS)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_ssh_connection).collect())
        .unwrap_or_default();
    let settings = map
        .get(KEY_SETTINGS)
        .cloned()
        .and_then(|value| serde_json::from_value::<DispatchSettings>(value).ok())
        .map(validate_settings)
        .unwrap_or_default();

    for key in KNOWN_KEYS {
        map.remove(key);
    }

    AppData {
        devices,
        commands,
        device_groups,
        ssh_connections,
        settings,
        extra: map,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_ssh_connection(value: &Value) -> Option<SshConnection> {
    let entry = value.as_object()?;
    let host = entry.get("host")?.as_str()?.trim().to_string();
    if host.is_empty() {
        return None;
    }
    let port = match entry.get("port") {
        Some(Value::Number(number)) => u16::try_from(number.as_u64()?).ok()?,
        Some(Value::String(text)) => text.trim().parse::<u16>().ok()?,
        _ => default_ssh_port(),
    };
    let text = |key: &str| {
        entry
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let user = text("user");
    Some(SshConnection {
        name: text("name"),
        host,
        port,
        user: if user.trim().is_empty() {
            default_ssh_user()
        } else {
            user.trim().to_string()
        },
        password: text("password"),
        hostkey: text("hostkey"),
        verify_host_key: entry
            .get("verify_host_key")
            .and_then(Value::as_bool)
            .unwrap_or(true),
    })
}

fn validate_settings(mut settings: DispatchSettings) -> DispatchSettings {
    let defaults = DispatchSettings::default();
    if settings.remote_adb.trim().is_empty() {
        settings.remote_adb = defaults.remote_adb;
    }
    if settings.probe_timeout_secs == 0 || settings.probe_timeout_secs > 120 {
        settings.probe_timeout_secs = defaults.probe_timeout_secs;
    }
    if settings.monitor_interval_secs == 0 {
        settings.monitor_interval_secs = defaults.monitor_interval_secs;
    }
    if settings.logcat_level.trim().is_empty() {
        settings.logcat_level = defaults.logcat_level;
    }
    if settings.log_level.trim().is_empty() {
        settings.log_level = defaults.log_level;
    }
    settings
}
