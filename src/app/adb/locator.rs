use std::path::{Path, PathBuf};

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

pub fn resolve_adb_program(config_command_path: &str) -> String {
    let normalized = normalize_command_path(config_command_path);
    if normalized.is_empty() {
        "adb".to_string()
    } else {
        normalized
    }
}

/// Finds the adb executable: an explicit path must exist; a bare name is searched on PATH
/// and then in the working directory.
pub fn locate_adb(program: &str) -> Result<PathBuf, String> {
    if program.trim().is_empty() {
        return Err("ADB command is empty".to_string());
    }
    let path = Path::new(program);
    if path.components().count() > 1 || path.is_absolute() {
        if path.is_dir() {
            return Err("ADB path must point to an executable file".to_string());
        }
        if !path.exists() {
            return Err(format!("ADB executable not found at {program}"));
        }
        return Ok(path.to_path_buf());
    }
    if let Ok(found) = which::which(program) {
        return Ok(found);
    }
    let cwd_candidates = [program.to_string(), format!("{program}.exe")];
    for candidate in cwd_candidates {
        let local = Path::new(&candidate);
        if local.is_file() {
            return Ok(local.to_path_buf());
        }
    }
    Err(format!("ADB executable '{program}' not found in PATH"))
}

/// plink is preferred next to the running executable, then on PATH.
pub fn locate_plink() -> Result<PathBuf, String> {
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        for name in ["plink.exe", "plink"] {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    for name in ["plink.exe", "plink"] {
        if let Ok(found) = which::which(name) {
            return Ok(found);
        }
    }
    Err("plink not found: install PuTTY tools or place plink next to the application".to_string())
}

pub fn locate_ssh() -> Result<PathBuf, String> {
    which::which("ssh").map_err(|_| "OpenSSH client 'ssh' not found in PATH".to_string())
}
