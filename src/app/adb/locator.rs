use std::path::Path;

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

/// Configured tool path, or `default_program` (looked up on `PATH`) when empty.
pub fn resolve_tool_program(configured: &str, default_program: &str) -> String {
    let normalized = normalize_command_path(configured);
    if normalized.is_empty() {
        default_program.to_string()
    } else {
        normalized
    }
}

/// Bare program names are left to `PATH`; explicit paths must exist.
pub fn validate_tool_program(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("tool command is empty".to_string());
    }
    if !program.contains(std::path::MAIN_SEPARATOR) && !program.contains('/') {
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err(format!("{program} must point to an executable file"));
    }
    if !path.exists() {
        return Err(format!("{program}: executable not found at the configured path"));
    }
    Ok(())
}
